use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::providers::{ChatCompletionRequest, ChatCompletionResponse};
use crate::routing::RequestMetadata;

/// 请求终态时投递给 logger 的一条记录
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub metadata: RequestMetadata,
    pub request: Option<ChatCompletionRequest>,
    pub response: Option<ChatCompletionResponse>,
}

/// 落库后的请求日志
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLog {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub metadata: RequestMetadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStats {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub avg_latency: f64,
    /// 状态码 >= 400 的占比
    pub error_rate: f64,
}

/// 请求体日志文件的内容
#[derive(Debug, Serialize)]
pub(crate) struct BodyLogFile<'a> {
    pub metadata: &'a RequestMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<&'a ChatCompletionRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<&'a ChatCompletionResponse>,
    pub timestamp: String,
}
