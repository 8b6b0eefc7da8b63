use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{RequestLog, RequestStats};
use crate::error::Result;
use crate::routing::RequestMetadata;

/// 请求日志的持久化后端
#[async_trait]
pub trait RequestLogStore: Send + Sync {
    async fn append(&self, metadata: &RequestMetadata) -> Result<()>;

    /// 最新的在前
    async fn recent(&self, limit: u32) -> Result<Vec<RequestLog>>;

    async fn stats(&self, api_key_id: &str, since: DateTime<Utc>) -> Result<RequestStats>;

    /// 删除 `cutoff` 之前的记录，返回删除条数
    async fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
