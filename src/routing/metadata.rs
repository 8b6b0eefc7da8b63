use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::model_tiers::calculate_cost;
use crate::providers::{ProviderId, Usage};

/// 一次请求的调用上下文，由入口处构造后只读传入路由
#[derive(Debug, Clone, Default)]
pub struct RouteContext {
    pub request_id: String,
    pub api_key_id: String,
    pub organization_id: String,
    /// `X-Provider-Key`，优先于其它凭据来源
    pub provider_key_override: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// 客户端断开时取消，路由随即中止整条候选链
    pub cancel: CancellationToken,
}

/// 单个请求的遥测记录：请求开始时创建，路由过程中就地更新，终态时整体交给 logger 一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    pub request_id: String,
    pub api_key_id: String,
    pub provider: String,
    pub model: String,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    pub cached: bool,
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_provider: Option<String>,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl RequestMetadata {
    pub fn start(ctx: &RouteContext, model: &str, start_time: i64) -> Self {
        Self {
            request_id: ctx.request_id.clone(),
            api_key_id: ctx.api_key_id.clone(),
            provider: String::new(),
            model: model.to_string(),
            start_time,
            end_time: None,
            latency_ms: None,
            input_tokens: None,
            output_tokens: None,
            total_tokens: None,
            cost: None,
            cached: false,
            fallback_used: false,
            fallback_provider: None,
            status_code: 200,
            error_message: None,
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
        }
    }

    /// 记录实际使用的候选；`chain_index > 0` 即发生了 fallback
    pub fn select_candidate(&mut self, provider: ProviderId, model: &str, chain_index: usize) {
        self.provider = provider.as_str().to_string();
        self.model = model.to_string();
        self.fallback_used = chain_index > 0;
        self.fallback_provider = self.fallback_used.then(|| provider.as_str().to_string());
    }

    /// 用量与成本按实际使用的模型计算
    pub fn record_usage(&mut self, usage: Option<Usage>) {
        if let Some(u) = usage {
            self.input_tokens = Some(u.prompt_tokens);
            self.output_tokens = Some(u.completion_tokens);
            self.total_tokens = Some(u.total_tokens);
            self.cost = Some(calculate_cost(&self.model, u.prompt_tokens, u.completion_tokens));
        }
    }

    pub fn mark_cached(&mut self) {
        self.provider = "cache".to_string();
        self.cached = true;
    }

    pub fn fail(&mut self, status_code: u16, message: impl Into<String>) {
        self.status_code = status_code;
        self.error_message = Some(message.into());
    }

    pub fn finish(&mut self, end_time: i64) {
        self.end_time = Some(end_time);
        self.latency_ms = Some((end_time - self.start_time).max(0));
    }
}
