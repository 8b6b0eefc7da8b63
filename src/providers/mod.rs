pub mod anthropic;
pub mod cohere;
pub mod error;
pub mod google;
pub mod openai;
pub mod streaming;
pub mod types;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;

pub use anthropic::AnthropicProvider;
pub use cohere::CohereProvider;
pub use error::{FailureClass, ProviderError, ProviderErrorKind};
pub use google::GoogleProvider;
pub use openai::OpenAICompatibleProvider;
pub use streaming::ChunkSink;
pub use types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, Role, StreamChunk, Usage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAI,
    Anthropic,
    Google,
    Groq,
    Mistral,
    Together,
    Perplexity,
    Cohere,
}

impl ProviderId {
    /// 注册顺序，也是 `supports_model` 扫描的顺序
    pub const ALL: [ProviderId; 8] = [
        ProviderId::OpenAI,
        ProviderId::Anthropic,
        ProviderId::Google,
        ProviderId::Groq,
        ProviderId::Mistral,
        ProviderId::Together,
        ProviderId::Perplexity,
        ProviderId::Cohere,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenAI => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Google => "google",
            ProviderId::Groq => "groq",
            ProviderId::Mistral => "mistral",
            ProviderId::Together => "together",
            ProviderId::Perplexity => "perplexity",
            ProviderId::Cohere => "cohere",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderId::OpenAI => "OpenAI",
            ProviderId::Anthropic => "Anthropic",
            ProviderId::Google => "Google",
            ProviderId::Groq => "Groq",
            ProviderId::Mistral => "Mistral",
            ProviderId::Together => "Together",
            ProviderId::Perplexity => "Perplexity",
            ProviderId::Cohere => "Cohere",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderId::OpenAI => "https://api.openai.com/v1",
            ProviderId::Anthropic => "https://api.anthropic.com/v1",
            ProviderId::Google => "https://generativelanguage.googleapis.com/v1beta",
            ProviderId::Groq => "https://api.groq.com/openai/v1",
            ProviderId::Mistral => "https://api.mistral.ai/v1",
            ProviderId::Together => "https://api.together.xyz/v1",
            ProviderId::Perplexity => "https://api.perplexity.ai",
            ProviderId::Cohere => "https://api.cohere.ai/v1",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderId::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown provider '{s}'"))
    }
}

/// 单次上游调用的参数
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub api_key: String,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    /// 构造时刻 + `timeout`；连接、读流共用这一个截止点
    deadline: Instant,
}

impl RequestOptions {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            api_key: api_key.into(),
            timeout,
            cancel: CancellationToken::new(),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// 名称前缀互相匹配（大小写不敏感）
pub fn prefix_match(models: &[&str], model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    models.iter().any(|m| {
        let m = m.to_ascii_lowercase();
        model.starts_with(&m) || m.starts_with(&model)
    })
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> ProviderId;

    fn models(&self) -> &[&'static str];

    fn supports_model(&self, model: &str) -> bool {
        prefix_match(self.models(), model)
    }

    async fn chat(
        &self,
        request: &ChatCompletionRequest,
        opts: &RequestOptions,
    ) -> Result<ChatCompletionResponse, ProviderError>;

    /// 按到达顺序把 chunk 推给 `sink`，正常结束时返回上游报告的用量
    async fn chat_stream(
        &self,
        request: &ChatCompletionRequest,
        opts: &RequestOptions,
        sink: &mut dyn ChunkSink,
    ) -> Result<Option<Usage>, ProviderError>;
}

/// 给一次完整的上游调用套上超时和取消；future 被丢弃时底层连接随之释放
pub(crate) async fn with_deadline<F, T>(
    provider: ProviderId,
    opts: &RequestOptions,
    fut: F,
) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::select! {
        biased;
        _ = opts.cancel.cancelled() => Err(ProviderError::cancelled(provider)),
        _ = tokio::time::sleep_until(opts.deadline()) => Err(ProviderError::timeout(provider, opts.timeout)),
        result = fut => result,
    }
}

/// 启动时构建一次，之后只读
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<ProviderId, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, reqwest::Error> {
        let mut registry = Self::new();
        let url = |id: ProviderId| settings.provider_urls.get(id.as_str()).cloned();

        for id in [
            ProviderId::OpenAI,
            ProviderId::Groq,
            ProviderId::Mistral,
            ProviderId::Together,
            ProviderId::Perplexity,
        ] {
            registry.register(Arc::new(OpenAICompatibleProvider::new(id, url(id))?));
        }
        registry.register(Arc::new(AnthropicProvider::new(url(ProviderId::Anthropic))?));
        registry.register(Arc::new(GoogleProvider::new(url(ProviderId::Google))?));
        registry.register(Arc::new(CohereProvider::new(url(ProviderId::Cohere))?));
        Ok(registry)
    }

    /// 同一 provider 重复注册时后者覆盖前者
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.id(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&id).cloned()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn ProviderAdapter>> {
        self.adapters.values()
    }

    pub fn ids(&self) -> Vec<ProviderId> {
        self.adapters.keys().copied().collect()
    }

    pub fn find_supporting(&self, model: &str) -> Option<ProviderId> {
        self.adapters
            .values()
            .find(|a| a.supports_model(model))
            .map(|a| a.id())
    }
}
