use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::CacheConfig;
use crate::providers::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage};
use crate::store::{KvStore, StoreError};

pub const CACHE_PREFIX: &str = "cache:chat:";

/// 只有这四个字段参与缓存键
#[derive(Serialize)]
struct CacheKeyData<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

pub fn cache_key(request: &ChatCompletionRequest) -> String {
    let data = CacheKeyData {
        model: &request.model,
        messages: &request.messages,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    };
    let json = serde_json::to_vec(&data).unwrap_or_default();
    let digest = hex::encode(Sha256::digest(&json));
    format!("{CACHE_PREFIX}{}", &digest[..32])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub enabled: bool,
    pub key_count: u64,
}

/// 非流式响应缓存；读写失败只记日志，不影响请求
pub struct ResponseCache {
    store: Arc<dyn KvStore>,
    config: CacheConfig,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn eligible(&self, request: &ChatCompletionRequest) -> bool {
        self.config.enabled && !request.is_stream() && request.cache_allowed()
    }

    /// 未指定（或为 0）时用默认 TTL，且不超过上限
    pub fn ttl_for(&self, request: &ChatCompletionRequest) -> Duration {
        let ttl = request
            .cache_ttl
            .filter(|t| *t > 0)
            .unwrap_or(self.config.ttl_seconds)
            .min(self.config.max_ttl_seconds);
        Duration::from_secs(ttl)
    }

    pub async fn get(&self, request: &ChatCompletionRequest) -> Option<ChatCompletionResponse> {
        if !self.eligible(request) {
            return None;
        }
        let key = cache_key(request);
        match self.store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(resp) => Some(resp),
                Err(e) => {
                    tracing::warn!(key = %key, "discarding undecodable cache entry: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %key, "cache get error: {}", e);
                None
            }
        }
    }

    pub async fn set(&self, request: &ChatCompletionRequest, response: &ChatCompletionResponse) {
        if !self.eligible(request) {
            return;
        }
        let ttl = self.ttl_for(request);
        if ttl.is_zero() {
            return;
        }
        let key = cache_key(request);
        let raw = match serde_json::to_string(response) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key = %key, "cache encode error: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.set_ex(&key, raw, ttl).await {
            tracing::warn!(key = %key, "cache set error: {}", e);
        }
    }

    /// 按哈希前缀清理；不给前缀时清空全部响应缓存
    pub async fn invalidate(&self, prefix: Option<&str>) -> Result<u64, StoreError> {
        let pattern = format!("{CACHE_PREFIX}{}", prefix.unwrap_or(""));
        let removed = self.store.delete_prefix(&pattern).await?;
        tracing::info!(prefix = %pattern, removed, "cache invalidated");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats, StoreError> {
        Ok(CacheStats {
            enabled: self.config.enabled,
            key_count: self.store.count_prefix(CACHE_PREFIX).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn request(text: &str) -> ChatCompletionRequest {
        ChatCompletionRequest::new("gpt-4o", vec![ChatMessage::user(text)])
    }

    fn response() -> ChatCompletionResponse {
        ChatCompletionResponse::single("id-1", "gpt-4o", "hello", Some("stop".into()), None)
    }

    fn cache(config: CacheConfig) -> (Arc<ManualClock>, ResponseCache) {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (clock, ResponseCache::new(store, config))
    }

    #[test]
    fn key_ignores_routing_only_fields() {
        let base = request("hi");
        let mut other = base.clone();
        other.fallback_models = Some(vec!["claude-3-haiku".into()]);
        other.stream = Some(true);
        other.cache = Some(false);
        other.cache_ttl = Some(5);
        assert_eq!(cache_key(&base), cache_key(&other));

        let mut hotter = base.clone();
        hotter.temperature = Some(0.9);
        assert_ne!(cache_key(&base), cache_key(&hotter));
        let mut shorter = base.clone();
        shorter.max_tokens = Some(10);
        assert_ne!(cache_key(&base), cache_key(&shorter));
        assert_ne!(cache_key(&base), cache_key(&request("hello")));
        assert_ne!(cache_key(&base), cache_key(&base.with_model("gpt-4o-mini")));

        let key = cache_key(&base);
        assert!(key.starts_with(CACHE_PREFIX));
        assert_eq!(key.len(), CACHE_PREFIX.len() + 32);
    }

    #[tokio::test]
    async fn round_trip_and_expiry() {
        let (clock, cache) = cache(CacheConfig::default());
        let req = request("hi");
        assert!(cache.get(&req).await.is_none());
        cache.set(&req, &response()).await;
        assert_eq!(cache.get(&req).await, Some(response()));

        clock.advance(3_600_000);
        assert!(cache.get(&req).await.is_none());
    }

    #[tokio::test]
    async fn stream_and_opt_out_bypass_the_cache() {
        let (_clock, cache) = cache(CacheConfig::default());
        let req = request("hi");
        cache.set(&req, &response()).await;

        let mut streaming = req.clone();
        streaming.stream = Some(true);
        assert!(cache.get(&streaming).await.is_none());

        let mut opted_out = request("other");
        opted_out.cache = Some(false);
        cache.set(&opted_out, &response()).await;
        assert!(cache.get(&opted_out).await.is_none());
        opted_out.cache = None;
        assert!(cache.get(&opted_out).await.is_none());
    }

    #[tokio::test]
    async fn disabled_cache_never_stores() {
        let (_clock, cache) = cache(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        let req = request("hi");
        cache.set(&req, &response()).await;
        assert!(cache.get(&req).await.is_none());
        assert_eq!(cache.stats().await.unwrap(), CacheStats { enabled: false, key_count: 0 });
    }

    #[test]
    fn ttl_is_capped() {
        let (_clock, cache) = cache(CacheConfig {
            enabled: true,
            ttl_seconds: 3600,
            max_ttl_seconds: 7200,
        });
        let mut req = request("hi");
        assert_eq!(cache.ttl_for(&req), Duration::from_secs(3600));
        req.cache_ttl = Some(60);
        assert_eq!(cache.ttl_for(&req), Duration::from_secs(60));
        req.cache_ttl = Some(100_000);
        assert_eq!(cache.ttl_for(&req), Duration::from_secs(7200));
        req.cache_ttl = Some(0);
        assert_eq!(cache.ttl_for(&req), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn invalidate_by_prefix() {
        let (_clock, cache) = cache(CacheConfig::default());
        let a = request("a");
        let b = request("b");
        cache.set(&a, &response()).await;
        cache.set(&b, &response()).await;
        assert_eq!(cache.stats().await.unwrap().key_count, 2);

        let hash_a = cache_key(&a)[CACHE_PREFIX.len()..].to_string();
        assert_eq!(cache.invalidate(Some(&hash_a[..8])).await.unwrap(), 1);
        assert!(cache.get(&a).await.is_none());
        assert!(cache.get(&b).await.is_some());

        assert_eq!(cache.invalidate(None).await.unwrap(), 1);
        assert_eq!(cache.stats().await.unwrap().key_count, 0);
    }
}
