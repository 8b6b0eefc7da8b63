use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::Result;
use crate::providers::ProviderId;

/// 组织级 provider 凭据的来源（已解密的明文 key）
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn provider_key(&self, organization_id: &str, provider: ProviderId) -> Result<Option<String>>;
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    keys: RwLock<HashMap<(String, ProviderId), String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同一组织同一 provider 只保留一个默认 key，后写覆盖
    pub fn insert(&self, organization_id: &str, provider: ProviderId, key: impl Into<String>) {
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((organization_id.to_string(), provider), key.into());
    }

    pub fn remove(&self, organization_id: &str, provider: ProviderId) -> bool {
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(organization_id.to_string(), provider))
            .is_some()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn provider_key(&self, organization_id: &str, provider: ProviderId) -> Result<Option<String>> {
        Ok(self
            .keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(organization_id.to_string(), provider))
            .cloned())
    }
}

/// 解析顺序：请求头覆盖 -> 组织凭据 -> 配置/环境变量兜底
pub struct CredentialResolver {
    store: Arc<dyn CredentialStore>,
    fallback: HashMap<ProviderId, String>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn CredentialStore>, provider_keys: &HashMap<String, String>) -> Self {
        let fallback = provider_keys
            .iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .filter_map(|(k, v)| k.parse::<ProviderId>().ok().map(|id| (id, v.clone())))
            .collect();
        Self { store, fallback }
    }

    pub async fn resolve(
        &self,
        provider: ProviderId,
        organization_id: &str,
        header_key: Option<&str>,
    ) -> Option<String> {
        if let Some(key) = header_key.map(str::trim).filter(|k| !k.is_empty()) {
            return Some(key.to_string());
        }

        match self.store.provider_key(organization_id, provider).await {
            Ok(Some(key)) if !key.is_empty() => return Some(key),
            Ok(_) => {}
            Err(e) => {
                // 凭据存储不可用时继续尝试兜底 key
                tracing::warn!(provider = %provider, organization_id, "credential lookup failed: {}", e);
            }
        }

        self.fallback.get(&provider).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(store: Arc<MemoryCredentialStore>) -> CredentialResolver {
        let mut env = HashMap::new();
        env.insert("openai".to_string(), "sk-env".to_string());
        env.insert("anthropic".to_string(), "  ".to_string());
        env.insert("bedrock".to_string(), "ignored".to_string());
        CredentialResolver::new(store, &env)
    }

    #[tokio::test]
    async fn header_then_store_then_env() {
        let store = Arc::new(MemoryCredentialStore::new());
        let r = resolver(store.clone());

        assert_eq!(r.resolve(ProviderId::OpenAI, "org_1", None).await.as_deref(), Some("sk-env"));

        store.insert("org_1", ProviderId::OpenAI, "sk-org");
        assert_eq!(r.resolve(ProviderId::OpenAI, "org_1", None).await.as_deref(), Some("sk-org"));
        // 其它组织看不到该 key
        assert_eq!(r.resolve(ProviderId::OpenAI, "org_2", None).await.as_deref(), Some("sk-env"));

        assert_eq!(
            r.resolve(ProviderId::OpenAI, "org_1", Some("sk-header")).await.as_deref(),
            Some("sk-header")
        );
        assert_eq!(
            r.resolve(ProviderId::OpenAI, "org_1", Some("")).await.as_deref(),
            Some("sk-org")
        );
    }

    #[tokio::test]
    async fn blank_env_keys_do_not_count() {
        let r = resolver(Arc::new(MemoryCredentialStore::new()));
        assert_eq!(r.resolve(ProviderId::Anthropic, "org_1", None).await, None);
        assert_eq!(r.resolve(ProviderId::Cohere, "org_1", None).await, None);
    }

    #[tokio::test]
    async fn remove_drops_org_key() {
        let store = Arc::new(MemoryCredentialStore::new());
        store.insert("org_1", ProviderId::Groq, "gsk");
        assert!(store.remove("org_1", ProviderId::Groq));
        assert!(!store.remove("org_1", ProviderId::Groq));
        assert_eq!(store.provider_key("org_1", ProviderId::Groq).await.unwrap(), None);
    }
}
