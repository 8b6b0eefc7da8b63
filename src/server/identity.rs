use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::config::Settings;
use crate::error::{GatewayError, Result};
use crate::server::util::{api_key_header, bearer_token};

/// 调用方 API key 解析后的身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyIdentity {
    pub api_key_id: String,
    pub organization_id: String,
    pub plan: String,
}

impl ApiKeyIdentity {
    /// 未配置任何 key 时的本地开发身份
    pub fn anonymous() -> Self {
        Self {
            api_key_id: "test-key".to_string(),
            organization_id: "default-org".to_string(),
            plan: "FREE".to_string(),
        }
    }
}

/// API key 鉴权的边界（外部系统负责 key 的签发和存储）
#[async_trait]
pub trait ApiKeyDirectory: Send + Sync {
    async fn lookup(&self, token: &str) -> Result<Option<ApiKeyIdentity>>;

    /// 是否允许不带 key 的请求以 [`ApiKeyIdentity::anonymous`] 运行
    fn allows_anonymous(&self) -> bool {
        false
    }
}

/// 从配置文件加载的静态 key 表
#[derive(Debug, Default)]
pub struct StaticApiKeyDirectory {
    keys: HashMap<String, ApiKeyIdentity>,
    require_api_key: bool,
}

impl StaticApiKeyDirectory {
    pub fn from_settings(settings: &Settings) -> Self {
        let keys = settings
            .api_keys
            .iter()
            .map(|entry| {
                (
                    entry.key.clone(),
                    ApiKeyIdentity {
                        api_key_id: entry.id.clone(),
                        organization_id: entry.organization_id.clone(),
                        plan: entry.plan.clone(),
                    },
                )
            })
            .collect();
        Self {
            keys,
            require_api_key: settings.server.require_api_key,
        }
    }
}

#[async_trait]
impl ApiKeyDirectory for StaticApiKeyDirectory {
    async fn lookup(&self, token: &str) -> Result<Option<ApiKeyIdentity>> {
        Ok(self.keys.get(token).cloned())
    }

    fn allows_anonymous(&self) -> bool {
        self.keys.is_empty() && !self.require_api_key
    }
}

/// `Authorization: Bearer` 优先，其次 `X-Api-Key`
pub async fn authenticate(directory: &dyn ApiKeyDirectory, headers: &HeaderMap) -> Result<ApiKeyIdentity> {
    if directory.allows_anonymous() {
        return Ok(ApiKeyIdentity::anonymous());
    }
    let token = bearer_token(headers)
        .or_else(|| api_key_header(headers))
        .ok_or_else(|| GatewayError::Unauthorized("missing API key".into()))?;

    directory
        .lookup(&token)
        .await?
        .ok_or_else(|| GatewayError::Unauthorized("invalid API key".into()))
}
