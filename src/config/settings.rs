use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use crate::error::{GatewayError, Result};
use crate::providers::ProviderId;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub providers: ProvidersConfig,
    pub logging: LoggingConfig,
    pub store: StoreConfig,
    /// provider 名称 -> 兜底 API key（通常来自 `<PROVIDER>_API_KEY`）
    pub provider_keys: HashMap<String, String>,
    /// provider 名称 -> base url 覆盖
    pub provider_urls: HashMap<String, String>,
    pub api_keys: Vec<ApiKeyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub require_api_key: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            require_api_key: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub max_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 3600,
            max_ttl_seconds: 86400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub threshold: u32,
    pub timeout_ms: u64,
    /// 半开状态下只放行一个探测请求（默认关闭）
    pub half_open_single_probe: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            timeout_ms: 60_000,
            half_open_single_probe: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// 每次尝试的 chunk 先缓冲，尝试成功后再整体下发
    #[default]
    Buffered,
    /// chunk 实时下发；一旦有 chunk 到达调用方即锁定该候选
    FirstChunk,
}

impl FromStr for StreamMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buffered" => Ok(StreamMode::Buffered),
            "first_chunk" | "first-chunk" => Ok(StreamMode::FirstChunk),
            other => Err(GatewayError::Config(format!(
                "unknown stream mode '{other}' (expected buffered or first_chunk)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub timeout_ms: u64,
    pub retries: u32,
    pub retry_base_delay_ms: u64,
    /// 整条候选链的总预算，未配置时不限制
    pub total_deadline_ms: Option<u64>,
    pub stream_mode: StreamMode,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            retries: 2,
            retry_base_delay_ms: 1000,
            total_deadline_ms: None,
            stream_mode: StreamMode::Buffered,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub database_path: String,
    pub log_bodies: bool,
    pub log_dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            database_path: "data/gateway.db".to_string(),
            log_bodies: true,
            log_dir: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub key: String,
    pub id: String,
    #[serde(default = "default_org")]
    pub organization_id: String,
    #[serde(default = "default_plan")]
    pub plan: String,
}

fn default_org() -> String {
    "default-org".to_string()
}

fn default_plan() -> String {
    "FREE".to_string()
}

impl Settings {
    /// 默认值 -> 配置文件 -> .env -> 进程环境变量
    pub fn load() -> Result<Self> {
        let mut settings = match Self::find_config_file() {
            Some(path) => {
                let content = std::fs::read_to_string(&path)?;
                toml::from_str::<Settings>(&content)
                    .map_err(|e| GatewayError::Config(format!("{path}: {e}")))?
            }
            None => Settings::default(),
        };

        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!("Failed to load .env: {}", e);
            }
        }

        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    fn find_config_file() -> Option<String> {
        let possible_names = ["custom-config.toml", "config.toml"];

        possible_names
            .iter()
            .find(|name| Path::new(name).exists())
            .map(|name| name.to_string())
    }

    /// 用环境变量覆盖配置；任何无法解析的值都视为配置错误
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = var("HOST") {
            self.server.host = host;
        }
        set_parsed(&var, "PORT", &mut self.server.port)?;
        set_bool(&var, "REQUIRE_API_KEY", &mut self.server.require_api_key)?;

        set_bool(&var, "CACHE_ENABLED", &mut self.cache.enabled)?;
        set_parsed(&var, "CACHE_TTL_SECONDS", &mut self.cache.ttl_seconds)?;
        set_parsed(&var, "CACHE_MAX_TTL_SECONDS", &mut self.cache.max_ttl_seconds)?;

        set_parsed(&var, "CIRCUIT_BREAKER_THRESHOLD", &mut self.circuit_breaker.threshold)?;
        set_parsed(&var, "CIRCUIT_BREAKER_TIMEOUT", &mut self.circuit_breaker.timeout_ms)?;
        set_parsed(&var, "CIRCUIT_BREAKER_TIMEOUT_MS", &mut self.circuit_breaker.timeout_ms)?;
        set_bool(
            &var,
            "CIRCUIT_BREAKER_HALF_OPEN_SINGLE_PROBE",
            &mut self.circuit_breaker.half_open_single_probe,
        )?;

        set_parsed(&var, "PROVIDER_TIMEOUT_MS", &mut self.providers.timeout_ms)?;
        set_parsed(&var, "PROVIDER_RETRIES", &mut self.providers.retries)?;
        set_parsed(
            &var,
            "PROVIDER_RETRY_BASE_DELAY_MS",
            &mut self.providers.retry_base_delay_ms,
        )?;
        if let Some(raw) = var("PROVIDER_TOTAL_DEADLINE_MS") {
            self.providers.total_deadline_ms = Some(parse_value("PROVIDER_TOTAL_DEADLINE_MS", &raw)?);
        }
        if let Some(raw) = var("PROVIDER_STREAM_MODE") {
            self.providers.stream_mode = raw.parse()?;
        }

        set_bool(&var, "LOG_BODIES", &mut self.logging.log_bodies)?;
        if let Some(dir) = var("LOG_DIR") {
            self.logging.log_dir = dir;
        }
        if let Some(path) = var("DATABASE_PATH") {
            self.logging.database_path = path;
        }
        if let Some(url) = var("REDIS_URL") {
            self.store.redis_url = Some(url);
        }

        for provider in ProviderId::ALL {
            let upper = provider.as_str().to_ascii_uppercase();
            if let Some(key) = var(&format!("{upper}_API_KEY")) {
                self.provider_keys.insert(provider.as_str().to_string(), key);
            }
            if let Some(url) = var(&format!("{upper}_BASE_URL")) {
                self.provider_urls.insert(provider.as_str().to_string(), url);
            }
        }

        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| GatewayError::Config(format!("invalid value for {key}: '{raw}'")))
}

fn set_parsed<T, F>(var: &F, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(key) {
        *slot = parse_value(key, &raw)?;
    }
    Ok(())
}

fn set_bool<F>(var: &F, key: &str, slot: &mut bool) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(key) {
        *slot = match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(GatewayError::Config(format!(
                    "invalid boolean for {key}: '{raw}'"
                )));
            }
        };
    }
    Ok(())
}
