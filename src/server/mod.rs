pub mod handlers;
pub mod identity;
pub(crate) mod util;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderName, Method, header};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::cache::ResponseCache;
use crate::clock::{SharedClock, SystemClock};
use crate::config::Settings;
use crate::credentials::{CredentialResolver, CredentialStore, MemoryCredentialStore};
use crate::error::Result as AppResult;
use crate::events::{EventSink, TracingEventSink};
use crate::logging::{DatabaseLogger, RequestLogStore, RequestLogger};
use crate::providers::ProviderRegistry;
use crate::routing::{CircuitBreaker, PlanLimits, RateLimiter, RouteEngine};
use crate::store::{KvStore, MemoryStore, RedisStore};
use identity::{ApiKeyDirectory, StaticApiKeyDirectory};

const LOG_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60 * 24);

pub struct AppState {
    pub config: Settings,
    pub clock: SharedClock,
    pub store: Arc<dyn KvStore>,
    pub engine: RouteEngine,
    pub breaker: Arc<CircuitBreaker>,
    pub limiter: RateLimiter,
    pub cache: ResponseCache,
    pub logger: RequestLogger,
    pub events: Arc<dyn EventSink>,
    pub api_keys: Arc<dyn ApiKeyDirectory>,
}

/// 组装 [`AppState`] 所需的外部依赖；测试里用内存实现替换
pub struct AppDeps {
    pub clock: SharedClock,
    pub store: Arc<dyn KvStore>,
    pub registry: ProviderRegistry,
    pub credentials: Arc<dyn CredentialStore>,
    pub log_store: Arc<dyn RequestLogStore>,
    pub events: Arc<dyn EventSink>,
    pub api_keys: Arc<dyn ApiKeyDirectory>,
}

impl AppState {
    /// 会启动日志 worker，需要在 tokio 运行时内调用
    pub fn new(config: Settings, deps: AppDeps) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            deps.store.clone(),
            deps.clock.clone(),
            &config.circuit_breaker,
        ));
        let credentials = Arc::new(CredentialResolver::new(deps.credentials, &config.provider_keys));
        let engine = RouteEngine::new(
            Arc::new(deps.registry),
            breaker.clone(),
            credentials,
            deps.events.clone(),
            deps.clock.clone(),
            &config.providers,
        );
        let limiter = RateLimiter::new(deps.store.clone(), deps.clock.clone());
        let cache = ResponseCache::new(deps.store.clone(), config.cache.clone());
        let logger = RequestLogger::spawn(deps.log_store, &config.logging);

        Self {
            config,
            clock: deps.clock,
            store: deps.store,
            engine,
            breaker,
            limiter,
            cache,
            logger,
            events: deps.events,
            api_keys: deps.api_keys,
        }
    }
}

pub async fn create_app(config: Settings) -> AppResult<Router> {
    let clock: SharedClock = Arc::new(SystemClock);

    let store: Arc<dyn KvStore> = match &config.store.redis_url {
        Some(url) => {
            let redis = RedisStore::connect(url).await?;
            tracing::info!("Using Redis for rate limits, circuit state and cache");
            Arc::new(redis)
        }
        None => {
            tracing::info!("REDIS_URL not set, using in-process store");
            Arc::new(MemoryStore::new(clock.clone()))
        }
    };

    let db_logger = Arc::new(DatabaseLogger::new(&config.logging.database_path).await?);
    let registry = ProviderRegistry::from_settings(&config)?;
    let configured = registry.ids().len();

    let deps = AppDeps {
        clock,
        store,
        registry,
        credentials: Arc::new(MemoryCredentialStore::new()),
        log_store: db_logger,
        events: Arc::new(TracingEventSink),
        api_keys: Arc::new(StaticApiKeyDirectory::from_settings(&config)),
    };
    let state = Arc::new(AppState::new(config, deps));
    tracing::info!("Registered {} providers", configured);

    spawn_log_cleanup(state.clone());
    Ok(router(state))
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-provider-key"),
        ])
        .expose_headers([
            HeaderName::from_static(util::REQUEST_ID_HEADER),
            HeaderName::from_static("x-provider"),
            HeaderName::from_static("x-model"),
            HeaderName::from_static("x-cached"),
            HeaderName::from_static("x-fallback"),
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderName::from_static("x-monthly-remaining"),
        ])
        .allow_origin(AllowOrigin::mirror_request());

    handlers::routes()
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// 保留期取已配置套餐里最长的一档，每天清理一次
fn spawn_log_cleanup(state: Arc<AppState>) {
    let retention_days = state
        .config
        .api_keys
        .iter()
        .map(|k| PlanLimits::for_plan(&k.plan).log_retention_days)
        .max()
        .unwrap_or(PlanLimits::FREE.log_retention_days);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LOG_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            match state.logger.cleanup_old_logs(retention_days).await {
                Ok(removed) => tracing::debug!(removed, retention_days, "request log cleanup done"),
                Err(e) => tracing::error!("Failed to clean up request logs: {}", e),
            }
        }
    });
}
