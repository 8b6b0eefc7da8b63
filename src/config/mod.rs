pub mod settings;

pub use settings::{
    ApiKeyEntry, CacheConfig, CircuitBreakerConfig, LoggingConfig, ProvidersConfig, ServerConfig,
    Settings, StoreConfig, StreamMode,
};
