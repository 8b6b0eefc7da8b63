pub mod circuit_breaker;
pub mod detect;
pub mod engine;
pub mod metadata;
pub mod model_tiers;
pub mod rate_limit;

#[allow(unused_imports)]
pub use circuit_breaker::{CircuitBreaker, CircuitState, CircuitStatus};
pub use engine::{RouteEngine, RouteFailure};
pub use metadata::{RequestMetadata, RouteContext};
pub use rate_limit::{PlanLimits, RateLimitResult, RateLimiter};
