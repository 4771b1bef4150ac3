// Resilience layer for the travel inventory cache: background refresh of
// stale provider data, circuit breakers, rate limiting, health and metrics.

pub mod cache_store;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod provider;
pub mod rate_limiter;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod telemetry;

// Re-export key types for convenience
pub use cache_store::{CacheStore, DomainType, Freshness, MemoryCacheStore};
pub use circuit_breaker::{BreakerConfig, BreakerOptions, BreakerRegistry, CircuitBreaker, CircuitState};
pub use config::AppConfig;
pub use error::{BreakerError, ProviderError, StoreError};
pub use health::{HealthAggregator, HealthReport, HealthStatus};
pub use metrics::MetricsRegistry;
pub use provider::{ProviderAdapter, ProviderSet};
pub use rate_limiter::{RateLimitRule, RateLimiter, RateLimiters, RouteClass};
pub use retry::{retry_with_backoff, RetryConfig};
pub use scheduler::{CacheRefreshStats, RefreshScheduler};
pub use server::{build_router, serve, AppState};
