use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::circuit_breaker::{BreakerConfig, BreakerOptions};
use crate::error::ConfigError;
use crate::health::HealthThresholds;
use crate::rate_limiter::{RateLimitRule, RouteClass};
use crate::retry::RetryConfig;

/// Everything the subsystem reads at startup. Every field has a default, so
/// an empty environment yields a working configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub breakers: BreakersConfig,

    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    #[serde(default)]
    pub health: HealthConfig,
}

impl AppConfig {
    /// Load from an optional `resilience.{toml,yaml,json}` file, overridden by
    /// `TRAVEL_RESILIENCE__SECTION__FIELD` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("resilience").required(false))
            .add_source(
                config::Environment::with_prefix("TRAVEL_RESILIENCE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.batch_size == 0 {
            return Err(ConfigError::Invalid("scheduler.batch_size must be at least 1".into()));
        }
        if self.scheduler.stale_threshold_hours >= self.scheduler.cache_ttl_hours {
            return Err(ConfigError::Invalid(
                "scheduler.stale_threshold_hours must be below scheduler.cache_ttl_hours".into(),
            ));
        }
        if self.scheduler.refresh_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.refresh_interval_ms must be positive".into(),
            ));
        }
        for class in RouteClass::ALL {
            let rule = self.rate_limits.rule(class);
            if rule.window_ms == 0 || rule.max_requests == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rate_limits.{} needs a positive window and limit",
                    class.name()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    // JSON lines instead of human-readable logs
    #[serde(default)]
    pub json_logs: bool,

    #[serde(default = "default_version")]
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            log_level: default_log_level(),
            json_logs: false,
            version: default_version(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.port)
            .parse()
            .map_err(|err| ConfigError::Invalid(format!("bind address: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    #[serde(default = "default_warmup_delay_ms")]
    pub warmup_delay_ms: u64,

    #[serde(default = "default_stale_threshold_hours")]
    pub stale_threshold_hours: i64,

    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: i64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    #[serde(default = "default_refresh_retry")]
    pub refresh_retry: RetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_interval_ms(),
            warmup_delay_ms: default_warmup_delay_ms(),
            stale_threshold_hours: default_stale_threshold_hours(),
            cache_ttl_hours: default_cache_ttl_hours(),
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            refresh_retry: default_refresh_retry(),
        }
    }
}

impl SchedulerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn warmup_delay(&self) -> Duration {
        Duration::from_millis(self.warmup_delay_ms)
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::hours(self.stale_threshold_hours)
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cache_ttl_hours)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakersConfig {
    #[serde(default)]
    pub defaults: BreakerOptions,

    // Keyed by breaker name, e.g. "provider:hotel"
    #[serde(default)]
    pub overrides: HashMap<String, BreakerOptions>,
}

impl BreakersConfig {
    pub fn base(&self) -> BreakerConfig {
        BreakerConfig::merged(&BreakerConfig::default(), &self.defaults)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitsConfig {
    pub general: Option<RateLimitRule>,
    pub ai: Option<RateLimitRule>,
    pub search: Option<RateLimitRule>,
    pub auth: Option<RateLimitRule>,
    pub strict: Option<RateLimitRule>,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            general: None,
            ai: None,
            search: None,
            auth: None,
            strict: None,
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl RateLimitsConfig {
    pub fn rule(&self, class: RouteClass) -> RateLimitRule {
        let configured = match class {
            RouteClass::General => self.general,
            RouteClass::Ai => self.ai,
            RouteClass::Search => self.search,
            RouteClass::Auth => self.auth,
            RouteClass::Strict => self.strict,
        };
        configured.unwrap_or_else(|| class.default_rule())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthConfig {
    // Falls back to total system memory when unset
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,

    #[serde(default)]
    pub thresholds: HealthThresholds,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_refresh_interval_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_warmup_delay_ms() -> u64 {
    5 * 60 * 1000
}

fn default_stale_threshold_hours() -> i64 {
    20
}

fn default_cache_ttl_hours() -> i64 {
    24
}

fn default_batch_size() -> usize {
    5
}

fn default_batch_delay_ms() -> u64 {
    2000
}

fn default_refresh_retry() -> RetryConfig {
    RetryConfig::new(2, 500, 5000)
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}
