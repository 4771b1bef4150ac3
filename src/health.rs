// Composite health verdict over the database, process memory and circuit breakers.
// Recomputed on every call; nothing here is cached or persisted.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{ProcessesToUpdate, System};

use crate::circuit_breaker::{BreakerRegistry, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreResult;
use crate::scheduler::{FreshnessStatus, RefreshScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheck {
    fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            latency: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub waiting: usize,
}

impl PoolStats {
    pub fn utilization_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.total.saturating_sub(self.idle) as f64 / self.total as f64 * 100.0
    }
}

// Whatever backs the cache database: reachability plus pool pressure
#[async_trait]
pub trait DatabaseProbe: Send + Sync + 'static {
    async fn ping(&self) -> StoreResult<()>;

    fn pool_stats(&self) -> PoolStats;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

impl MemoryUsage {
    pub fn utilization_percent(&self) -> f64 {
        if self.limit_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.limit_bytes as f64 * 100.0
    }
}

pub trait MemoryProbe: Send + Sync + 'static {
    fn usage(&self) -> Option<MemoryUsage>;
}

/// Resident memory of this process against a configured limit, or against
/// total system memory when no limit is set.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
    limit_bytes: Option<u64>,
}

impl SystemMemoryProbe {
    pub fn new(limit_bytes: Option<u64>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            limit_bytes,
        }
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn usage(&self) -> Option<MemoryUsage> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        let used_bytes = system.process(pid)?.memory();
        let limit_bytes = match self.limit_bytes {
            Some(limit) => limit,
            None => {
                system.refresh_memory();
                system.total_memory()
            }
        };

        Some(MemoryUsage {
            used_bytes,
            limit_bytes,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub pool_degraded_waiting: usize,
    pub pool_degraded_utilization: f64,
    pub pool_unhealthy_waiting: usize,
    pub pool_unhealthy_utilization: f64,
    pub memory_degraded_percent: f64,
    pub memory_unhealthy_percent: f64,
    pub database_timeout_ms: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            pool_degraded_waiting: 5,
            pool_degraded_utilization: 90.0,
            pool_unhealthy_waiting: 20,
            pool_unhealthy_utilization: 99.0,
            memory_degraded_percent: 85.0,
            memory_unhealthy_percent: 95.0,
            database_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthChecks {
    pub database: HealthCheck,
    pub database_pool: HealthCheck,
    pub memory: HealthCheck,
    pub external_apis: HealthCheck,
}

impl HealthChecks {
    fn all(&self) -> [&HealthCheck; 4] {
        [
            &self.database,
            &self.database_pool,
            &self.memory,
            &self.external_apis,
        ]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    // Seconds since the aggregator was created
    pub uptime: u64,
    pub checks: HealthChecks,
    // Informational; never affects `status`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<FreshnessStatus>,
}

impl HealthReport {
    pub fn is_unhealthy(&self) -> bool {
        self.status == HealthStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Liveness {
    pub alive: bool,
    pub timestamp: DateTime<Utc>,
}

// Worst status wins
pub fn overall_status<'a>(checks: impl IntoIterator<Item = &'a HealthCheck>) -> HealthStatus {
    checks
        .into_iter()
        .map(|check| check.status)
        .max()
        .unwrap_or(HealthStatus::Healthy)
}

pub struct HealthAggregator {
    database: Arc<dyn DatabaseProbe>,
    memory: Arc<dyn MemoryProbe>,
    breakers: Arc<BreakerRegistry>,
    scheduler: Option<Arc<RefreshScheduler>>,
    thresholds: HealthThresholds,
    version: String,
    started: std::time::Instant,
    clock: Arc<dyn Clock>,
}

impl HealthAggregator {
    pub fn new(
        database: Arc<dyn DatabaseProbe>,
        memory: Arc<dyn MemoryProbe>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            database,
            memory,
            breakers,
            scheduler: None,
            thresholds: HealthThresholds::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started: std::time::Instant::now(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<RefreshScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn check_database(&self) -> HealthCheck {
        let started = std::time::Instant::now();
        let timeout = Duration::from_millis(self.thresholds.database_timeout_ms);
        let outcome = tokio::time::timeout(timeout, self.database.ping()).await;
        let latency = Some(started.elapsed().as_millis() as u64);

        match outcome {
            Ok(Ok(())) => HealthCheck {
                status: HealthStatus::Healthy,
                latency,
                message: None,
            },
            Ok(Err(err)) => {
                tracing::error!(err = %err, "Database health check failed");
                HealthCheck {
                    status: HealthStatus::Unhealthy,
                    latency,
                    message: Some(err.to_string()),
                }
            }
            Err(_) => {
                tracing::error!(timeout_ms = timeout.as_millis() as u64, "Database health check timed out");
                HealthCheck {
                    status: HealthStatus::Unhealthy,
                    latency,
                    message: Some(format!("Database ping timed out after {}ms", timeout.as_millis())),
                }
            }
        }
    }

    pub fn check_database_pool(&self) -> HealthCheck {
        let stats = self.database.pool_stats();
        let utilization = stats.utilization_percent();
        let t = &self.thresholds;

        let status = if stats.waiting > t.pool_unhealthy_waiting
            || utilization > t.pool_unhealthy_utilization
        {
            HealthStatus::Unhealthy
        } else if stats.waiting > t.pool_degraded_waiting
            || utilization > t.pool_degraded_utilization
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthCheck::new(
            status,
            format!(
                "Pool: {} total, {} idle, {} waiting ({:.1}% utilized)",
                stats.total, stats.idle, stats.waiting, utilization
            ),
        )
    }

    pub fn check_memory(&self) -> HealthCheck {
        let Some(usage) = self.memory.usage() else {
            return HealthCheck::new(HealthStatus::Healthy, "Memory usage unavailable");
        };

        let utilization = usage.utilization_percent();
        let status = if utilization > self.thresholds.memory_unhealthy_percent {
            HealthStatus::Unhealthy
        } else if utilization > self.thresholds.memory_degraded_percent {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthCheck::new(
            status,
            format!(
                "Memory: {}MB/{}MB ({:.1}%)",
                usage.used_bytes / 1024 / 1024,
                usage.limit_bytes / 1024 / 1024,
                utilization
            ),
        )
    }

    pub fn check_external_apis(&self) -> HealthCheck {
        let snapshot = self.breakers.snapshot();
        if snapshot.is_empty() {
            return HealthCheck::new(HealthStatus::Healthy, "No circuit breakers registered yet");
        }

        let in_state = |state: CircuitState| {
            snapshot
                .values()
                .filter(|breaker| breaker.state == state)
                .map(|breaker| breaker.name.as_str())
                .collect::<Vec<_>>()
        };

        let open = in_state(CircuitState::Open);
        if !open.is_empty() {
            return HealthCheck::new(
                HealthStatus::Unhealthy,
                format!("Open circuit breakers: {}", open.join(", ")),
            );
        }

        let half_open = in_state(CircuitState::HalfOpen);
        if !half_open.is_empty() {
            return HealthCheck::new(
                HealthStatus::Degraded,
                format!("Half-open circuit breakers: {}", half_open.join(", ")),
            );
        }

        HealthCheck::new(
            HealthStatus::Healthy,
            format!("{} circuit breakers active", snapshot.len()),
        )
    }

    pub async fn report(&self) -> HealthReport {
        let checks = HealthChecks {
            database: self.check_database().await,
            database_pool: self.check_database_pool(),
            memory: self.check_memory(),
            external_apis: self.check_external_apis(),
        };

        let cache = match &self.scheduler {
            Some(scheduler) => match scheduler.freshness_status().await {
                Ok(status) => Some(status),
                Err(err) => {
                    tracing::warn!(err = %err, "Cache freshness unavailable for health report");
                    None
                }
            },
            None => None,
        };

        HealthReport {
            status: overall_status(checks.all()),
            timestamp: self.clock.now(),
            version: self.version.clone(),
            uptime: self.started.elapsed().as_secs(),
            checks,
            cache,
        }
    }

    pub async fn readiness(&self) -> Readiness {
        match self.check_database().await.status {
            HealthStatus::Unhealthy => Readiness {
                ready: false,
                message: "Database not available".to_string(),
            },
            _ => Readiness {
                ready: true,
                message: "Service is ready to accept traffic".to_string(),
            },
        }
    }

    pub fn liveness(&self) -> Liveness {
        Liveness {
            alive: true,
            timestamp: self.clock.now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::MemoryCacheStore;
    use crate::circuit_breaker::BreakerConfig;
    use crate::error::BreakerError;

    struct FixedPool(PoolStats);

    #[async_trait]
    impl DatabaseProbe for FixedPool {
        async fn ping(&self) -> StoreResult<()> {
            Ok(())
        }

        fn pool_stats(&self) -> PoolStats {
            self.0
        }
    }

    struct FixedMemory(Option<MemoryUsage>);

    impl MemoryProbe for FixedMemory {
        fn usage(&self) -> Option<MemoryUsage> {
            self.0
        }
    }

    fn memory(percent: u64) -> Arc<FixedMemory> {
        Arc::new(FixedMemory(Some(MemoryUsage {
            used_bytes: percent,
            limit_bytes: 100,
        })))
    }

    fn aggregator_with_pool(stats: PoolStats) -> HealthAggregator {
        HealthAggregator::new(
            Arc::new(FixedPool(stats)),
            memory(10),
            Arc::new(BreakerRegistry::default()),
        )
    }

    #[test]
    fn test_pool_thresholds() {
        let pool = |total, idle, waiting| {
            aggregator_with_pool(PoolStats { total, idle, waiting })
                .check_database_pool()
                .status
        };

        assert_eq!(pool(10, 5, 0), HealthStatus::Healthy);
        assert_eq!(pool(10, 5, 6), HealthStatus::Degraded);
        assert_eq!(pool(10, 0, 0), HealthStatus::Unhealthy);
        assert_eq!(pool(100, 5, 0), HealthStatus::Degraded);
        assert_eq!(pool(10, 5, 21), HealthStatus::Unhealthy);
        assert_eq!(pool(0, 0, 0), HealthStatus::Healthy);
    }

    #[test]
    fn test_memory_thresholds() {
        let check = |percent| {
            HealthAggregator::new(
                Arc::new(FixedPool(PoolStats::default())),
                memory(percent),
                Arc::new(BreakerRegistry::default()),
            )
            .check_memory()
            .status
        };

        assert_eq!(check(85), HealthStatus::Healthy);
        assert_eq!(check(86), HealthStatus::Degraded);
        assert_eq!(check(96), HealthStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_states_drive_external_apis_check() {
        let registry = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
        let aggregator = HealthAggregator::new(
            Arc::new(FixedPool(PoolStats::default())),
            memory(10),
            registry.clone(),
        );
        assert_eq!(aggregator.check_external_apis().status, HealthStatus::Healthy);

        let breaker = registry.breaker("provider:hotel");
        for _ in 0..5 {
            let _: Result<(), BreakerError<&str>> = breaker.call(|| async { Err("down") }).await;
        }
        let check = aggregator.check_external_apis();
        assert_eq!(check.status, HealthStatus::Unhealthy);
        assert!(check.message.unwrap().contains("provider:hotel"));

        // Reset timeout passed with no traffic at all
        tokio::time::advance(Duration::from_secs(31)).await;
        let check = aggregator.check_external_apis();
        assert_eq!(check.status, HealthStatus::Degraded);
        assert!(check.message.unwrap().contains("Half-open"));

        // The trial stays in flight, so the breaker remains half-open
        let mut slow = tokio_test::task::spawn(breaker.call(|| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, &str>(())
        }));
        tokio_test::assert_pending!(slow.poll());
        assert_eq!(aggregator.check_external_apis().status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_database_failure_is_unhealthy_regardless_of_other_checks() {
        let store = Arc::new(MemoryCacheStore::default());
        store.set_available(false);
        let aggregator = HealthAggregator::new(
            store,
            memory(10),
            Arc::new(BreakerRegistry::default()),
        );

        let report = aggregator.report().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.checks.database_pool.status, HealthStatus::Healthy);
        assert!(report.is_unhealthy());

        let readiness = aggregator.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.message, "Database not available");
    }

    #[tokio::test]
    async fn test_report_serializes_expected_shape() {
        let aggregator = aggregator_with_pool(PoolStats {
            total: 10,
            idle: 10,
            waiting: 0,
        })
        .with_version("1.2.3");

        let report = aggregator.report().await;
        assert_eq!(report.status, HealthStatus::Healthy);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["version"], "1.2.3");
        for check in ["database", "database_pool", "memory", "external_apis"] {
            assert!(json["checks"][check]["status"].is_string(), "{check}");
        }
        assert!(json.get("cache").is_none());
    }

    #[test]
    fn test_overall_status_takes_worst() {
        let healthy = HealthCheck::new(HealthStatus::Healthy, "ok");
        let degraded = HealthCheck::new(HealthStatus::Degraded, "slow");
        assert_eq!(overall_status([&healthy, &healthy]), HealthStatus::Healthy);
        assert_eq!(overall_status([&healthy, &degraded]), HealthStatus::Degraded);
    }
}
