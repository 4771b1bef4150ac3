//! Background refresh of stale cached inventory.
//!
//! A cycle walks every domain type in turn, selects keys whose newest data is
//! older than the stale threshold, and refetches them through the domain's
//! circuit breaker in fixed-size batches separated by a fixed delay. Per-key
//! failures are collected into the cycle's stats; nothing escapes to the
//! caller. At most one cycle runs at a time.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use chrono::{DateTime, NaiveDate, Utc};
use futures::{future::join_all, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};

use crate::cache_store::{CacheStore, CleanupReport, DomainType, Freshness, KeyFreshness};
use crate::circuit_breaker::BreakerRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::error::{BreakerError, ProviderError, RefreshError, StoreResult};
use crate::metrics::MetricsRegistry;
use crate::provider::{CheckoutItem, ProviderSet, Quote, RefreshQuery};
use crate::retry::retry_with_backoff_if;

const DEFAULT_CURRENCY: &str = "USD";

// Prices closer than this are treated as unchanged
const PRICE_TOLERANCE: f64 = 0.01;

pub fn breaker_name(domain: DomainType) -> String {
    format!("provider:{}", domain.as_str())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRefreshStats {
    pub hotels_refreshed: usize,
    pub activities_refreshed: usize,
    pub flights_refreshed: usize,
    pub fever_events_refreshed: usize,
    pub errors: Vec<String>,
    pub last_refresh_time: DateTime<Utc>,
    #[serde(default)]
    pub expired_removed: usize,
}

impl CacheRefreshStats {
    pub fn empty(at: DateTime<Utc>) -> Self {
        Self {
            hotels_refreshed: 0,
            activities_refreshed: 0,
            flights_refreshed: 0,
            fever_events_refreshed: 0,
            errors: Vec::new(),
            last_refresh_time: at,
            expired_removed: 0,
        }
    }

    pub fn refreshed(&self, domain: DomainType) -> usize {
        match domain {
            DomainType::Hotel => self.hotels_refreshed,
            DomainType::Activity => self.activities_refreshed,
            DomainType::Flight => self.flights_refreshed,
            DomainType::Event => self.fever_events_refreshed,
        }
    }

    fn add_refreshed(&mut self, domain: DomainType, count: usize) {
        match domain {
            DomainType::Hotel => self.hotels_refreshed += count,
            DomainType::Activity => self.activities_refreshed += count,
            DomainType::Flight => self.flights_refreshed += count,
            DomainType::Event => self.fever_events_refreshed += count,
        }
    }

    pub fn total_refreshed(&self) -> usize {
        DomainType::ALL.iter().map(|domain| self.refreshed(*domain)).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FreshnessCounts {
    pub total: usize,
    pub fresh: usize,
    pub stale: usize,
    pub expired: usize,
}

impl FreshnessCounts {
    fn add(&mut self, freshness: Freshness) {
        self.total += 1;
        match freshness {
            Freshness::Fresh => self.fresh += 1,
            Freshness::Stale => self.stale += 1,
            Freshness::Expired => self.expired += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessStatus {
    pub hotels: FreshnessCounts,
    pub activities: FreshnessCounts,
    pub flights: FreshnessCounts,
    pub events: FreshnessCounts,
    pub last_refresh: Option<DateTime<Utc>>,
    pub is_refreshing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutVerification {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: DomainType,
    pub verified: bool,
    pub price_changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn price_changed(cached: Option<f64>, current: Option<f64>) -> bool {
    match (cached, current) {
        (Some(cached), Some(current)) => (cached - current).abs() > PRICE_TOLERANCE,
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshCandidate {
    pub key: String,
    pub query: RefreshQuery,
}

/// Rebuilds the minimal query that refetches `entry`. Returns `None` for
/// keys that cannot or should not be refetched (past flights, malformed
/// route keys).
pub fn build_query(domain: DomainType, entry: &KeyFreshness, today: NaiveDate) -> Option<RefreshQuery> {
    match domain {
        DomainType::Hotel => {
            // Reuse the cached stay only while it is still ahead of us
            let (check_in, check_out) = match entry.window {
                Some(window) if window.start > today => (
                    window.start,
                    window.end.unwrap_or(window.start + chrono::Duration::days(7)),
                ),
                _ => (
                    today + chrono::Duration::days(1),
                    today + chrono::Duration::days(8),
                ),
            };
            Some(RefreshQuery::Hotels {
                city_code: entry.key.clone(),
                check_in,
                check_out,
                adults: 2,
                rooms: 1,
                currency: DEFAULT_CURRENCY.to_string(),
            })
        }
        DomainType::Activity => Some(RefreshQuery::Activities {
            destination: entry.key.clone(),
            currency: DEFAULT_CURRENCY.to_string(),
            count: 20,
        }),
        DomainType::Flight => {
            let window = entry.window.filter(|window| window.start >= today)?;
            // Keys look like "JFK-LHR" or "JFK-LHR:<dates>"
            let route = entry.key.split(':').next()?;
            let (origin, destination) = route.split_once('-')?;
            if origin.is_empty() || destination.is_empty() {
                return None;
            }
            Some(RefreshQuery::Flights {
                origin: origin.to_string(),
                destination: destination.to_string(),
                departure: window.start,
                return_date: window.end,
                adults: 2,
                travel_class: "ECONOMY".to_string(),
                non_stop: false,
                max: 20,
            })
        }
        DomainType::Event => Some(RefreshQuery::Events {
            city_code: entry.key.clone(),
            limit: 100,
        }),
    }
}

#[derive(Debug, Default)]
struct DomainOutcome {
    refreshed: usize,
    errors: Vec<String>,
}

// Clears the running flag however the cycle ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct SchedulerTask {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

pub struct RefreshScheduler {
    store: Arc<dyn CacheStore>,
    providers: ProviderSet,
    breakers: Arc<BreakerRegistry>,
    metrics: Option<Arc<MetricsRegistry>>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    is_refreshing: AtomicBool,
    last_stats: RwLock<Option<CacheRefreshStats>>,
    task: Mutex<Option<SchedulerTask>>,
}

impl RefreshScheduler {
    pub fn new(
        store: Arc<dyn CacheStore>,
        providers: ProviderSet,
        breakers: Arc<BreakerRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            providers,
            breakers,
            metrics: None,
            clock: Arc::new(SystemClock),
            config,
            is_refreshing: AtomicBool::new(false),
            last_stats: RwLock::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Starts the timer task: one check after the warm-up delay, then one
    /// every refresh interval. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            tracing::info!("Refresh scheduler already running");
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let scheduler: Weak<Self> = Arc::downgrade(self);
        let warmup = self.config.warmup_delay();
        let interval = self.config.refresh_interval();

        let handle = tokio::spawn(async move {
            let warmup = tokio::time::sleep(warmup);
            tokio::pin!(warmup);
            let mut warmed_up = false;

            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut warmup, if !warmed_up => warmed_up = true,
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }

                let Some(scheduler) = scheduler.upgrade() else { break };
                // Cycles run on their own task; stop() never interrupts one
                tokio::spawn(async move {
                    scheduler.check_and_refresh().await;
                });
            }
        });

        *task = Some(SchedulerTask { handle, shutdown });
        tracing::info!(
            warmup_secs = warmup.as_secs(),
            interval_hours = interval.as_secs() / 3600,
            "Started background cache refresh scheduler"
        );
    }

    // Cancels future ticks only
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            let _ = task.shutdown.send(true);
            tracing::info!("Refresh scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    pub fn is_refreshing(&self) -> bool {
        self.is_refreshing.load(Ordering::SeqCst)
    }

    pub fn last_stats(&self) -> Option<CacheRefreshStats> {
        self.last_stats.read().clone()
    }

    /// Runs a cycle now, on its own task, and waits for its stats.
    pub async fn trigger_manual_refresh(self: &Arc<Self>) -> CacheRefreshStats {
        let scheduler = Arc::clone(self);
        match tokio::spawn(async move { scheduler.check_and_refresh().await }).await {
            Ok(stats) => stats,
            Err(err) => {
                tracing::error!(err = %err, "Manual refresh task failed");
                self.last_stats()
                    .unwrap_or_else(|| CacheRefreshStats::empty(self.clock.now()))
            }
        }
    }

    /// One refresh cycle. Returns the previous stats untouched when another
    /// cycle is already running.
    pub async fn check_and_refresh(&self) -> CacheRefreshStats {
        if self
            .is_refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("Refresh already in progress, skipping");
            return self
                .last_stats()
                .unwrap_or_else(|| CacheRefreshStats::empty(self.clock.now()));
        }
        let _running = RunningGuard(&self.is_refreshing);

        let started = std::time::Instant::now();
        let mut stats = CacheRefreshStats::empty(self.clock.now());
        tracing::info!("Starting cache refresh check");

        let outcome = AssertUnwindSafe(self.run_cycle(&mut stats))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(cleanup)) => {
                stats.expired_removed = cleanup.total();
                tracing::info!(
                    hotels = stats.hotels_refreshed,
                    activities = stats.activities_refreshed,
                    flights = stats.flights_refreshed,
                    events = stats.fever_events_refreshed,
                    expired_removed = stats.expired_removed,
                    errors = stats.errors.len(),
                    "Cache refresh complete"
                );
            }
            Ok(Err(err)) => {
                tracing::error!(err = %err, "Cache refresh failed");
                stats.errors.push(format!("General error: {err}"));
            }
            Err(_) => {
                tracing::error!("Cache refresh cycle panicked");
                stats.errors.push("General error: refresh cycle panicked".to_string());
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.observe_refresh_cycle(started.elapsed());
        }
        *self.last_stats.write() = Some(stats.clone());
        stats
    }

    async fn run_cycle(&self, stats: &mut CacheRefreshStats) -> StoreResult<CleanupReport> {
        for domain in DomainType::ALL {
            let outcome = self.refresh_domain(domain).await;
            stats.add_refreshed(domain, outcome.refreshed);
            stats.errors.extend(outcome.errors);
        }

        self.store.delete_expired(self.clock.now()).await
    }

    /// Keys of `domain` due for a refresh, with the query to refetch each.
    pub async fn stale_candidates(&self, domain: DomainType) -> StoreResult<Vec<RefreshCandidate>> {
        let now = self.clock.now();
        let today = now.date_naive();
        let threshold = self.config.stale_threshold();

        let candidates = self
            .store
            .key_freshness(domain)
            .await?
            .into_iter()
            .filter(|entry| Freshness::needs_refresh(entry.last_updated, now, threshold))
            .filter_map(|entry| {
                let query = build_query(domain, &entry, today);
                if query.is_none() {
                    tracing::debug!(domain = %domain, key = %entry.key, "Skipping key without a refetchable query");
                }
                query.map(|query| RefreshCandidate {
                    key: entry.key,
                    query,
                })
            })
            .collect();
        Ok(candidates)
    }

    async fn refresh_domain(&self, domain: DomainType) -> DomainOutcome {
        let candidates = match self.stale_candidates(domain).await {
            Ok(candidates) => candidates,
            Err(err) => {
                tracing::error!(domain = %domain, err = %err, "Failed to select stale keys");
                return DomainOutcome {
                    refreshed: 0,
                    errors: vec![format!("{} refresh general error: {}", domain.label(), err)],
                };
            }
        };
        tracing::info!(domain = %domain, stale = candidates.len(), "Found keys with stale data");

        let mut outcome = DomainOutcome::default();
        let batch_size = self.config.batch_size.max(1);

        for (index, batch) in candidates.chunks(batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.batch_delay()).await;
            }

            let results = join_all(batch.iter().map(|candidate| self.refresh_key(domain, candidate))).await;

            for (candidate, result) in batch.iter().zip(results) {
                if let Some(metrics) = &self.metrics {
                    metrics.record_refresh_item(domain.as_str(), result.is_ok());
                }
                match result {
                    Ok(()) => {
                        outcome.refreshed += 1;
                        tracing::debug!(domain = %domain, key = %candidate.key, "Refreshed cache key");
                    }
                    Err(err) => {
                        tracing::warn!(domain = %domain, key = %candidate.key, err = %err, "Cache key refresh failed");
                        outcome.errors.push(format!(
                            "{} refresh error for {}: {}",
                            domain.label(),
                            candidate.key,
                            err
                        ));
                    }
                }
            }
        }

        outcome
    }

    async fn refresh_key(&self, domain: DomainType, candidate: &RefreshCandidate) -> Result<(), RefreshError> {
        let adapter = self.providers.get(domain).map_err(BreakerError::Inner)?;
        let name = breaker_name(domain);
        let breaker = self.breakers.breaker(&name);

        let started = std::time::Instant::now();
        let fetched = retry_with_backoff_if(
            &self.config.refresh_retry,
            |err: &BreakerError<ProviderError>| match err {
                BreakerError::Inner(inner) => inner.is_retryable(),
                other => !other.is_rejection(),
            },
            || breaker.call(|| adapter.fetch(&candidate.key, &candidate.query)),
        )
        .await;
        if let Some(metrics) = &self.metrics {
            metrics.record_external_call(&name, fetched.is_ok(), started.elapsed());
        }

        self.store
            .write_records(domain, &candidate.key, fetched?, self.clock.now(), self.config.cache_ttl())
            .await?;
        Ok(())
    }

    /// Re-quotes every item live and compares against the cached price. Read
    /// only: the cache is never written from here.
    pub async fn verify_for_checkout(&self, items: &[CheckoutItem]) -> Vec<CheckoutVerification> {
        tracing::info!(items = items.len(), "Pre-checkout verification");
        join_all(items.iter().map(|item| self.verify_item(item))).await
    }

    async fn quote_item(&self, item: &CheckoutItem) -> Result<Quote, BreakerError<ProviderError>> {
        let adapter = self.providers.get(item.item_type).map_err(BreakerError::Inner)?;
        let breaker = self.breakers.breaker(&breaker_name(item.item_type));
        breaker.call(|| adapter.quote(item)).await
    }

    async fn verify_item(&self, item: &CheckoutItem) -> CheckoutVerification {
        let quote = match self.quote_item(item).await {
            Ok(quote) => quote,
            Err(err) => {
                return CheckoutVerification {
                    id: item.id.clone(),
                    item_type: item.item_type,
                    verified: false,
                    price_changed: false,
                    current_price: None,
                    cached_price: None,
                    error: Some(err.to_string()),
                }
            }
        };

        let cached_price = match self.store.cached_price(item.item_type, item.provider_id()).await {
            Ok(price) => price,
            Err(err) => {
                tracing::warn!(id = %item.id, err = %err, "Cached price unavailable for verification");
                None
            }
        };

        CheckoutVerification {
            id: item.id.clone(),
            item_type: item.item_type,
            verified: quote.available,
            price_changed: price_changed(cached_price, quote.price),
            current_price: quote.price,
            cached_price,
            error: None,
        }
    }

    pub async fn freshness_status(&self) -> StoreResult<FreshnessStatus> {
        let now = self.clock.now();
        let threshold = self.config.stale_threshold();

        let mut counts = [FreshnessCounts::default(); 4];
        for (slot, domain) in counts.iter_mut().zip(DomainType::ALL) {
            for times in self.store.record_times(domain).await? {
                slot.add(Freshness::classify(
                    times.last_updated,
                    times.expires_at,
                    now,
                    threshold,
                ));
            }
        }
        let [hotels, activities, flights, events] = counts;

        Ok(FreshnessStatus {
            hotels,
            activities,
            flights,
            events,
            last_refresh: self.last_stats().map(|stats| stats.last_refresh_time),
            is_refreshing: self.is_refreshing(),
        })
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.handle.abort();
        }
    }
}
