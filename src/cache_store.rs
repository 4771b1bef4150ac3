// Cache of third-party travel inventory.
// The store is a pure storage contract: it classifies nothing on its own and never
// calls a provider. Freshness rules live in `Freshness` so the scheduler and the
// health endpoint agree on them.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::health::{DatabaseProbe, PoolStats};
use crate::metrics::MetricsRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainType {
    Hotel,
    Activity,
    Flight,
    Event,
}

impl DomainType {
    // Refresh order of a cycle
    pub const ALL: [DomainType; 4] = [
        DomainType::Hotel,
        DomainType::Activity,
        DomainType::Flight,
        DomainType::Event,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DomainType::Hotel => "hotel",
            DomainType::Activity => "activity",
            DomainType::Flight => "flight",
            DomainType::Event => "event",
        }
    }

    // Used as the prefix of per-key error strings, e.g. "Hotel refresh error for PAR: ..."
    pub fn label(&self) -> &'static str {
        match self {
            DomainType::Hotel => "Hotel",
            DomainType::Activity => "Activity",
            DomainType::Flight => "Flight",
            DomainType::Event => "Event",
        }
    }
}

impl fmt::Display for DomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Date range a record was fetched for (check-in/check-out, departure/return)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub domain_type: DomainType,
    pub key: String,
    pub payload: Bytes,
    pub window: Option<DateWindow>,
    // Bookable item id -> last cached price, used by pre-checkout verification
    pub prices: BTreeMap<String, f64>,
    pub last_updated: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

// What a provider adapter hands back for one logical key
#[derive(Debug, Clone, Default)]
pub struct ProviderRecords {
    pub payload: Bytes,
    pub window: Option<DateWindow>,
    pub prices: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

impl Freshness {
    /// Classifies a record. Expiry wins over staleness, and a record that was
    /// never refreshed is stale until it expires.
    pub fn classify(
        last_updated: Option<DateTime<Utc>>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        stale_threshold: Duration,
    ) -> Self {
        if now >= expires_at {
            return Freshness::Expired;
        }

        match last_updated {
            None => Freshness::Stale,
            Some(updated) if now - updated >= stale_threshold => Freshness::Stale,
            Some(_) => Freshness::Fresh,
        }
    }

    /// Refresh candidacy only looks at `last_updated`: null or older than the
    /// threshold. Expired keys are refetched too, cleanup then drops leftovers.
    pub fn needs_refresh(
        last_updated: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        stale_threshold: Duration,
    ) -> bool {
        match last_updated {
            None => true,
            Some(updated) => now - updated >= stale_threshold,
        }
    }
}

// A distinct logical key with the oldest `last_updated` among its records
#[derive(Debug, Clone, PartialEq)]
pub struct KeyFreshness {
    pub key: String,
    pub last_updated: Option<DateTime<Utc>>,
    pub window: Option<DateWindow>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordTimes {
    pub last_updated: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub hotels: usize,
    pub activities: usize,
    pub flights: usize,
    pub events: usize,
}

impl CleanupReport {
    fn bump(&mut self, domain: DomainType) {
        match domain {
            DomainType::Hotel => self.hotels += 1,
            DomainType::Activity => self.activities += 1,
            DomainType::Flight => self.flights += 1,
            DomainType::Event => self.events += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.hotels + self.activities + self.flights + self.events
    }
}

// Read/write contract the refresh subsystem needs from the cache database
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    // Distinct keys of a domain with their freshness inputs
    async fn key_freshness(&self, domain: DomainType) -> StoreResult<Vec<KeyFreshness>>;

    // Timestamps of every record of a domain, for freshness counts
    async fn record_times(&self, domain: DomainType) -> StoreResult<Vec<RecordTimes>>;

    // Replace the records of a key; sets last_updated = now and expires_at = now + ttl
    async fn write_records(
        &self,
        domain: DomainType,
        key: &str,
        records: ProviderRecords,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<()>;

    async fn get(&self, domain: DomainType, key: &str) -> StoreResult<Option<CacheRecord>>;

    // Last cached price of a bookable item, if any record carries one
    async fn cached_price(&self, domain: DomainType, item_id: &str) -> StoreResult<Option<f64>>;

    // Delete every record with expires_at <= now
    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<CleanupReport>;
}

pub fn create_cache_key(domain: DomainType, key: &str) -> String {
    format!("{}:{}", domain.as_str(), key)
}

// Read statistics of the in-memory store
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub items_count: usize,
    pub hit_count: usize,
    pub miss_count: usize,
    pub write_count: usize,
    pub expired_count: usize,
}

/// DashMap-backed `CacheStore`. One record per (domain, key); writes are last
/// write wins. It doubles as the database probe so the health endpoint has
/// something to ping when no external database is wired in.
pub struct MemoryCacheStore {
    records: DashMap<String, CacheRecord>,
    available: AtomicBool,
    in_flight: AtomicUsize,
    pool_size: usize,
    cache_stats: RwLock<CacheStats>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            available: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            pool_size: 10,
            cache_stats: RwLock::new(CacheStats::default()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    // Seed a record as-is, bypassing the write path (tests, warm starts)
    pub fn insert(&self, record: CacheRecord) {
        let key = create_cache_key(record.domain_type, &record.key);
        self.records.insert(key, record);
        self.cache_stats.write().items_count = self.records.len();
    }

    // Simulates the backing database going away
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn stats(&self) -> CacheStats {
        self.cache_stats.read().clone()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    fn records_of(&self, domain: DomainType) -> impl Iterator<Item = CacheRecord> + '_ {
        self.records
            .iter()
            .filter(move |entry| entry.value().domain_type == domain)
            .map(|entry| entry.value().clone())
    }

    fn observe_query(&self, operation: &str, started: std::time::Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_db_query(operation, "cache_records", started.elapsed());
        }
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn key_freshness(&self, domain: DomainType) -> StoreResult<Vec<KeyFreshness>> {
        self.check_available()?;
        let started = std::time::Instant::now();

        let mut by_key: HashMap<String, KeyFreshness> = HashMap::new();
        for record in self.records_of(domain) {
            let entry = by_key
                .entry(record.key.clone())
                .or_insert_with(|| KeyFreshness {
                    key: record.key.clone(),
                    last_updated: record.last_updated,
                    window: record.window,
                });

            // The oldest timestamp decides; a null anywhere makes the key a candidate
            entry.last_updated = match (entry.last_updated, record.last_updated) {
                (Some(a), Some(b)) => Some(a.min(b)),
                _ => None,
            };
            // Keep the latest window seen for the key
            if let Some(window) = record.window {
                if entry.window.map_or(true, |w| window.start > w.start) {
                    entry.window = Some(window);
                }
            }
        }

        let mut keys: Vec<KeyFreshness> = by_key.into_values().collect();
        keys.sort_by(|a, b| a.key.cmp(&b.key));
        self.observe_query("select_distinct", started);
        Ok(keys)
    }

    async fn record_times(&self, domain: DomainType) -> StoreResult<Vec<RecordTimes>> {
        self.check_available()?;
        let started = std::time::Instant::now();
        let times = self
            .records_of(domain)
            .map(|record| RecordTimes {
                last_updated: record.last_updated,
                expires_at: record.expires_at,
            })
            .collect();
        self.observe_query("select", started);
        Ok(times)
    }

    async fn write_records(
        &self,
        domain: DomainType,
        key: &str,
        records: ProviderRecords,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.check_available()?;
        let started = std::time::Instant::now();

        let record = CacheRecord {
            domain_type: domain,
            key: key.to_string(),
            payload: records.payload,
            window: records.window,
            prices: records.prices,
            last_updated: Some(now),
            expires_at: now + ttl,
        };
        self.records.insert(create_cache_key(domain, key), record);

        let mut stats = self.cache_stats.write();
        stats.write_count += 1;
        stats.items_count = self.records.len();
        drop(stats);

        self.observe_query("upsert", started);
        Ok(())
    }

    async fn get(&self, domain: DomainType, key: &str) -> StoreResult<Option<CacheRecord>> {
        self.check_available()?;
        let started = std::time::Instant::now();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let found = self
            .records
            .get(&create_cache_key(domain, key))
            .map(|entry| entry.value().clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        {
            let mut stats = self.cache_stats.write();
            if found.is_some() {
                stats.hit_count += 1;
            } else {
                stats.miss_count += 1;
            }
        }
        if let Some(metrics) = &self.metrics {
            if found.is_some() {
                metrics.record_cache_hit(domain.as_str());
            } else {
                metrics.record_cache_miss(domain.as_str());
            }
        }

        self.observe_query("select", started);
        Ok(found)
    }

    async fn cached_price(&self, domain: DomainType, item_id: &str) -> StoreResult<Option<f64>> {
        self.check_available()?;
        let price = self
            .records_of(domain)
            .filter_map(|record| {
                record
                    .prices
                    .get(item_id)
                    .map(|price| (record.last_updated, *price))
            })
            .max_by_key(|(updated, _)| *updated)
            .map(|(_, price)| price);
        Ok(price)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<CleanupReport> {
        self.check_available()?;
        let started = std::time::Instant::now();

        let mut report = CleanupReport::default();
        self.records.retain(|_, record| {
            if record.expires_at <= now {
                report.bump(record.domain_type);
                false
            } else {
                true
            }
        });

        let mut stats = self.cache_stats.write();
        stats.expired_count += report.total();
        stats.items_count = self.records.len();
        drop(stats);

        self.observe_query("delete", started);
        Ok(report)
    }
}

#[async_trait]
impl DatabaseProbe for MemoryCacheStore {
    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }

    fn pool_stats(&self) -> PoolStats {
        let busy = self.in_flight.load(Ordering::SeqCst).min(self.pool_size);
        PoolStats {
            total: self.pool_size,
            idle: self.pool_size - busy,
            waiting: 0,
        }
    }
}
