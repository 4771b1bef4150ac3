// Boundary to the third-party inventory clients (hotel, activity, flight, event search).
// Adapters are external collaborators; this module only fixes their call/throw contract.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::cache_store::{DomainType, ProviderRecords};
use crate::error::ProviderError;

// Minimal query needed to refetch one logical key
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RefreshQuery {
    Hotels {
        city_code: String,
        check_in: NaiveDate,
        check_out: NaiveDate,
        adults: u32,
        rooms: u32,
        currency: String,
    },
    Activities {
        destination: String,
        currency: String,
        count: u32,
    },
    Flights {
        origin: String,
        destination: String,
        departure: NaiveDate,
        return_date: Option<NaiveDate>,
        adults: u32,
        travel_class: String,
        non_stop: bool,
        max: u32,
    },
    Events {
        city_code: String,
        limit: u32,
    },
}

// One line of a cart about to be booked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutItem {
    #[serde(rename = "type")]
    pub item_type: DomainType,
    pub id: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl CheckoutItem {
    // Cart ids are prefixed with their type ("hotel-123"); providers want the bare id
    pub fn provider_id(&self) -> &str {
        let prefix = format!("{}-", self.item_type.as_str());
        self.id.strip_prefix(prefix.as_str()).unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub available: bool,
    pub price: Option<f64>,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync + 'static {
    // Fetch fresh inventory for a key; errors are reported, never panicked
    async fn fetch(&self, key: &str, query: &RefreshQuery) -> Result<ProviderRecords, ProviderError>;

    // Live availability and price of a single bookable item
    async fn quote(&self, item: &CheckoutItem) -> Result<Quote, ProviderError>;
}

/// Adapters by domain type. A domain without an adapter is reported as a
/// per-key error rather than skipped silently.
#[derive(Clone, Default)]
pub struct ProviderSet {
    adapters: HashMap<DomainType, Arc<dyn ProviderAdapter>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, domain: DomainType, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(domain, adapter);
        self
    }

    // Same adapter for every domain type
    pub fn uniform(adapter: Arc<dyn ProviderAdapter>) -> Self {
        DomainType::ALL
            .iter()
            .fold(Self::new(), |set, domain| set.with(*domain, adapter.clone()))
    }

    pub fn get(&self, domain: DomainType) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        self.adapters.get(&domain).cloned().ok_or_else(|| {
            ProviderError::Other(format!("no provider adapter registered for {domain}"))
        })
    }
}

// Scriptable provider for tests (outages, per-key failures, latency)
pub mod mock {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Debug, Clone, Copy)]
    pub enum ProviderMode {
        Normal,
        CompleteOutage,
    }

    #[derive(Debug, Clone)]
    pub struct RecordedCall {
        pub key: String,
        pub started_at: Instant,
        pub finished_at: Instant,
    }

    pub struct MockProvider {
        mode: AtomicU8,
        request_count: AtomicUsize,
        fail_next_requests: AtomicUsize,
        delay_ms: AtomicUsize,
        failing_keys: Mutex<HashSet<String>>,
        quotes: Mutex<HashMap<String, Quote>>,
        prices: Mutex<BTreeMap<String, f64>>,
        calls: Mutex<Vec<RecordedCall>>,
        queries: Mutex<Vec<RefreshQuery>>,
    }

    impl MockProvider {
        pub fn new() -> Self {
            Self {
                mode: AtomicU8::new(0),
                request_count: AtomicUsize::new(0),
                fail_next_requests: AtomicUsize::new(0),
                delay_ms: AtomicUsize::new(0),
                failing_keys: Mutex::new(HashSet::new()),
                quotes: Mutex::new(HashMap::new()),
                prices: Mutex::new(BTreeMap::new()),
                calls: Mutex::new(Vec::new()),
                queries: Mutex::new(Vec::new()),
            }
        }

        pub fn set_mode(&self, mode: ProviderMode) {
            let mode_value = match mode {
                ProviderMode::Normal => 0,
                ProviderMode::CompleteOutage => 1,
            };
            self.mode.store(mode_value, Ordering::SeqCst);
        }

        pub fn set_delay(&self, delay_ms: usize) {
            self.delay_ms.store(delay_ms, Ordering::SeqCst);
        }

        pub fn fail_next_requests(&self, count: usize) {
            self.fail_next_requests.store(count, Ordering::SeqCst);
        }

        // Every fetch for this key fails
        pub fn fail_key(&self, key: &str) {
            self.failing_keys.lock().insert(key.to_string());
        }

        pub fn set_quote(&self, item_id: &str, quote: Quote) {
            self.quotes.lock().insert(item_id.to_string(), quote);
        }

        // Prices returned with every successful fetch
        pub fn set_price(&self, item_id: &str, price: f64) {
            self.prices.lock().insert(item_id.to_string(), price);
        }

        pub fn request_count(&self) -> usize {
            self.request_count.load(Ordering::SeqCst)
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().clone()
        }

        pub fn queries(&self) -> Vec<RefreshQuery> {
            self.queries.lock().clone()
        }

        async fn simulate(&self, key: &str) -> Result<(), ProviderError> {
            self.request_count.fetch_add(1, Ordering::SeqCst);

            if self.mode.load(Ordering::SeqCst) == 1 {
                return Err(ProviderError::Network("Service unavailable".to_string()));
            }

            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            }

            let fail_count = self.fail_next_requests.load(Ordering::SeqCst);
            if fail_count > 0 {
                self.fail_next_requests.store(fail_count - 1, Ordering::SeqCst);
                return Err(ProviderError::Upstream {
                    status_code: 500,
                    message: "Internal Server Error".to_string(),
                    is_retryable: true,
                });
            }

            if self.failing_keys.lock().contains(key) {
                return Err(ProviderError::Upstream {
                    status_code: 502,
                    message: format!("upstream rejected {key}"),
                    is_retryable: false,
                });
            }

            Ok(())
        }
    }

    impl Default for MockProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ProviderAdapter for MockProvider {
        async fn fetch(&self, key: &str, query: &RefreshQuery) -> Result<ProviderRecords, ProviderError> {
            let started_at = Instant::now();
            self.queries.lock().push(query.clone());
            let outcome = self.simulate(key).await;
            self.calls.lock().push(RecordedCall {
                key: key.to_string(),
                started_at,
                finished_at: Instant::now(),
            });
            outcome?;

            let window = match query {
                RefreshQuery::Hotels {
                    check_in, check_out, ..
                } => Some(crate::cache_store::DateWindow {
                    start: *check_in,
                    end: Some(*check_out),
                }),
                RefreshQuery::Flights {
                    departure,
                    return_date,
                    ..
                } => Some(crate::cache_store::DateWindow {
                    start: *departure,
                    end: *return_date,
                }),
                _ => None,
            };

            Ok(ProviderRecords {
                payload: Bytes::from(serde_json::to_vec(query).unwrap_or_default()),
                window,
                prices: self.prices.lock().clone(),
            })
        }

        async fn quote(&self, item: &CheckoutItem) -> Result<Quote, ProviderError> {
            self.simulate(item.provider_id()).await?;
            self.quotes
                .lock()
                .get(item.provider_id())
                .copied()
                .ok_or_else(|| ProviderError::NotFound(item.provider_id().to_string()))
        }
    }
}
