// Fixed-window rate limiting for inbound HTTP routes.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::metrics::MetricsRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    // Epoch millis at which the window closes
    pub reset_time: i64,
}

/// Shared counter store for every limiter. Keys carry the limiter name, so
/// limiters never share counters.
pub struct RateLimitStore {
    entries: DashMap<String, RateLimitEntry>,
    clock: Arc<dyn Clock>,
}

impl RateLimitStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Counts one request for `key`. A missing entry, or one whose window
    /// already closed, is replaced by a fresh window with count 1.
    pub fn increment(&self, key: &str, window: Duration) -> RateLimitEntry {
        let now = self.clock.now_millis();
        let fresh = RateLimitEntry {
            count: 1,
            reset_time: now + window.as_millis() as i64,
        };

        // The entry guard holds the shard lock for the whole read-modify-write
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if now <= occupied.get().reset_time => {
                let entry = occupied.get_mut();
                entry.count = entry.count.saturating_add(1);
                *entry
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(fresh);
                fresh
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                fresh
            }
        }
    }

    // Drop entries whose window has closed; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.reset_time >= now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> SweeperHandle {
        let store = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else { break };
                let removed = store.sweep();
                if removed > 0 {
                    tracing::debug!(removed, remaining = store.len(), "Swept rate limit entries");
                }
            }
        });
        SweeperHandle(handle)
    }
}

impl Default for RateLimitStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

// Aborts the sweep task when dropped
pub struct SweeperHandle(JoinHandle<()>);

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub window_ms: u64,
    pub max_requests: u32,
}

impl RateLimitRule {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            max_requests,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.window_ms.div_ceil(1000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    General,
    Ai,
    Search,
    Auth,
    Strict,
}

impl RouteClass {
    pub const ALL: [RouteClass; 5] = [
        RouteClass::General,
        RouteClass::Ai,
        RouteClass::Search,
        RouteClass::Auth,
        RouteClass::Strict,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RouteClass::General => "general",
            RouteClass::Ai => "ai",
            RouteClass::Search => "search",
            RouteClass::Auth => "auth",
            RouteClass::Strict => "strict",
        }
    }

    pub fn default_rule(&self) -> RateLimitRule {
        match self {
            RouteClass::General => RateLimitRule::new(Duration::from_secs(60), 100),
            RouteClass::Ai => RateLimitRule::new(Duration::from_secs(60), 10),
            RouteClass::Search => RateLimitRule::new(Duration::from_secs(60), 30),
            RouteClass::Auth => RateLimitRule::new(Duration::from_secs(15 * 60), 5),
            RouteClass::Strict => RateLimitRule::new(Duration::from_secs(60), 5),
        }
    }
}

type KeyGenerator = Arc<dyn Fn(&Request) -> String + Send + Sync>;
type SkipPredicate = Arc<dyn Fn(&Request) -> bool + Send + Sync>;
type RejectionHandler = Arc<dyn Fn(&RateLimitRule) -> Response + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub limit: u32,
    pub count: u32,
    pub remaining: u32,
    pub reset_time: i64,
}

impl RateLimitDecision {
    pub fn allowed(&self) -> bool {
        self.count <= self.limit
    }
}

/// One named limiter. Cheap to clone; used as axum middleware state.
#[derive(Clone)]
pub struct RateLimiter {
    name: &'static str,
    rule: RateLimitRule,
    store: Arc<RateLimitStore>,
    key_generator: KeyGenerator,
    skip: SkipPredicate,
    handler: RejectionHandler,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl RateLimiter {
    pub fn new(name: &'static str, rule: RateLimitRule, store: Arc<RateLimitStore>) -> Self {
        Self {
            name,
            rule,
            store,
            key_generator: Arc::new(move |request: &Request| {
                format!("{}:{}", name, client_ip(request))
            }),
            skip: Arc::new(|_: &Request| false),
            handler: Arc::new(default_rejection),
            metrics: None,
        }
    }

    pub fn for_class(class: RouteClass, rule: RateLimitRule, store: Arc<RateLimitStore>) -> Self {
        Self::new(class.name(), rule, store)
    }

    pub fn with_key_generator(
        mut self,
        key_generator: impl Fn(&Request) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_generator = Arc::new(key_generator);
        self
    }

    pub fn with_skip(mut self, skip: impl Fn(&Request) -> bool + Send + Sync + 'static) -> Self {
        self.skip = Arc::new(skip);
        self
    }

    pub fn with_handler(
        mut self,
        handler: impl Fn(&RateLimitRule) -> Response + Send + Sync + 'static,
    ) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn rule(&self) -> RateLimitRule {
        self.rule
    }

    pub fn check(&self, key: &str) -> RateLimitDecision {
        let entry = self.store.increment(key, self.rule.window());
        RateLimitDecision {
            limit: self.rule.max_requests,
            count: entry.count,
            remaining: self.rule.max_requests.saturating_sub(entry.count),
            reset_time: entry.reset_time,
        }
    }
}

fn default_rejection(rule: &RateLimitRule) -> Response {
    let retry_after = rule.retry_after_secs();
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "Too Many Requests",
            "message": format!("Rate limit exceeded. Try again in {retry_after} seconds."),
            "retryAfter": retry_after,
        })),
    )
        .into_response();
    response
        .headers_mut()
        .insert("retry-after", HeaderValue::from(retry_after));
    response
}

/// Client address for keying: first `x-forwarded-for` hop, then the socket
/// peer address, else "unknown".
pub fn client_ip(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Rate limiting middleware, installed with
/// `axum::middleware::from_fn_with_state(limiter, rate_limit)`.
pub async fn rate_limit(State(limiter): State<RateLimiter>, request: Request, next: Next) -> Response {
    if (limiter.skip)(&request) {
        return next.run(request).await;
    }

    let key = (limiter.key_generator)(&request);
    let decision = limiter.check(&key);

    let mut response = if decision.allowed() {
        next.run(request).await
    } else {
        tracing::warn!(
            limiter = limiter.name,
            ip = %client_ip(&request),
            path = %request.uri().path(),
            count = decision.count,
            limit = decision.limit,
            "Rate limit exceeded"
        );
        if let Some(metrics) = &limiter.metrics {
            metrics.record_rate_limit_rejection(limiter.name);
        }
        (limiter.handler)(&limiter.rule)
    };

    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from((decision.reset_time.max(0) as u64).div_ceil(1000)),
    );
    response
}

/// The fixed set of limiters, all backed by one store.
#[derive(Clone)]
pub struct RateLimiters {
    pub general: RateLimiter,
    pub ai: RateLimiter,
    pub search: RateLimiter,
    pub auth: RateLimiter,
    pub strict: RateLimiter,
    store: Arc<RateLimitStore>,
}

impl RateLimiters {
    pub fn new(
        store: Arc<RateLimitStore>,
        rule_for: impl Fn(RouteClass) -> RateLimitRule,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        let build = |class: RouteClass| {
            let limiter = RateLimiter::for_class(class, rule_for(class), store.clone());
            match &metrics {
                Some(metrics) => limiter.with_metrics(metrics.clone()),
                None => limiter,
            }
        };

        Self {
            general: build(RouteClass::General),
            ai: build(RouteClass::Ai),
            search: build(RouteClass::Search),
            auth: build(RouteClass::Auth),
            strict: build(RouteClass::Strict),
            store,
        }
    }

    pub fn with_defaults(store: Arc<RateLimitStore>) -> Self {
        Self::new(store, |class| class.default_rule(), None)
    }

    pub fn get(&self, class: RouteClass) -> &RateLimiter {
        match class {
            RouteClass::General => &self.general,
            RouteClass::Ai => &self.ai,
            RouteClass::Search => &self.search,
            RouteClass::Auth => &self.auth,
            RouteClass::Strict => &self.strict,
        }
    }

    pub fn store(&self) -> &Arc<RateLimitStore> {
        &self.store
    }
}
