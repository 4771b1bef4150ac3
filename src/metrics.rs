//! Prometheus metrics for the resilience subsystem.
//!
//! Every series lives in a registry owned by `MetricsRegistry`, so tests and
//! multiple instances never collide on the process-global default registry.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::circuit_breaker::{BreakerEvent, BreakerObserver, CircuitState};

const HTTP_LATENCY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

const DB_LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

const EXTERNAL_LATENCY_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

const AI_LATENCY_BUCKETS: &[f64] = &[0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0];

// Refresh cycles include inter-batch delays, so they run long
const CYCLE_DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0];

pub struct MetricsRegistry {
    registry: Registry,

    /// labels: method, route, status_code
    pub http_request_duration_seconds: HistogramVec,
    /// labels: method, route, status_code
    pub http_requests_total: IntCounterVec,
    /// In-flight HTTP requests
    pub active_connections: IntGauge,

    /// labels: operation, table
    pub database_query_duration_seconds: HistogramVec,

    /// labels: service, status
    pub external_api_calls_total: IntCounterVec,
    /// labels: service
    pub external_api_duration_seconds: HistogramVec,

    /// 0=closed, 1=half-open, 2=open; labels: name
    pub circuit_breaker_state: IntGaugeVec,

    /// labels: cache_type
    pub cache_hits_total: IntCounterVec,
    pub cache_misses_total: IntCounterVec,

    /// labels: provider, operation
    pub ai_request_duration_seconds: HistogramVec,
    /// labels: provider, type
    pub ai_tokens_used_total: IntCounterVec,

    /// labels: domain_type, status
    pub cache_refresh_items_total: IntCounterVec,
    pub cache_refresh_cycle_duration_seconds: Histogram,

    /// labels: limiter
    pub rate_limit_rejections_total: IntCounterVec,
}

impl MetricsRegistry {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "Duration of HTTP requests in seconds",
            )
            .buckets(HTTP_LATENCY_BUCKETS.to_vec()),
            &["method", "route", "status_code"],
        )?;
        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "route", "status_code"],
        )?;
        let active_connections =
            IntGauge::new("active_connections", "Number of active connections")?;

        let database_query_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "database_query_duration_seconds",
                "Duration of database queries in seconds",
            )
            .buckets(DB_LATENCY_BUCKETS.to_vec()),
            &["operation", "table"],
        )?;

        let external_api_calls_total = IntCounterVec::new(
            Opts::new("external_api_calls_total", "Total number of external API calls"),
            &["service", "status"],
        )?;
        let external_api_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "external_api_duration_seconds",
                "Duration of external API calls in seconds",
            )
            .buckets(EXTERNAL_LATENCY_BUCKETS.to_vec()),
            &["service"],
        )?;

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=half-open, 2=open)",
            ),
            &["name"],
        )?;

        let cache_hits_total = IntCounterVec::new(
            Opts::new("cache_hits_total", "Total number of cache hits"),
            &["cache_type"],
        )?;
        let cache_misses_total = IntCounterVec::new(
            Opts::new("cache_misses_total", "Total number of cache misses"),
            &["cache_type"],
        )?;

        let ai_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "ai_request_duration_seconds",
                "Duration of AI API requests in seconds",
            )
            .buckets(AI_LATENCY_BUCKETS.to_vec()),
            &["provider", "operation"],
        )?;
        let ai_tokens_used_total = IntCounterVec::new(
            Opts::new("ai_tokens_used_total", "Total number of AI tokens used"),
            &["provider", "type"],
        )?;

        let cache_refresh_items_total = IntCounterVec::new(
            Opts::new(
                "cache_refresh_items_total",
                "Cache keys processed by refresh cycles",
            ),
            &["domain_type", "status"],
        )?;
        let cache_refresh_cycle_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "cache_refresh_cycle_duration_seconds",
                "Duration of cache refresh cycles in seconds",
            )
            .buckets(CYCLE_DURATION_BUCKETS.to_vec()),
        )?;

        let rate_limit_rejections_total = IntCounterVec::new(
            Opts::new(
                "rate_limit_rejections_total",
                "Requests rejected by a rate limiter",
            ),
            &["limiter"],
        )?;

        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(database_query_duration_seconds.clone()))?;
        registry.register(Box::new(external_api_calls_total.clone()))?;
        registry.register(Box::new(external_api_duration_seconds.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;
        registry.register(Box::new(cache_hits_total.clone()))?;
        registry.register(Box::new(cache_misses_total.clone()))?;
        registry.register(Box::new(ai_request_duration_seconds.clone()))?;
        registry.register(Box::new(ai_tokens_used_total.clone()))?;
        registry.register(Box::new(cache_refresh_items_total.clone()))?;
        registry.register(Box::new(cache_refresh_cycle_duration_seconds.clone()))?;
        registry.register(Box::new(rate_limit_rejections_total.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            http_request_duration_seconds,
            http_requests_total,
            active_connections,
            database_query_duration_seconds,
            external_api_calls_total,
            external_api_duration_seconds,
            circuit_breaker_state,
            cache_hits_total,
            cache_misses_total,
            ai_request_duration_seconds,
            ai_tokens_used_total,
            cache_refresh_items_total,
            cache_refresh_cycle_duration_seconds,
            rate_limit_rejections_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn observe_http_request(&self, method: &str, route: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        self.http_request_duration_seconds
            .with_label_values(&[method, route, status.as_str()])
            .observe(elapsed.as_secs_f64());
        self.http_requests_total
            .with_label_values(&[method, route, status.as_str()])
            .inc();
    }

    pub fn observe_db_query(&self, operation: &str, table: &str, elapsed: Duration) {
        self.database_query_duration_seconds
            .with_label_values(&[operation, table])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_external_call(&self, service: &str, success: bool, elapsed: Duration) {
        let status = if success { "success" } else { "error" };
        self.external_api_calls_total
            .with_label_values(&[service, status])
            .inc();
        self.external_api_duration_seconds
            .with_label_values(&[service])
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_breaker_state(&self, name: &str, state: CircuitState) {
        self.circuit_breaker_state
            .with_label_values(&[name])
            .set(state.as_gauge());
    }

    pub fn record_cache_hit(&self, cache_type: &str) {
        self.cache_hits_total.with_label_values(&[cache_type]).inc();
    }

    pub fn record_cache_miss(&self, cache_type: &str) {
        self.cache_misses_total.with_label_values(&[cache_type]).inc();
    }

    pub fn observe_ai_request(&self, provider: &str, operation: &str, elapsed: Duration) {
        self.ai_request_duration_seconds
            .with_label_values(&[provider, operation])
            .observe(elapsed.as_secs_f64());
    }

    // token_type is "prompt" or "completion"
    pub fn record_ai_tokens(&self, provider: &str, token_type: &str, tokens: u64) {
        self.ai_tokens_used_total
            .with_label_values(&[provider, token_type])
            .inc_by(tokens);
    }

    pub fn record_refresh_item(&self, domain_type: &str, success: bool) {
        let status = if success { "success" } else { "error" };
        self.cache_refresh_items_total
            .with_label_values(&[domain_type, status])
            .inc();
    }

    pub fn observe_refresh_cycle(&self, elapsed: Duration) {
        self.cache_refresh_cycle_duration_seconds
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_rate_limit_rejection(&self, limiter: &str) {
        self.rate_limit_rejections_total
            .with_label_values(&[limiter])
            .inc();
    }

    /// Encodes every registered family in the Prometheus text format.
    /// Returns the content type alongside the body.
    pub fn render(&self) -> prometheus::Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

impl BreakerObserver for MetricsRegistry {
    fn on_event(&self, breaker: &str, event: BreakerEvent, state: CircuitState) {
        match event {
            BreakerEvent::Open | BreakerEvent::HalfOpen | BreakerEvent::Close => {
                self.set_breaker_state(breaker, state)
            }
            // First sighting of a breaker registers it as closed
            BreakerEvent::Success | BreakerEvent::Failure if state == CircuitState::Closed => {
                self.set_breaker_state(breaker, state)
            }
            _ => {}
        }
    }
}

// Label for requests that matched no route (the 404 fallback)
const UNMATCHED_ROUTE: &str = "unmatched";

// Keeps the in-flight gauge honest even if the handler future is dropped
struct ConnectionGuard(IntGauge);

impl ConnectionGuard {
    fn new(gauge: &IntGauge) -> Self {
        gauge.inc();
        Self(gauge.clone())
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// HTTP metrics middleware: records duration and count per
/// method/route/status once the response is produced.
pub async fn track_metrics(
    State(metrics): State<Arc<MetricsRegistry>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    // Route templates keep label cardinality bounded; raw paths never become labels
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());

    let _connection = ConnectionGuard::new(&metrics.active_connections);
    let started = std::time::Instant::now();
    let response = next.run(request).await;

    metrics.observe_http_request(&method, &route, response.status().as_u16(), started.elapsed());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_independent() {
        let a = MetricsRegistry::new().unwrap();
        let b = MetricsRegistry::new().unwrap();

        a.record_cache_hit("hotel");
        a.record_cache_hit("hotel");
        b.record_cache_miss("hotel");

        assert_eq!(a.cache_hits_total.with_label_values(&["hotel"]).get(), 2);
        assert_eq!(b.cache_hits_total.with_label_values(&["hotel"]).get(), 0);
        assert_eq!(b.cache_misses_total.with_label_values(&["hotel"]).get(), 1);
    }

    #[test]
    fn test_breaker_events_drive_state_gauge() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.on_event("provider:hotel", BreakerEvent::Open, CircuitState::Open);
        assert_eq!(
            metrics
                .circuit_breaker_state
                .with_label_values(&["provider:hotel"])
                .get(),
            2
        );

        metrics.on_event("provider:hotel", BreakerEvent::HalfOpen, CircuitState::HalfOpen);
        assert_eq!(
            metrics
                .circuit_breaker_state
                .with_label_values(&["provider:hotel"])
                .get(),
            1
        );

        metrics.on_event("provider:hotel", BreakerEvent::Close, CircuitState::Closed);
        assert_eq!(
            metrics
                .circuit_breaker_state
                .with_label_values(&["provider:hotel"])
                .get(),
            0
        );
    }

    #[test]
    fn test_render_contains_recorded_series() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.observe_http_request("GET", "/health", 200, Duration::from_millis(12));
        metrics.record_external_call("provider:flight", false, Duration::from_millis(300));
        metrics.record_ai_tokens("openai", "prompt", 120);
        metrics.record_refresh_item("hotel", true);
        metrics.observe_refresh_cycle(Duration::from_secs(42));

        let (content_type, body) = metrics.render().unwrap();
        let text = String::from_utf8(body).unwrap();

        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("http_requests_total{method=\"GET\",route=\"/health\",status_code=\"200\"} 1"));
        assert!(text.contains("external_api_calls_total{service=\"provider:flight\",status=\"error\"} 1"));
        assert!(text.contains("ai_tokens_used_total{provider=\"openai\",type=\"prompt\"} 120"));
        assert!(text.contains("cache_refresh_items_total{domain_type=\"hotel\",status=\"success\"} 1"));
        assert!(text.contains("cache_refresh_cycle_duration_seconds_count 1"));
    }

    #[test]
    fn test_connection_guard_balances_gauge() {
        let metrics = MetricsRegistry::new().unwrap();
        {
            let _a = ConnectionGuard::new(&metrics.active_connections);
            let _b = ConnectionGuard::new(&metrics.active_connections);
            assert_eq!(metrics.active_connections.get(), 2);
        }
        assert_eq!(metrics.active_connections.get(), 0);
    }
}
