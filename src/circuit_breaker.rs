//! Named circuit breakers around provider calls.
//!
//! ```text
//! Closed --[volume reached and error rate >= threshold]--> Open
//! Open --[reset_timeout elapsed, next call]--> HalfOpen (single trial call)
//! HalfOpen --[trial succeeds]--> Closed
//! HalfOpen --[trial fails or times out]--> Open
//! ```
//!
//! Error rate is measured over a rolling window of completed calls. Rejected
//! calls never reach the wrapped function and are not part of the window.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    future::Future,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::clock::{Clock, SystemClock};
use crate::error::BreakerError;

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    pub timeout: Duration,
    pub error_threshold_percentage: u32,
    pub reset_timeout: Duration,
    pub volume_threshold: u32,
    pub rolling_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            error_threshold_percentage: 50,
            reset_timeout: Duration::from_secs(30),
            volume_threshold: 5,
            rolling_window: Duration::from_secs(10),
        }
    }
}

// Partial breaker settings as they appear in config files and at call sites
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerOptions {
    pub timeout_ms: Option<u64>,
    pub error_threshold_percentage: Option<u32>,
    pub reset_timeout_ms: Option<u64>,
    pub volume_threshold: Option<u32>,
    pub rolling_window_ms: Option<u64>,
}

impl BreakerOptions {
    // Fields set in `other` win
    pub fn overlay(&self, other: &BreakerOptions) -> BreakerOptions {
        BreakerOptions {
            timeout_ms: other.timeout_ms.or(self.timeout_ms),
            error_threshold_percentage: other
                .error_threshold_percentage
                .or(self.error_threshold_percentage),
            reset_timeout_ms: other.reset_timeout_ms.or(self.reset_timeout_ms),
            volume_threshold: other.volume_threshold.or(self.volume_threshold),
            rolling_window_ms: other.rolling_window_ms.or(self.rolling_window_ms),
        }
    }
}

impl BreakerConfig {
    pub fn merged(base: &BreakerConfig, options: &BreakerOptions) -> BreakerConfig {
        BreakerConfig {
            timeout: options
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(base.timeout),
            error_threshold_percentage: options
                .error_threshold_percentage
                .unwrap_or(base.error_threshold_percentage)
                .min(100),
            reset_timeout: options
                .reset_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(base.reset_timeout),
            volume_threshold: options.volume_threshold.unwrap_or(base.volume_threshold),
            rolling_window: options
                .rolling_window_ms
                .map(Duration::from_millis)
                .unwrap_or(base.rolling_window),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "half-open")]
    HalfOpen,
    #[serde(rename = "open")]
    Open,
}

impl CircuitState {
    // Gauge encoding: 0=closed, 1=half-open, 2=open
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::HalfOpen => write!(f, "half-open"),
            CircuitState::Open => write!(f, "open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Open,
    HalfOpen,
    Close,
    Success,
    Failure,
    Timeout,
    Reject,
    Fallback,
}

// Receives every breaker event; logging and metrics hang off this
pub trait BreakerObserver: Send + Sync + 'static {
    fn on_event(&self, breaker: &str, event: BreakerEvent, state: CircuitState);
}

#[derive(Debug, Default)]
pub struct TracingObserver;

impl BreakerObserver for TracingObserver {
    fn on_event(&self, breaker: &str, event: BreakerEvent, _state: CircuitState) {
        match event {
            BreakerEvent::Open => tracing::warn!(circuit_breaker = breaker, "Circuit breaker opened"),
            BreakerEvent::HalfOpen => {
                tracing::info!(circuit_breaker = breaker, "Circuit breaker half-open, testing...")
            }
            BreakerEvent::Close => tracing::info!(circuit_breaker = breaker, "Circuit breaker closed"),
            BreakerEvent::Timeout => tracing::warn!(circuit_breaker = breaker, "Circuit breaker timeout"),
            BreakerEvent::Reject => {
                tracing::warn!(circuit_breaker = breaker, "Circuit breaker rejected request")
            }
            BreakerEvent::Fallback => {
                tracing::info!(circuit_breaker = breaker, "Circuit breaker using fallback")
            }
            BreakerEvent::Success | BreakerEvent::Failure => {}
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub fallbacks: u64,
    pub rejects: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub stats: BreakerStats,
    #[serde(rename = "lastTransitionAt")]
    pub last_transition_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Timeout,
}

struct BreakerInner {
    state: CircuitState,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
    window: VecDeque<(Instant, Outcome)>,
    stats: BreakerStats,
    last_transition_at: DateTime<Utc>,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    observers: Vec<Arc<dyn BreakerObserver>>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_observers(name, config, Vec::new(), Arc::new(SystemClock))
    }

    pub fn with_observers(
        name: impl Into<String>,
        config: BreakerConfig,
        observers: Vec<Arc<dyn BreakerObserver>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                opened_at: None,
                trial_started: None,
                window: VecDeque::new(),
                stats: BreakerStats::default(),
                last_transition_at: clock.now(),
            }),
            observers,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state. An open breaker whose reset timeout has passed reports
    /// (and becomes) half-open even if no call has arrived since.
    pub fn state(&self) -> CircuitState {
        let (state, promoted) = {
            let mut inner = self.inner.lock();
            let promoted = self.promote_if_due(&mut inner, Instant::now());
            (inner.state, promoted)
        };
        if promoted {
            self.emit(&[BreakerEvent::HalfOpen], state);
        }
        state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let (snapshot, promoted) = {
            let mut inner = self.inner.lock();
            let promoted = self.promote_if_due(&mut inner, Instant::now());
            let snapshot = BreakerSnapshot {
                name: self.name.clone(),
                state: inner.state,
                stats: inner.stats.clone(),
                last_transition_at: inner.last_transition_at,
            };
            (snapshot, promoted)
        };
        if promoted {
            self.emit(&[BreakerEvent::HalfOpen], snapshot.state);
        }
        snapshot
    }

    /// Runs `f` under the breaker. Fails fast with `BreakerError::Open` while
    /// open, and aborts `f` once `timeout` elapses.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;

        match tokio::time::timeout(self.config.timeout, f()).await {
            Ok(Ok(value)) => {
                self.complete(Outcome::Success);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.complete(Outcome::Failure);
                Err(BreakerError::Inner(err))
            }
            Err(_) => {
                self.complete(Outcome::Timeout);
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    after: self.config.timeout,
                })
            }
        }
    }

    /// Like `call`, but any failure (including rejection and timeout) is
    /// logged and replaced by `fallback`. Never returns an error.
    pub async fn safe_call<F, Fut, T, E>(&self, fallback: T, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        match self.call(f).await {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(
                    circuit_breaker = %self.name,
                    err = %err,
                    "Circuit breaker call failed, using fallback"
                );
                let state = {
                    let mut inner = self.inner.lock();
                    inner.stats.fallbacks += 1;
                    inner.state
                };
                self.emit(&[BreakerEvent::Fallback], state);
                fallback
            }
        }
    }

    // Force the breaker closed and forget the rolling window
    pub fn reset(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            inner.window.clear();
            inner.trial_started = None;
            inner.opened_at = None;
            if inner.state != CircuitState::Closed {
                inner.state = CircuitState::Closed;
                inner.last_transition_at = self.clock.now();
                true
            } else {
                false
            }
        };
        if changed {
            self.emit(&[BreakerEvent::Close], CircuitState::Closed);
        }
    }

    fn admit<E>(&self) -> Result<(), BreakerError<E>> {
        let now = Instant::now();
        let mut events = Vec::new();

        let (admitted, state) = {
            let mut inner = self.inner.lock();
            if self.promote_if_due(&mut inner, now) {
                events.push(BreakerEvent::HalfOpen);
            }
            let admitted = match inner.state {
                CircuitState::Closed => true,
                CircuitState::Open => false,
                CircuitState::HalfOpen => {
                    // One trial at a time; a trial that outlived its timeout was abandoned
                    let trial_free = inner
                        .trial_started
                        .map_or(true, |at| now.duration_since(at) > self.config.timeout);
                    if trial_free {
                        inner.trial_started = Some(now);
                    }
                    trial_free
                }
            };
            if !admitted {
                inner.stats.rejects += 1;
                events.push(BreakerEvent::Reject);
            }
            (admitted, inner.state)
        };

        self.emit(&events, state);
        if admitted {
            Ok(())
        } else {
            Err(BreakerError::Open {
                name: self.name.clone(),
            })
        }
    }

    // Open -> HalfOpen once the reset timeout has elapsed; the trial slot starts free
    fn promote_if_due(&self, inner: &mut BreakerInner, now: Instant) -> bool {
        if inner.state != CircuitState::Open {
            return false;
        }
        let due = inner
            .opened_at
            .map_or(true, |at| now.duration_since(at) >= self.config.reset_timeout);
        if due {
            inner.state = CircuitState::HalfOpen;
            inner.trial_started = None;
            inner.last_transition_at = self.clock.now();
        }
        due
    }

    fn complete(&self, outcome: Outcome) {
        let now = Instant::now();
        let mut events = Vec::new();

        let state = {
            let mut inner = self.inner.lock();
            match outcome {
                Outcome::Success => {
                    inner.stats.successes += 1;
                    events.push(BreakerEvent::Success);
                }
                Outcome::Failure => {
                    inner.stats.failures += 1;
                    events.push(BreakerEvent::Failure);
                }
                Outcome::Timeout => {
                    inner.stats.timeouts += 1;
                    events.push(BreakerEvent::Timeout);
                }
            }

            match inner.state {
                CircuitState::HalfOpen => {
                    inner.trial_started = None;
                    inner.window.clear();
                    if outcome == Outcome::Success {
                        inner.state = CircuitState::Closed;
                        inner.opened_at = None;
                        events.push(BreakerEvent::Close);
                    } else {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(now);
                        events.push(BreakerEvent::Open);
                    }
                    inner.last_transition_at = self.clock.now();
                }
                CircuitState::Closed => {
                    inner.window.push_back((now, outcome));
                    let horizon = self.config.rolling_window;
                    while inner
                        .window
                        .front()
                        .is_some_and(|(at, _)| now.duration_since(*at) > horizon)
                    {
                        inner.window.pop_front();
                    }

                    if self.should_trip(&inner.window) {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(now);
                        inner.window.clear();
                        inner.last_transition_at = self.clock.now();
                        events.push(BreakerEvent::Open);
                    }
                }
                // A call admitted before another one tripped the breaker
                CircuitState::Open => {}
            }
            inner.state
        };

        self.emit(&events, state);
    }

    fn should_trip(&self, window: &VecDeque<(Instant, Outcome)>) -> bool {
        let volume = window.len() as u64;
        if volume < self.config.volume_threshold as u64 || volume == 0 {
            return false;
        }
        let failed = window
            .iter()
            .filter(|(_, outcome)| *outcome != Outcome::Success)
            .count() as u64;
        failed * 100 >= self.config.error_threshold_percentage as u64 * volume
    }

    fn emit(&self, events: &[BreakerEvent], state: CircuitState) {
        for event in events {
            for observer in &self.observers {
                observer.on_event(&self.name, *event, state);
            }
        }
    }
}

/// A function bound to a breaker and a fallback value. Calling it never
/// fails: errors, rejections and timeouts all yield the fallback.
pub struct GuardedFn<F, T> {
    breaker: Arc<CircuitBreaker>,
    f: F,
    fallback: T,
}

impl<F, T: Clone> GuardedFn<F, T> {
    pub async fn call<A, Fut, E>(&self, args: A) -> T
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.breaker
            .safe_call(self.fallback.clone(), || (self.f)(args))
            .await
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

/// Process-wide set of breakers, created lazily by name. Owned explicitly and
/// injected where needed rather than living in a global.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerOptions>,
    observers: Vec<Arc<dyn BreakerObserver>>,
    clock: Arc<dyn Clock>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
            overrides: HashMap::new(),
            observers: vec![Arc::new(TracingObserver)],
            clock: Arc::new(SystemClock),
        }
    }

    // Operator-configured options per breaker name; they win over call-site options
    pub fn with_overrides(mut self, overrides: HashMap<String, BreakerOptions>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BreakerObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn get_or_create(&self, name: &str, options: &BreakerOptions) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }

        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let effective = match self.overrides.get(name) {
                    Some(configured) => options.overlay(configured),
                    None => options.clone(),
                };
                let config = BreakerConfig::merged(&self.defaults, &effective);
                tracing::debug!(circuit_breaker = name, ?config, "Creating circuit breaker");
                Arc::new(CircuitBreaker::with_observers(
                    name,
                    config,
                    self.observers.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(name, &BreakerOptions::default())
    }

    pub fn with_circuit_breaker<F, T>(
        &self,
        name: &str,
        f: F,
        fallback: T,
        options: &BreakerOptions,
    ) -> GuardedFn<F, T> {
        GuardedFn {
            breaker: self.get_or_create(name, options),
            f,
            fallback,
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    // Forcibly close every breaker (operator use); returns how many were not closed
    pub fn reset_all(&self) -> usize {
        self.breakers
            .iter()
            .filter(|entry| {
                let was_tripped = entry.value().state() != CircuitState::Closed;
                entry.value().reset();
                was_tripped
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        opened: AtomicUsize,
        closed: AtomicUsize,
        rejected: AtomicUsize,
    }

    impl BreakerObserver for CountingObserver {
        fn on_event(&self, _breaker: &str, event: BreakerEvent, _state: CircuitState) {
            match event {
                BreakerEvent::Open => self.opened.fetch_add(1, Ordering::SeqCst),
                BreakerEvent::Close => self.closed.fetch_add(1, Ordering::SeqCst),
                BreakerEvent::Reject => self.rejected.fetch_add(1, Ordering::SeqCst),
                _ => 0,
            };
        }
    }

    async fn ok(breaker: &CircuitBreaker) -> Result<u32, BreakerError<String>> {
        breaker.call(|| async { Ok::<_, String>(1) }).await
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<u32, BreakerError<String>> {
        breaker
            .call(|| async { Err::<u32, _>("boom".to_string()) })
            .await
    }

    #[test]
    fn test_merge_options_onto_defaults() {
        let merged = BreakerConfig::merged(
            &BreakerConfig::default(),
            &BreakerOptions {
                timeout_ms: Some(2_000),
                volume_threshold: Some(10),
                ..Default::default()
            },
        );
        assert_eq!(merged.timeout, Duration::from_secs(2));
        assert_eq!(merged.volume_threshold, 10);
        assert_eq!(merged.error_threshold_percentage, 50);
        assert_eq!(merged.reset_timeout, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_volume_and_error_rate() {
        let breaker = CircuitBreaker::new("provider:hotel", BreakerConfig::default());

        assert!(ok(&breaker).await.is_ok());
        assert!(fail(&breaker).await.is_err());
        assert!(ok(&breaker).await.is_ok());
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Closed);

        // 5th call, 3 failures out of 5
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(matches!(ok(&breaker).await, Err(BreakerError::Open { .. })));
        assert_eq!(breaker.snapshot().stats.rejects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_first_still_open_at_volume() {
        let breaker = CircuitBreaker::new("provider:flight", BreakerConfig::default());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        let _ = ok(&breaker).await;
        let _ = ok(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_closes_on_success() {
        let observer = Arc::new(CountingObserver::default());
        let breaker = CircuitBreaker::with_observers(
            "provider:activity",
            BreakerConfig::default(),
            vec![observer.clone()],
            Arc::new(SystemClock),
        );
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(matches!(ok(&breaker).await, Err(BreakerError::Open { .. })));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(ok(&breaker).await.unwrap(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert_eq!(observer.opened.load(Ordering::SeqCst), 1);
        assert_eq!(observer.closed.load(Ordering::SeqCst), 1);
        assert_eq!(observer.rejected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_half_open_after_reset_timeout_without_traffic() {
        let observer = Arc::new(CountingObserver::default());
        let breaker = CircuitBreaker::with_observers(
            "provider:hotel",
            BreakerConfig::default(),
            vec![observer.clone()],
            Arc::new(SystemClock),
        );
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().state, CircuitState::HalfOpen);

        // The trial slot is still free after the read-side transition
        assert_eq!(ok(&breaker).await.unwrap(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(observer.rejected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_reopens() {
        let breaker = CircuitBreaker::new("provider:event", BreakerConfig::default());
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(ok(&breaker).await, Err(BreakerError::Open { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let config = BreakerConfig {
            volume_threshold: 1,
            ..BreakerConfig::default()
        };
        let breaker = CircuitBreaker::new("provider:slow", config);
        let result: Result<(), BreakerError<String>> = breaker
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(11)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Timeout { .. })));
        assert_eq!(breaker.snapshot().stats.timeouts, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safe_call_returns_fallback() {
        let breaker = CircuitBreaker::new("provider:hotel", BreakerConfig::default());
        let value = breaker
            .safe_call(Vec::<u32>::new(), || async { Err::<Vec<u32>, _>("down") })
            .await;
        assert!(value.is_empty());
        assert_eq!(breaker.snapshot().stats.fallbacks, 1);
    }

    #[tokio::test]
    async fn test_registry_reuses_breakers_and_applies_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "provider:flight".to_string(),
            BreakerOptions {
                timeout_ms: Some(3_000),
                ..Default::default()
            },
        );
        let registry = BreakerRegistry::default().with_overrides(overrides);

        let a = registry.breaker("provider:flight");
        let b = registry.get_or_create(
            "provider:flight",
            &BreakerOptions {
                timeout_ms: Some(9_000),
                ..Default::default()
            },
        );
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.config().timeout, Duration::from_secs(3));
        assert_eq!(registry.len(), 1);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot["provider:flight"].state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_circuit_breaker_never_fails() {
        let registry = BreakerRegistry::default();
        let guarded = registry.with_circuit_breaker(
            "provider:search",
            |city: &'static str| async move {
                if city == "LON" {
                    Err("upstream down".to_string())
                } else {
                    Ok(vec![city.to_string()])
                }
            },
            Vec::new(),
            &BreakerOptions::default(),
        );

        assert_eq!(guarded.call("PAR").await, vec!["PAR".to_string()]);
        assert!(guarded.call("LON").await.is_empty());
        assert_eq!(guarded.breaker().snapshot().stats.fallbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_all_closes_open_breakers() {
        let registry = BreakerRegistry::default();
        let breaker = registry.breaker("provider:hotel");
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        registry.breaker("provider:activity");
        assert_eq!(registry.reset_all(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
