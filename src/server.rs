//! Operator HTTP surface: health probes, Prometheus exposition and cache
//! administration.
//!
//! Routes:
//! - `GET /health`, `/health/ready`, `/health/live` (unlimited)
//! - `GET /metrics`
//! - `/admin/*` behind the strict rate limiter

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::FutureExt;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::cache_store::CacheStore;
use crate::circuit_breaker::BreakerRegistry;
use crate::config::AppConfig;
use crate::error::{ServerError, ServerResult};
use crate::health::{DatabaseProbe, HealthAggregator, SystemMemoryProbe};
use crate::metrics::{track_metrics, MetricsRegistry};
use crate::provider::{CheckoutItem, ProviderSet};
use crate::rate_limiter::{rate_limit, RateLimitStore, RateLimiters};
use crate::scheduler::RefreshScheduler;

/// Shared handles behind every route. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<RefreshScheduler>,
    pub health: Arc<HealthAggregator>,
    pub metrics: Arc<MetricsRegistry>,
    pub breakers: Arc<BreakerRegistry>,
    pub limiters: RateLimiters,
}

impl AppState {
    /// Wires the subsystem from configuration around an existing cache store
    /// and the provider adapters.
    pub fn from_config<S>(
        config: &AppConfig,
        store: Arc<S>,
        providers: ProviderSet,
    ) -> prometheus::Result<Self>
    where
        S: CacheStore + DatabaseProbe,
    {
        let metrics = Arc::new(MetricsRegistry::new()?);

        let breakers = Arc::new(
            BreakerRegistry::new(config.breakers.base())
                .with_overrides(config.breakers.overrides.clone())
                .with_observer(metrics.clone()),
        );

        let scheduler = Arc::new(
            RefreshScheduler::new(
                store.clone(),
                providers,
                breakers.clone(),
                config.scheduler.clone(),
            )
            .with_metrics(metrics.clone()),
        );

        let health = Arc::new(
            HealthAggregator::new(
                store,
                Arc::new(SystemMemoryProbe::new(config.health.memory_limit_bytes)),
                breakers.clone(),
            )
            .with_thresholds(config.health.thresholds.clone())
            .with_version(config.server.version.clone())
            .with_scheduler(scheduler.clone()),
        );

        let limiters = RateLimiters::new(
            Arc::new(RateLimitStore::default()),
            |class| config.rate_limits.rule(class),
            Some(metrics.clone()),
        );

        Ok(Self {
            scheduler,
            health,
            metrics,
            breakers,
            limiters,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/admin/cache/refresh", post(trigger_refresh))
        .route("/admin/cache/status", get(cache_status))
        .route("/admin/cache/verify", post(verify_checkout))
        .route("/admin/breakers", get(breaker_status))
        .route("/admin/breakers/reset", post(reset_breakers))
        .route_layer(from_fn_with_state(state.limiters.strict.clone(), rate_limit));

    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(readiness))
        .route("/health/live", get(liveness))
        .route("/metrics", get(metrics))
        .merge(admin_routes)
        .fallback(not_found)
        .layer(from_fn_with_state(state.metrics.clone(), track_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Starts the scheduler and the rate-limit sweeper, then serves until
/// SIGTERM or Ctrl+C.
pub async fn serve(config: &AppConfig, state: AppState) -> anyhow::Result<()> {
    let addr = config.server.socket_addr()?;

    state.scheduler.start();
    let _sweeper = state
        .limiters
        .store()
        .spawn_sweeper(config.rate_limits.sweep_interval());

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, version = %config.server.version, "Starting cache resilience server");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.scheduler.stop();
    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(err = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(err = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    match AssertUnwindSafe(state.health.report()).catch_unwind().await {
        Ok(report) => {
            let status = if report.is_unhealthy() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            (status, Json(report)).into_response()
        }
        Err(_) => {
            tracing::error!("Health check aggregation failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "timestamp": state.health.now(),
                    "error": "Health check failed",
                })),
            )
                .into_response()
        }
    }
}

async fn readiness(State(state): State<AppState>) -> Response {
    let readiness = state.health.readiness().await;
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness)).into_response()
}

async fn liveness(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.liveness())
}

async fn metrics(State(state): State<AppState>) -> ServerResult<Response> {
    let (content_type, body) = state
        .metrics
        .render()
        .map_err(|err| ServerError::Internal(format!("metrics encoding failed: {err}")))?;
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

async fn trigger_refresh(State(state): State<AppState>) -> impl IntoResponse {
    tracing::info!("Manual cache refresh requested");
    Json(state.scheduler.trigger_manual_refresh().await)
}

async fn cache_status(State(state): State<AppState>) -> ServerResult<impl IntoResponse> {
    Ok(Json(state.scheduler.freshness_status().await?))
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    items: Vec<CheckoutItem>,
}

async fn verify_checkout(
    State(state): State<AppState>,
    Json(request): Json<VerifyRequest>,
) -> ServerResult<impl IntoResponse> {
    if request.items.is_empty() {
        return Err(ServerError::BadRequest("items must not be empty".to_string()));
    }
    let results = state.scheduler.verify_for_checkout(&request.items).await;
    let all_verified = results.iter().all(|result| result.verified);
    Ok(Json(json!({
        "verified": all_verified,
        "items": results,
    })))
}

async fn breaker_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.breakers.snapshot())
}

async fn reset_breakers(State(state): State<AppState>) -> impl IntoResponse {
    let reset = state.breakers.reset_all();
    tracing::warn!(reset, "Circuit breakers force-closed by operator");
    Json(json!({ "reset": reset }))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": {
                "code": "NOT_FOUND",
                "message": "The requested resource was not found",
            }
        })),
    )
}
