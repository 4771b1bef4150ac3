use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use travel_cache_resilience::cache_store::{CacheRecord, DomainType, MemoryCacheStore};
use travel_cache_resilience::config::AppConfig;
use travel_cache_resilience::provider::mock::MockProvider;
use travel_cache_resilience::provider::{ProviderSet, Quote};
use travel_cache_resilience::server::{build_router, AppState};

struct TestApp {
    router: Router,
    store: Arc<MemoryCacheStore>,
    provider: Arc<MockProvider>,
}

fn test_app() -> TestApp {
    let store = Arc::new(MemoryCacheStore::default());
    let provider = Arc::new(MockProvider::new());
    let state = AppState::from_config(
        &AppConfig::default(),
        store.clone(),
        ProviderSet::uniform(provider.clone()),
    )
    .unwrap();

    TestApp {
        router: build_router(state),
        store,
        provider,
    }
}

fn seed_hotel(store: &MemoryCacheStore, key: &str, age_hours: i64, prices: &[(&str, f64)]) {
    let last_updated = Utc::now() - Duration::hours(age_hours);
    store.insert(CacheRecord {
        domain_type: DomainType::Hotel,
        key: key.to_string(),
        payload: Bytes::from_static(b"[]"),
        window: None,
        prices: prices
            .iter()
            .map(|(id, price)| (id.to_string(), *price))
            .collect::<BTreeMap<_, _>>(),
        last_updated: Some(last_updated),
        expires_at: last_updated + Duration::hours(24),
    });
}

async fn send(app: &TestApp, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_health_reports_database_and_breakers() {
    let app = test_app();

    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["database"]["status"], "healthy");
    assert_eq!(body["checks"]["external_apis"]["status"], "healthy");
    assert!(body["timestamp"].is_string());
    assert!(body["cache"]["hotels"]["total"].is_number());
}

#[tokio::test]
async fn test_database_outage_fails_health_and_readiness() {
    let app = test_app();
    app.store.set_available(false);

    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["checks"]["database"]["status"], "unhealthy");

    let (status, body) = send(&app, Method::GET, "/health/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], false);
    assert_eq!(body["message"], "Database not available");

    // Liveness never consults dependencies
    let (status, body) = send(&app, Method::GET, "/health/live", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alive"], true);
}

#[tokio::test]
async fn test_manual_refresh_and_status() {
    let app = test_app();
    seed_hotel(&app.store, "PAR", 21, &[]);
    seed_hotel(&app.store, "ROM", 1, &[]);

    let (status, stats) = send(&app, Method::POST, "/admin/cache/refresh", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["hotelsRefreshed"], 1);
    assert_eq!(stats["feverEventsRefreshed"], 0);
    assert_eq!(stats["errors"], json!([]));
    assert_eq!(app.provider.request_count(), 1);

    let (status, freshness) = send(&app, Method::GET, "/admin/cache/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(freshness["hotels"]["total"], 2);
    assert_eq!(freshness["hotels"]["fresh"], 2);
    assert_eq!(freshness["isRefreshing"], false);
    assert!(freshness["lastRefresh"].is_string());
}

#[tokio::test]
async fn test_status_reports_store_outage() {
    let app = test_app();
    app.store.set_available(false);

    let (status, body) = send(&app, Method::GET, "/admin/cache/status", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "STORE_UNAVAILABLE");
}

#[tokio::test]
async fn test_checkout_verification() {
    let app = test_app();
    seed_hotel(&app.store, "PAR", 2, &[("HLPAR1", 120.0)]);
    app.provider.set_quote(
        "HLPAR1",
        Quote {
            available: true,
            price: Some(140.0),
        },
    );

    let (status, body) = send(
        &app,
        Method::POST,
        "/admin/cache/verify",
        Some(json!({ "items": [{ "type": "hotel", "id": "hotel-HLPAR1" }] })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["verified"], true);
    let item = &body["items"][0];
    assert_eq!(item["priceChanged"], true);
    assert_eq!(item["cachedPrice"], 120.0);
    assert_eq!(item["currentPrice"], 140.0);

    let (status, _) = send(&app, Method::POST, "/admin/cache/verify", Some(json!({ "items": [] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_routes_use_strict_limit() {
    let app = test_app();

    for _ in 0..5 {
        let (status, _) = send(&app, Method::GET, "/admin/breakers", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    let request = Request::builder()
        .uri("/admin/cache/status")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "60");
    assert_eq!(response.headers()["x-ratelimit-limit"], "5");

    // Health probes are never limited
    for _ in 0..10 {
        let (status, _) = send(&app, Method::GET, "/health/live", None).await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn test_metrics_exposition() {
    let app = test_app();
    send(&app, Method::GET, "/health/live", None).await;

    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("http_requests_total"));
    assert!(text.contains("route=\"/health/live\""));
}

#[tokio::test]
async fn test_unknown_route_is_json_404() {
    let app = test_app();
    let (status, body) = send(&app, Method::GET, "/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_unmatched_paths_share_one_metrics_label() {
    let app = test_app();
    for path in ["/wp-login.php", "/.env", "/admin/../etc/passwd"] {
        let (status, _) = send(&app, Method::GET, path, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("route=\"unmatched\""));
    assert!(!text.contains("wp-login"));
    assert!(!text.contains(".env"));
}
