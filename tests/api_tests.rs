//! Health and readiness endpoints.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use tx_dispatcher::api::{create_router, AppState, HealthResponse, ReadinessResponse};
use tx_dispatcher::state::MemoryStore;
use tx_dispatcher::test_utils::FlakyStore;

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_reports_version() {
    let router = create_router(AppState {
        store: Arc::new(MemoryStore::new()),
    });

    let response = router.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let health: HealthResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn ready_when_store_answers() {
    let router = create_router(AppState {
        store: Arc::new(MemoryStore::new()),
    });

    let response = router.oneshot(get("/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let ready: ReadinessResponse = serde_json::from_slice(&body).unwrap();
    assert!(ready.ready);
    assert!(ready.database);
}

#[tokio::test]
async fn not_ready_when_store_is_down() {
    let store = Arc::new(FlakyStore::new(Arc::new(MemoryStore::new())));
    store.set_healthy(false);
    let router = create_router(AppState { store });

    let response = router.oneshot(get("/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let ready: ReadinessResponse = serde_json::from_slice(&body).unwrap();
    assert!(!ready.ready);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let router = create_router(AppState {
        store: Arc::new(MemoryStore::new()),
    });

    let response = router.oneshot(get("/jobs")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
