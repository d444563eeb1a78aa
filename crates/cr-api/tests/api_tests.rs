//! API Endpoint Tests
//!
//! Tests for:
//! - Command submission (success, unknown command, bad payload, header forwarding)
//! - Health endpoints (basic, liveness, readiness)
//! - Monitoring endpoints
//! - Routes and configuration reload

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cr_api::{create_router, AppState};
use cr_config::{ConfigSource, RouterConfig, StaticSource};
use cr_router::{CommandRouter, EventBus, HealthMonitor, HealthMonitorConfig};

fn test_state(uri: &str) -> AppState {
    let raw = format!(
        r#"
environment = "test"

[endpoints.scrape]
url = "{uri}/scrape"
max_retries = 0

[endpoints.search]
url = "{uri}/search"
enabled = false
"#
    );
    let config = RouterConfig::from_toml_str(&raw).unwrap();
    let source: Arc<dyn ConfigSource> = Arc::new(StaticSource::new(config.clone()));
    let router = Arc::new(CommandRouter::new(config, source, EventBus::default()).unwrap());
    let monitor = Arc::new(HealthMonitor::new(router.clone(), HealthMonitorConfig::default()));

    AppState {
        router,
        monitor,
        prometheus: None,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ============================================================================
// Command Tests
// ============================================================================

#[tokio::test]
async fn test_command_routed_with_forwarded_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scrape"))
        .and(header("x-tenant", "acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": "page"})))
        .expect(1)
        .mount(&server)
        .await;

    let app = create_router(test_state(&server.uri()));
    let request = Request::builder()
        .method(Method::POST)
        .uri("/commands/scrape")
        .header("content-type", "application/json")
        .header("x-forward-x-tenant", "acme")
        .header("x-routing-strategy", "fastest")
        .body(Body::from(json!({"url": "https://example.com"}).to_string()))
        .unwrap();

    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["fallback"], false);
    assert_eq!(body["httpStatus"], 200);
    assert_eq!(body["data"]["content"], "page");
}

#[tokio::test]
async fn test_unknown_command_returns_404_with_reason() {
    let app = create_router(test_state("http://127.0.0.1:9"));

    let (status, body) = send(&app, post_json("/commands/nonexistent", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["reason"], "not_configured");

    let (status, body) = send(&app, post_json("/commands/search", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["reason"], "disabled");
}

#[tokio::test]
async fn test_malformed_payload_rejected() {
    let app = create_router(test_state("http://127.0.0.1:9"));
    let request = Request::builder()
        .method(Method::POST)
        .uri("/commands/scrape")
        .body(Body::from("{not json"))
        .unwrap();

    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
}

// ============================================================================
// Health Tests
// ============================================================================

#[tokio::test]
async fn test_health_endpoints() {
    let app = create_router(test_state("http://127.0.0.1:9"));

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "UP");

    let (status, body) = send(&app, get("/health/live")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "LIVE");

    let (status, body) = send(&app, get("/health/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "READY");
}

#[tokio::test]
async fn test_not_ready_after_shutdown() {
    let state = test_state("http://127.0.0.1:9");
    let router = state.router.clone();
    let app = create_router(state);

    router.shutdown().await;

    let (status, body) = send(&app, get("/health/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "NOT_READY");

    let (status, body) = send(&app, post_json("/commands/scrape", json!({}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "shutting_down");
}

// ============================================================================
// Monitoring Tests
// ============================================================================

#[tokio::test]
async fn test_monitoring_after_a_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scrape"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": "page"})))
        .mount(&server)
        .await;

    let app = create_router(test_state(&server.uri()));
    send(&app, post_json("/commands/scrape", json!({}))).await;

    let (status, body) = send(&app, get("/monitoring")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "HEALTHY");
    assert_eq!(body["healthReport"]["routes_total"], 2);
    assert_eq!(body["history"]["scrape"]["total"], 1);

    let (status, body) = send(&app, get("/monitoring/circuit-breakers")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalClosed"], 1);
    assert_eq!(body["breakers"][0]["name"], "scrape");

    let (status, body) = send(&app, get("/monitoring/limiter")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_processed"], 1);

    let (status, body) = send(&app, get("/monitoring/history?limit=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["commandType"], "scrape");
}

// ============================================================================
// Configuration Tests
// ============================================================================

#[tokio::test]
async fn test_routes_and_reload() {
    let app = create_router(test_state("http://127.0.0.1:9"));

    let (status, body) = send(&app, get("/routes")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["environment"], "test");
    assert_eq!(body["routes"].as_array().unwrap().len(), 2);
    assert_eq!(body["routes"][0]["commandType"], "scrape");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/config/reload")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["routes"], 2);
}

#[tokio::test]
async fn test_metrics_without_recorder() {
    let app = create_router(test_state("http://127.0.0.1:9"));
    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_openapi_document_served() {
    let app = create_router(test_state("http://127.0.0.1:9"));
    let (status, body) = send(&app, get("/api-doc/openapi.json")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/commands/{command_type}"].is_object());
}
