//! Command Router Tests
//!
//! End-to-end routing against mock downstream services:
//! - Configuration errors never reach the network
//! - Success, client error and retried server error envelopes
//! - Capacity and circuit-open fallbacks
//! - Caller deadlines
//! - Outbound tracing headers
//! - Reload and shutdown

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{any, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cr_common::{CircuitState, ErrorType};
use cr_config::{ConfigSource, RouterConfig, StaticSource, TomlFileSource};
use cr_router::{CommandRouter, EventBus, RouteOptions, RouterError};

fn router_from_toml(raw: &str) -> CommandRouter {
    let config = RouterConfig::from_toml_str(raw).unwrap();
    let source: Arc<dyn ConfigSource> = Arc::new(StaticSource::new(config.clone()));
    CommandRouter::new(config, source, EventBus::default()).unwrap()
}

fn standard_config(uri: &str) -> String {
    format!(
        r#"
environment = "test"

[router]
retry_base_delay_ms = 10
retry_max_delay_ms = 50
circuit_breaker_volume_threshold = 2

[endpoints.scrape]
url = "{uri}/scrape"
max_retries = 2

[endpoints.search]
url = "{uri}/search"
max_retries = 0

[endpoints.summarize]
url = "{uri}/summarize"
enabled = false
"#
    )
}

#[tokio::test]
async fn test_unknown_command_makes_no_http_call() {
    let server = MockServer::start().await;
    Mock::given(any()).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;

    let router = router_from_toml(&standard_config(&server.uri()));
    let err = router
        .route_command("nonexistent", json!({}), RouteOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, RouterError::NotConfigured(ref name) if name == "nonexistent"));
    assert!(router.history().is_empty());
}

#[tokio::test]
async fn test_disabled_command_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(any()).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;

    let router = router_from_toml(&standard_config(&server.uri()));
    let err = router
        .route_command("summarize", json!({}), RouteOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, RouterError::Disabled(_)));
}

#[tokio::test]
async fn test_successful_scrape() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scrape"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": "hello", "title": "Home"})))
        .expect(1)
        .mount(&server)
        .await;

    let router = router_from_toml(&standard_config(&server.uri()));
    let mut events = router.events().subscribe();

    let result = router
        .route_command("scrape", json!({"url": "https://example.com"}), RouteOptions::default())
        .await
        .unwrap();

    assert!(result.success);
    assert!(!result.fallback);
    assert_eq!(result.http_status, 200);
    assert_eq!(result.command_type, "scrape");
    assert_eq!(result.data.as_ref().unwrap()["content"], "hello");
    assert_eq!(router.history().len(), 1);
    assert_eq!(router.in_flight(), 0);
    assert_eq!(router.breakers().state("scrape"), CircuitState::Closed);

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert!(names.contains(&"command:routing"));
    assert!(names.contains(&"command:routed"));
    assert!(!names.contains(&"command:fallback"));
}

#[tokio::test]
async fn test_server_error_retried_then_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scrape"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "boom"})))
        .expect(3)
        .mount(&server)
        .await;

    let router = router_from_toml(&standard_config(&server.uri()));
    let result = router
        .route_command("scrape", json!({}), RouteOptions::default())
        .await
        .unwrap();

    assert!(!result.success);
    assert!(!result.fallback);
    assert_eq!(result.http_status, 500);
    assert_eq!(result.error_type(), Some(ErrorType::ServerError));
    assert_eq!(result.error.as_ref().unwrap().message, "boom");

    // One breaker failure per call, not per attempt
    let breaker = router.breakers().get("scrape").unwrap();
    assert_eq!(breaker.stats().total_failures, 1);
}

#[tokio::test]
async fn test_client_error_attempted_once_and_keeps_circuit_closed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scrape"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "no such page"})))
        .expect(2)
        .mount(&server)
        .await;

    let router = router_from_toml(&standard_config(&server.uri()));
    for _ in 0..2 {
        let result = router
            .route_command("scrape", json!({}), RouteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.http_status, 404);
        assert_eq!(result.error_type(), Some(ErrorType::ClientError));
        assert!(!result.fallback);
    }

    assert_eq!(router.breakers().state("scrape"), CircuitState::Closed);
    assert_eq!(router.breakers().get("scrape").unwrap().stats().total_successes, 2);
}

#[tokio::test]
async fn test_open_circuit_short_circuits() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let router = router_from_toml(&standard_config(&server.uri()));
    for _ in 0..2 {
        let result = router
            .route_command("search", json!({}), RouteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.http_status, 503);
        assert!(!result.fallback);
    }
    assert_eq!(router.breakers().state("search"), CircuitState::Open);

    let result = router
        .route_command("search", json!({}), RouteOptions::default())
        .await
        .unwrap();
    assert!(result.fallback);
    assert_eq!(result.http_status, 503);
    assert_eq!(result.error_type(), Some(ErrorType::CircuitBreakerOpen));

    // Other endpoints are unaffected
    assert_eq!(router.breakers().state("scrape"), CircuitState::Closed);
}

#[tokio::test]
async fn test_capacity_exceeded_returns_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})).set_delay(Duration::from_millis(500)))
        .expect(1)
        .mount(&server)
        .await;

    let router = Arc::new(router_from_toml(&format!(
        r#"
[router]
max_concurrent_requests = 1
queue_size = 0

[endpoints.slow]
url = "{}/slow"
"#,
        server.uri()
    )));

    let first = {
        let router = router.clone();
        tokio::spawn(async move { router.route_command("slow", json!({}), RouteOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let rejected = router
        .route_command("slow", json!({}), RouteOptions::default())
        .await
        .unwrap();
    assert!(rejected.fallback);
    assert_eq!(rejected.http_status, 429);
    assert_eq!(rejected.error_type(), Some(ErrorType::RateLimitExceeded));

    let completed = first.await.unwrap().unwrap();
    assert!(completed.success);
    assert_eq!(router.limiter().stats().total_rejected, 1);
}

#[tokio::test]
async fn test_deadline_bounds_the_whole_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scrape"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let router = router_from_toml(&standard_config(&server.uri()));
    let options = RouteOptions::default().with_deadline(Duration::from_millis(100));
    let result = router.route_command("scrape", json!({}), options).await.unwrap();

    assert!(!result.success);
    assert!(!result.fallback);
    assert_eq!(result.http_status, 504);
    assert_eq!(result.error_type(), Some(ErrorType::DeadlineExceeded));
    assert_eq!(router.in_flight(), 0);
}

#[tokio::test]
async fn test_reload_swaps_table() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(
        &mut file,
        br#"
[endpoints.scrape]
url = "http://scraper.internal/run"
"#,
    )
    .unwrap();

    let source: Arc<dyn ConfigSource> = Arc::new(TomlFileSource::new(file.path()));
    let router = CommandRouter::from_source(source, EventBus::default()).unwrap();
    assert_eq!(router.table().command_types(), vec!["scrape"]);

    std::fs::write(
        file.path(),
        r#"
[endpoints.scrape]
url = "http://scraper.internal/run"

[endpoints.search]
url = "http://search.internal/query"
"#,
    )
    .unwrap();
    assert_eq!(router.reload().unwrap(), 2);
    assert!(router.table().is_supported("search").is_ok());

    // A broken file keeps the current table
    std::fs::write(file.path(), "this is not toml [").unwrap();
    assert!(matches!(router.reload(), Err(RouterError::Config(_))));
    assert_eq!(router.table().len(), 2);
}

#[tokio::test]
async fn test_reload_on_blocking_pool() {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), "[endpoints.scrape]\nurl = \"http://scraper.internal/run\"\n").unwrap();

    let source: Arc<dyn ConfigSource> = Arc::new(TomlFileSource::new(file.path()));
    let router = Arc::new(CommandRouter::from_source(source, EventBus::default()).unwrap());

    std::fs::write(
        file.path(),
        "[endpoints.scrape]\nurl = \"http://scraper.internal/run\"\n\n[endpoints.search]\nurl = \"http://search.internal/query\"\n",
    )
    .unwrap();
    assert_eq!(router.clone().reload_blocking().await.unwrap(), 2);

    router.shutdown().await;
    assert!(matches!(router.clone().reload_blocking().await, Err(RouterError::ShuttingDown)));
}

#[tokio::test]
async fn test_shutdown_refuses_new_calls() {
    let router = router_from_toml(&standard_config("http://127.0.0.1:9"));
    router.shutdown().await;

    assert!(!router.is_running());
    assert!(router.limiter().is_shutting_down());
    let err = router
        .route_command("scrape", json!({}), RouteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::ShuttingDown));
    assert!(matches!(router.reload(), Err(RouterError::ShuttingDown)));
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scrape"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})).set_delay(Duration::from_millis(300)))
        .expect(1)
        .mount(&server)
        .await;

    let router = Arc::new(router_from_toml(&standard_config(&server.uri())));
    let call = {
        let router = router.clone();
        tokio::spawn(async move { router.route_command("scrape", json!({}), RouteOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(router.in_flight(), 1);

    let started = std::time::Instant::now();
    router.shutdown().await;
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(router.in_flight(), 0);

    let completed = call.await.unwrap().unwrap();
    assert!(completed.success);
}

#[tokio::test]
async fn test_shutdown_gives_up_after_grace_period() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let router = Arc::new(router_from_toml(&format!(
        r#"
[router]
shutdown_grace_ms = 200

[endpoints.slow]
url = "{}/slow"
max_retries = 0
"#,
        server.uri()
    )));
    let call = {
        let router = router.clone();
        tokio::spawn(async move { router.route_command("slow", json!({}), RouteOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    router.shutdown().await;
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(200));
    assert!(waited < Duration::from_secs(2));
    assert_eq!(router.in_flight(), 1);

    call.abort();
}

#[tokio::test]
async fn test_tracing_headers_sent_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scrape"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let router = router_from_toml(&format!(
        r#"
[endpoints.scrape]
url = "{}/scrape"

[endpoints.scrape.headers]
Content-Type = "text/plain"
x-team = "data"
"#,
        server.uri()
    ));
    let options = RouteOptions::default()
        .with_header("x-request-id", "spoofed")
        .with_header("X-Command-Type", "other");
    let result = router.route_command("scrape", json!({}), options).await.unwrap();
    assert!(result.success);

    let requests = server.received_requests().await.unwrap();
    let values = |name: &str| -> Vec<String> {
        requests[0]
            .headers
            .get(&name.parse::<wiremock::http::HeaderName>().unwrap())
            .map(|values| values.iter().map(|v| v.as_str().to_string()).collect())
            .unwrap_or_default()
    };
    assert_eq!(values("x-request-id"), vec![result.request_id.clone()]);
    assert_eq!(values("x-command-type"), vec!["scrape".to_string()]);
    assert_eq!(values("content-type"), vec!["application/json".to_string()]);
    assert_eq!(values("x-team"), vec!["data".to_string()]);
}

#[tokio::test]
async fn test_health_check_uses_probe_without_breaker() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/scrape"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let router = router_from_toml(&standard_config(&server.uri()));
    let health = router.health_check("scrape").await.unwrap();
    assert!(health.healthy);
    assert!(router.breakers().get("scrape").is_none());

    assert!(matches!(router.health_check("nonexistent").await, Err(RouterError::NotConfigured(_))));
}
