//! Command Router API
//!
//! HTTP API endpoints for:
//! - Command submission
//! - Health and monitoring
//! - Kubernetes probes (liveness/readiness)
//! - Route listing and configuration reload
//! - Prometheus metrics

pub mod model;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cr_common::{CircuitState, HealthReport, HealthStatus, HistoryEntry, LimiterStats, RoutingResult};
use cr_router::{CommandRouter, HealthMonitor, RouteOptions, RouterError};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::Value;
use tracing::{debug, error, info};
use utoipa::OpenApi;

use model::{
    ApiError, CircuitBreakersResponse, ConfigReloadResponse, HistoryQuery, MonitoringResponse, ProbeResponse,
    RoutesResponse, SimpleHealthResponse,
};

pub const HEADER_ROUTING_STRATEGY: &str = "x-routing-strategy";
pub const HEADER_DEADLINE_MS: &str = "x-deadline-ms";
/// Headers with this prefix are forwarded downstream with the prefix stripped
pub const FORWARD_HEADER_PREFIX: &str = "x-forward-";

const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<CommandRouter>,
    pub monitor: Arc<HealthMonitor>,
    /// Absent when no Prometheus recorder was installed
    pub prometheus: Option<PrometheusHandle>,
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Command Router API",
        description = "Routes commands to downstream services and exposes health, routes and metrics"
    ),
    tags(
        (name = "commands", description = "Command submission"),
        (name = "health", description = "Health and probes"),
        (name = "monitoring", description = "Breaker, limiter and history state"),
        (name = "config", description = "Routes and reload")
    ),
    paths(
        route_command,
        health_handler,
        liveness_probe,
        readiness_probe,
        monitoring_handler,
        circuit_breakers_handler,
        limiter_handler,
        history_handler,
        routes_handler,
        reload_config,
    ),
    components(schemas(
        RoutingResult,
        HealthReport,
        LimiterStats,
        HistoryEntry,
        ApiError,
        SimpleHealthResponse,
        ProbeResponse,
        CircuitBreakersResponse,
        RoutesResponse,
        ConfigReloadResponse,
    ))
)]
pub struct ApiDoc;

/// Create the full router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Command submission
        .route("/commands/:command_type", post(route_command))
        // Basic health and Kubernetes probes
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        // Detailed monitoring
        .route("/monitoring", get(monitoring_handler))
        .route("/monitoring/circuit-breakers", get(circuit_breakers_handler))
        .route("/monitoring/limiter", get(limiter_handler))
        .route("/monitoring/history", get(history_handler))
        // Configuration
        .route("/routes", get(routes_handler))
        .route("/config/reload", post(reload_config))
        // Prometheus metrics and API docs
        .route("/metrics", get(metrics_handler))
        .route("/api-doc/openapi.json", get(openapi_handler))
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

/// Router errors rendered as HTTP responses
pub struct ApiFailure(RouterError);

impl From<RouterError> for ApiFailure {
    fn from(err: RouterError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let reason = self.0.reason();
        let (status, error) = match (&self.0, reason) {
            (_, Some(reason)) => (StatusCode::NOT_FOUND, reason.as_str()),
            (RouterError::ShuttingDown, _) => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
            (RouterError::Config(_), _) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = ApiError {
            error: error.to_string(),
            message: self.0.to_string(),
            reason,
        };
        (status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    let body = ApiError {
        error: "bad_request".to_string(),
        message: message.into(),
        reason: None,
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

// ============================================================================
// Commands
// ============================================================================

/// Translate request headers into routing options
pub fn route_options(headers: &HeaderMap) -> Result<RouteOptions, String> {
    let mut options = RouteOptions::default();

    for (name, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        let name = name.as_str();

        if name == HEADER_ROUTING_STRATEGY {
            options.routing_strategy = Some(value.to_string());
        } else if name == HEADER_DEADLINE_MS {
            let ms: u64 = value
                .parse()
                .map_err(|_| format!("{HEADER_DEADLINE_MS} must be a whole number of milliseconds"))?;
            options.deadline = Some(Duration::from_millis(ms));
        } else if let Some(forwarded) = name.strip_prefix(FORWARD_HEADER_PREFIX) {
            if !forwarded.is_empty() {
                options.headers.insert(forwarded.to_string(), value.to_string());
            }
        }
    }
    Ok(options)
}

/// Route a command; the body is the JSON payload
#[utoipa::path(
    post,
    path = "/commands/{command_type}",
    tag = "commands",
    params(("command_type" = String, Path, description = "Command type to route")),
    request_body(content = serde_json::Value, description = "JSON command payload", content_type = "application/json"),
    responses(
        (status = 200, description = "Routing envelope (check success/fallback)", body = RoutingResult),
        (status = 400, description = "Malformed payload or headers", body = ApiError),
        (status = 404, description = "Command type not routable", body = ApiError),
        (status = 503, description = "Router shutting down", body = ApiError)
    )
)]
async fn route_command(
    State(state): State<AppState>,
    Path(command_type): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload: Value = if body.is_empty() {
        Value::Object(Default::default())
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(e) => return bad_request(format!("Invalid JSON payload: {e}")),
        }
    };

    let options = match route_options(&headers) {
        Ok(options) => options,
        Err(message) => return bad_request(message),
    };

    debug!(command_type = %command_type, "Command received");
    match state.router.route_command(&command_type, payload, options).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => ApiFailure(e).into_response(),
    }
}

// ============================================================================
// Health Endpoints
// ============================================================================

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, description = "Service health", body = SimpleHealthResponse))
)]
async fn health_handler(State(state): State<AppState>) -> Json<SimpleHealthResponse> {
    let report = state.monitor.sample();

    let status = match report.status {
        HealthStatus::Healthy | HealthStatus::Warning => "UP",
        HealthStatus::Degraded => "DEGRADED",
    };

    Json(SimpleHealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Kubernetes liveness probe - returns 200 if the process is running
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses((status = 200, description = "Process is alive", body = ProbeResponse))
)]
async fn liveness_probe() -> Json<ProbeResponse> {
    Json(ProbeResponse { status: "LIVE".to_string() })
}

/// Kubernetes readiness probe - returns 200 if ready to accept commands
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Ready", body = ProbeResponse),
        (status = 503, description = "Not ready", body = ProbeResponse)
    )
)]
async fn readiness_probe(State(state): State<AppState>) -> (StatusCode, Json<ProbeResponse>) {
    let report = state.monitor.sample();
    let ready = state.router.is_running() && report.status != HealthStatus::Degraded;

    if ready {
        (StatusCode::OK, Json(ProbeResponse { status: "READY".to_string() }))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(ProbeResponse { status: "NOT_READY".to_string() }))
    }
}

// ============================================================================
// Monitoring Endpoints
// ============================================================================

/// Detailed monitoring information
#[utoipa::path(
    get,
    path = "/monitoring",
    tag = "monitoring",
    responses((status = 200, description = "Health report and history summary", body = MonitoringResponse))
)]
async fn monitoring_handler(State(state): State<AppState>) -> Json<MonitoringResponse> {
    let health_report = state.monitor.sample();

    let status = match health_report.status {
        HealthStatus::Healthy => "HEALTHY",
        HealthStatus::Warning => "WARNING",
        HealthStatus::Degraded => "DEGRADED",
    };

    Json(MonitoringResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        health_report,
        history: state.router.history().summary(),
        in_flight: state.router.in_flight(),
    })
}

/// Circuit breaker state per endpoint
#[utoipa::path(
    get,
    path = "/monitoring/circuit-breakers",
    tag = "monitoring",
    responses((status = 200, description = "Breaker statistics", body = CircuitBreakersResponse))
)]
async fn circuit_breakers_handler(State(state): State<AppState>) -> Json<CircuitBreakersResponse> {
    let breakers = state.router.breakers().stats();

    let count = |s: CircuitState| breakers.iter().filter(|b| b.state == s).count();
    let total_open = count(CircuitState::Open);
    let total_half_open = count(CircuitState::HalfOpen);
    let total_closed = count(CircuitState::Closed);

    Json(CircuitBreakersResponse {
        breakers,
        total_open,
        total_half_open,
        total_closed,
    })
}

/// Concurrency limiter statistics
#[utoipa::path(
    get,
    path = "/monitoring/limiter",
    tag = "monitoring",
    responses((status = 200, description = "Limiter statistics", body = LimiterStats))
)]
async fn limiter_handler(State(state): State<AppState>) -> Json<LimiterStats> {
    Json(state.router.limiter().stats())
}

/// Recent routing outcomes, newest first
#[utoipa::path(
    get,
    path = "/monitoring/history",
    tag = "monitoring",
    params(HistoryQuery),
    responses((status = 200, description = "Recent outcomes", body = Vec<HistoryEntry>))
)]
async fn history_handler(State(state): State<AppState>, Query(query): Query<HistoryQuery>) -> Json<Vec<HistoryEntry>> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Json(state.router.history().recent(limit))
}

// ============================================================================
// Configuration Endpoints
// ============================================================================

/// Current routing table
#[utoipa::path(
    get,
    path = "/routes",
    tag = "config",
    responses((status = 200, description = "Resolved routes", body = RoutesResponse))
)]
async fn routes_handler(State(state): State<AppState>) -> Json<RoutesResponse> {
    let table = state.router.table();

    Json(RoutesResponse {
        environment: table.environment().to_string(),
        built_at: table.built_at(),
        routes: table.endpoints().into_iter().cloned().collect(),
        invalid: table
            .invalid_routes()
            .map(|(command_type, reason)| (command_type.to_string(), reason.to_string()))
            .collect(),
    })
}

/// Re-read the configuration source and swap the routing table
#[utoipa::path(
    post,
    path = "/config/reload",
    tag = "config",
    responses(
        (status = 200, description = "Reloaded", body = ConfigReloadResponse),
        (status = 500, description = "Configuration could not be loaded", body = ApiError),
        (status = 503, description = "Router shutting down", body = ApiError)
    )
)]
async fn reload_config(State(state): State<AppState>) -> Result<Json<ConfigReloadResponse>, ApiFailure> {
    match state.router.clone().reload_blocking().await {
        Ok(routes) => {
            info!(routes, "Configuration reloaded via API");
            Ok(Json(ConfigReloadResponse { success: true, routes }))
        }
        Err(e) => {
            error!(error = %e, "Configuration reload failed");
            Err(e.into())
        }
    }
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn openapi_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
