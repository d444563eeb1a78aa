//! Request and response bodies for the operator API

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use cr_common::{CircuitBreakerStats, EndpointConfig, HealthReport, UnsupportedReason};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Simple health response for basic health check
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SimpleHealthResponse {
    /// Health status: UP, DEGRADED
    pub status: String,
    pub version: String,
}

/// Kubernetes probe response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ProbeResponse {
    /// Probe status: LIVE, READY, NOT_READY
    pub status: String,
}

/// Detailed monitoring response
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringResponse {
    /// Overall status: HEALTHY, WARNING, DEGRADED
    pub status: String,
    pub version: String,
    pub health_report: HealthReport,
    /// Per command type totals over the retained history
    #[schema(value_type = Object)]
    pub history: BTreeMap<String, cr_router::CommandSummary>,
    pub in_flight: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakersResponse {
    pub breakers: Vec<CircuitBreakerStats>,
    pub total_open: usize,
    pub total_half_open: usize,
    pub total_closed: usize,
}

#[derive(Debug, Deserialize, Default, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistoryQuery {
    /// Maximum entries to return, newest first (default 50)
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutesResponse {
    pub environment: String,
    pub built_at: DateTime<Utc>,
    pub routes: Vec<EndpointConfig>,
    /// Command types rejected at build time, with the reason
    pub invalid: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigReloadResponse {
    pub success: bool,
    pub routes: usize,
}

/// Standard API error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    pub error: String,
    pub message: String,
    /// Set when a command type cannot be routed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<UnsupportedReason>,
}
