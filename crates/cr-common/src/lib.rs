use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// ============================================================================
// Endpoint Configuration Types
// ============================================================================

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const MIN_TIMEOUT_MS: u64 = 1_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const MAX_RETRIES_LIMIT: u32 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

/// HTTP method used to reach a downstream endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Whether repeating the request has the same effect as sending it once
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            HttpMethod::Get | HttpMethod::Head | HttpMethod::Put | HttpMethod::Delete | HttpMethod::Options
        )
    }

    /// Whether the payload is sent as a JSON body
    pub fn carries_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch | HttpMethod::Delete)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported HTTP method: {0}")]
pub struct ParseMethodError(pub String);

impl FromStr for HttpMethod {
    type Err = ParseMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(ParseMethodError(other.to_string())),
        }
    }
}

/// Fully resolved configuration for one command type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub command_type: String,
    pub url: String,
    pub method: HttpMethod,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub priority: u8,
    pub enabled: bool,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,
}

impl EndpointConfig {
    pub fn new(command_type: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
            url: url.into(),
            method: HttpMethod::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            priority: DEFAULT_PRIORITY,
            enabled: true,
            headers: BTreeMap::new(),
            health_url: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// URL used by health probes
    pub fn probe_url(&self) -> &str {
        self.health_url.as_deref().unwrap_or(&self.url)
    }
}

/// Why a command type cannot be routed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedReason {
    NotConfigured,
    Disabled,
    InvalidConfiguration,
}

impl UnsupportedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnsupportedReason::NotConfigured => "not_configured",
            UnsupportedReason::Disabled => "disabled",
            UnsupportedReason::InvalidConfiguration => "invalid_configuration",
        }
    }
}

impl fmt::Display for UnsupportedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Routing Result Envelope
// ============================================================================

/// Category of a failed routing result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Downstream answered 4xx
    ClientError,
    /// Downstream answered 5xx
    ServerError,
    /// Connection refused, reset, DNS failure
    NetworkError,
    /// A single HTTP attempt exceeded the endpoint timeout
    TimeoutError,
    /// The caller-supplied end-to-end deadline elapsed
    DeadlineExceeded,
    CircuitBreakerOpen,
    RateLimitExceeded,
    ServiceUnavailable,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::ClientError => "client_error",
            ErrorType::ServerError => "server_error",
            ErrorType::NetworkError => "network_error",
            ErrorType::TimeoutError => "timeout_error",
            ErrorType::DeadlineExceeded => "deadline_exceeded",
            ErrorType::CircuitBreakerOpen => "circuit_breaker_open",
            ErrorType::RateLimitExceeded => "rate_limit_exceeded",
            ErrorType::ServiceUnavailable => "service_unavailable",
        }
    }

    /// Categorize an HTTP status code >= 400
    pub fn from_status(status: u16) -> Self {
        if status >= 500 {
            ErrorType::ServerError
        } else {
            ErrorType::ClientError
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RoutingErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub size_bytes: u64,
}

/// Uniform envelope returned for every routed command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutingResult {
    pub success: bool,
    pub command_type: String,
    pub http_status: u16,
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: u64,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RoutingErrorDetail>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub fallback: bool,
}

impl RoutingResult {
    pub fn succeeded(
        command_type: &str,
        request_id: &str,
        http_status: u16,
        response_time_ms: u64,
        data: serde_json::Value,
        metadata: ResponseMetadata,
    ) -> Self {
        Self {
            success: true,
            command_type: command_type.to_string(),
            http_status,
            timestamp: Utc::now(),
            response_time_ms,
            request_id: request_id.to_string(),
            data: Some(data),
            metadata: Some(metadata),
            error: None,
            warnings: Vec::new(),
            fallback: false,
        }
    }

    pub fn failed(
        command_type: &str,
        request_id: &str,
        http_status: u16,
        response_time_ms: u64,
        error: RoutingErrorDetail,
    ) -> Self {
        Self {
            success: false,
            command_type: command_type.to_string(),
            http_status,
            timestamp: Utc::now(),
            response_time_ms,
            request_id: request_id.to_string(),
            data: None,
            metadata: None,
            error: Some(error),
            warnings: Vec::new(),
            fallback: false,
        }
    }

    pub fn with_metadata(mut self, metadata: ResponseMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    /// Mark as a synthetic response produced without a completed downstream call
    pub fn into_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    pub fn error_type(&self) -> Option<ErrorType> {
        self.error.as_ref().map(|e| e.error_type)
    }
}

// ============================================================================
// Circuit Breaker Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    /// Outcomes currently held in the rolling window
    pub window_calls: u32,
    pub window_failures: u32,
    pub failure_rate_percent: f64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    /// Lifetime number of closed/half-open -> open transitions
    pub times_opened: u64,
    /// Remaining open time before a trial call is allowed
    pub retry_after_ms: Option<u64>,
}

// ============================================================================
// Admission Control Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LimiterStats {
    pub active: u32,
    pub queued: u32,
    pub max_concurrent: u32,
    pub queue_size: u32,
    pub queue_enabled: bool,
    pub utilization_percent: f64,
    pub avg_processing_ms: f64,
    pub total_processed: u64,
    pub total_queued: u64,
    pub total_rejected: u64,
    pub total_timeouts: u64,
    pub peak_active: u32,
    pub peak_queued: u32,
    pub rate_limit_per_minute: Option<u32>,
    pub shutting_down: bool,
}

// ============================================================================
// Executor Types
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ExecutorStats {
    pub total_requests: u64,
    pub total_attempts: u64,
    pub total_retries: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
}

// ============================================================================
// Health & History Types
// ============================================================================

/// Overall system health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Some issues detected but operational
    Warning,
    /// Significant issues affecting operations
    Degraded,
}

/// Result of a lightweight probe against one endpoint
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndpointHealth {
    pub command_type: String,
    pub healthy: bool,
    pub url: String,
    pub http_status: Option<u16>,
    pub response_time_ms: u64,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Sampled snapshot of breaker, admission and executor state
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub environment: String,
    pub routes_total: u32,
    pub routes_enabled: u32,
    pub open_circuits: Vec<String>,
    pub half_open_circuits: Vec<String>,
    pub limiter: LimiterStats,
    pub executor: ExecutorStats,
    pub circuit_breakers: Vec<CircuitBreakerStats>,
    pub endpoints: Vec<EndpointHealth>,
    pub issues: Vec<String>,
    pub sampled_at: DateTime<Utc>,
}

/// One entry of the bounded in-memory routing history
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub request_id: String,
    pub command_type: String,
    pub success: bool,
    pub fallback: bool,
    pub http_status: u16,
    pub response_time_ms: u64,
    pub error_type: Option<ErrorType>,
    pub timestamp: DateTime<Utc>,
}

impl From<&RoutingResult> for HistoryEntry {
    fn from(result: &RoutingResult) -> Self {
        Self {
            request_id: result.request_id.clone(),
            command_type: result.command_type.clone(),
            success: result.success,
            fallback: result.fallback,
            http_status: result.http_status,
            response_time_ms: result.response_time_ms,
            error_type: result.error_type(),
            timestamp: result.timestamp,
        }
    }
}

/// Generate a unique request identifier
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
