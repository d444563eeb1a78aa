//! FallbackResponder - synthetic envelopes for calls that were not (or could
//! not be) completed downstream. Every envelope has `fallback: true` and an
//! advisory `retryAfterMs` hint in its details.

use std::time::Duration;

use cr_common::{ErrorType, RoutingErrorDetail, RoutingResult};
use serde_json::json;

use crate::limiter::LimiterError;

/// Hint given when no better estimate exists
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);
const RATE_LIMIT_RETRY_AFTER: Duration = Duration::from_secs(60);

pub struct FallbackResponder;

impl FallbackResponder {
    /// Circuit open for the endpoint: 503 `circuit_breaker_open`
    pub fn circuit_open(command_type: &str, request_id: &str, elapsed_ms: u64, retry_after: Duration) -> RoutingResult {
        Self::build(
            command_type,
            request_id,
            elapsed_ms,
            503,
            "CIRCUIT_OPEN",
            format!("Service for '{command_type}' is temporarily unavailable (circuit open)"),
            ErrorType::CircuitBreakerOpen,
            retry_after,
            None,
        )
    }

    /// Admission refused by the limiter.
    /// Queue full and rate limiting map to 429; queue timeout and shutdown to 503.
    pub fn capacity(command_type: &str, request_id: &str, elapsed_ms: u64, err: &LimiterError) -> RoutingResult {
        let (status, code, error_type, retry_after) = match err {
            LimiterError::QueueFull { .. } => (429, "QUEUE_FULL", ErrorType::RateLimitExceeded, DEFAULT_RETRY_AFTER),
            LimiterError::RateLimited { .. } => (429, "RATE_LIMITED", ErrorType::RateLimitExceeded, RATE_LIMIT_RETRY_AFTER),
            LimiterError::QueueTimeout { .. } => (503, "QUEUE_TIMEOUT", ErrorType::ServiceUnavailable, DEFAULT_RETRY_AFTER),
            LimiterError::ShuttingDown => (503, "SHUTTING_DOWN", ErrorType::ServiceUnavailable, DEFAULT_RETRY_AFTER),
        };
        Self::build(
            command_type,
            request_id,
            elapsed_ms,
            status,
            code,
            err.to_string(),
            error_type,
            retry_after,
            Some(err.reason()),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        command_type: &str,
        request_id: &str,
        elapsed_ms: u64,
        status: u16,
        code: &str,
        message: String,
        error_type: ErrorType,
        retry_after: Duration,
        reason: Option<&str>,
    ) -> RoutingResult {
        let mut details = json!({
            "retryAfterMs": retry_after.as_millis() as u64,
            "retryAfter": format!("{}s", retry_after.as_secs().max(1)),
        });
        if let Some(reason) = reason {
            details["reason"] = json!(reason);
        }

        let error = RoutingErrorDetail {
            code: code.to_string(),
            message,
            error_type,
            details: Some(details),
        };
        RoutingResult::failed(command_type, request_id, status, elapsed_ms, error).into_fallback()
    }
}
