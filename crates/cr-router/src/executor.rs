//! RequestExecutor - HTTP delivery with per-attempt timeout and retry
//!
//! Retry classification:
//! - 5xx: retried
//! - connect / DNS failures: retried (the request never reached the server)
//! - timeouts and other transport failures: retried for idempotent methods only
//! - 4xx: never retried, returned as a normal response
//!
//! Backoff is exponential with up to 20% jitter, capped at `max_delay`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use cr_common::{EndpointConfig, EndpointHealth, ExecutorStats, HttpMethod};
use cr_config::RouterSettings;
use metrics::counter;
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::context::{RequestContext, HEADER_COMMAND_TYPE, HEADER_REQUEST_ID};
use crate::events::{EventBus, RouterEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw downstream response, body decoded but not yet normalized
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    /// Header names are lower-case
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON when the content type says so, otherwise the text as a JSON string.
    /// `Null` for an empty body.
    pub body: Value,
    pub size_bytes: u64,
}

impl HttpResponse {
    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    /// Downstream kept answering 5xx until retries ran out
    #[error("Downstream returned HTTP {} after {attempts} attempt(s)", .response.status)]
    ServerError { response: HttpResponse, attempts: u32 },

    #[error("Network error after {attempts} attempt(s): {message}")]
    Network { message: String, attempts: u32 },

    #[error("Request timed out after {timeout_ms}ms ({attempts} attempt(s))")]
    Timeout { timeout_ms: u64, attempts: u32 },

    #[error("Request could not be built: {0}")]
    InvalidRequest(String),
}

impl ExecutorError {
    pub fn attempts(&self) -> u32 {
        match self {
            ExecutorError::ServerError { attempts, .. }
            | ExecutorError::Network { attempts, .. }
            | ExecutorError::Timeout { attempts, .. } => *attempts,
            ExecutorError::InvalidRequest(_) => 1,
        }
    }
}

/// Successful delivery: any status below 500
#[derive(Debug, Clone)]
pub struct Execution {
    pub response: HttpResponse,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra fraction added to each delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RouterSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            max_delay: Duration::from_millis(settings.retry_max_delay_ms),
            ..Default::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return backoff;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(0.0..self.jitter);
        backoff.mul_f64(factor)
    }
}

enum AttemptError {
    /// Never reached the server
    Connect(String),
    Transport(String),
    Timeout,
    Build(String),
}

enum Failure {
    Status(HttpResponse),
    Network(String),
    Timeout,
}

#[derive(Default)]
struct Counters {
    total_requests: AtomicU64,
    total_attempts: AtomicU64,
    total_retries: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_latency_ms: AtomicU64,
}

pub struct RequestExecutor {
    client: reqwest::Client,
    policy: RetryPolicy,
    events: EventBus,
    counters: Counters,
}

impl RequestExecutor {
    pub fn new(policy: RetryPolicy, events: EventBus) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ExecutorError::InvalidRequest(e.to_string()))?;
        Ok(Self::with_client(client, policy, events))
    }

    pub fn with_client(client: reqwest::Client, policy: RetryPolicy, events: EventBus) -> Self {
        Self {
            client,
            policy,
            events,
            counters: Counters::default(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deliver the context's payload to `endpoint`, retrying transient failures
    /// up to `endpoint.max_retries` times
    pub async fn execute(&self, ctx: &RequestContext, endpoint: &EndpointConfig) -> Result<Execution, ExecutorError> {
        let max_attempts = endpoint.max_retries + 1;
        let started = Instant::now();
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.counters.total_attempts.fetch_add(1, Ordering::Relaxed);
            if attempt > 1 {
                self.counters.total_retries.fetch_add(1, Ordering::Relaxed);
            }
            counter!("cr_http_attempts_total", "command_type" => endpoint.command_type.clone()).increment(1);
            self.events.publish(RouterEvent::RequestStarted {
                request_id: ctx.request_id.clone(),
                command_type: endpoint.command_type.clone(),
                attempt,
                url: endpoint.url.clone(),
            });

            let attempt_started = Instant::now();
            let result = self.attempt(ctx, endpoint).await;
            let latency_ms = attempt_started.elapsed().as_millis() as u64;

            let (failure, retryable) = match result {
                Ok(response) if !response.is_server_error() => {
                    self.counters.successes.fetch_add(1, Ordering::Relaxed);
                    self.record_latency(started);
                    self.events.publish(RouterEvent::RequestSucceeded {
                        request_id: ctx.request_id.clone(),
                        command_type: endpoint.command_type.clone(),
                        http_status: response.status,
                        attempts: attempt,
                        latency_ms,
                    });
                    return Ok(Execution { response, attempts: attempt });
                }
                Ok(response) => (Failure::Status(response), true),
                Err(AttemptError::Connect(message)) => (Failure::Network(message), true),
                Err(AttemptError::Transport(message)) => (Failure::Network(message), endpoint.method.is_idempotent()),
                Err(AttemptError::Timeout) => (Failure::Timeout, endpoint.method.is_idempotent()),
                Err(AttemptError::Build(message)) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(ExecutorError::InvalidRequest(message));
                }
            };

            let will_retry = retryable && attempt < max_attempts;
            self.events.publish(RouterEvent::RequestFailed {
                request_id: ctx.request_id.clone(),
                command_type: endpoint.command_type.clone(),
                attempt,
                latency_ms,
                error: failure.describe(),
                will_retry,
            });

            if !will_retry {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.record_latency(started);
                return Err(match failure {
                    Failure::Status(response) => ExecutorError::ServerError { response, attempts: attempt },
                    Failure::Network(message) => ExecutorError::Network { message, attempts: attempt },
                    Failure::Timeout => ExecutorError::Timeout {
                        timeout_ms: endpoint.timeout_ms,
                        attempts: attempt,
                    },
                });
            }

            let delay = self.policy.delay(attempt);
            debug!(
                request_id = %ctx.request_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Backing off before retry"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&self, ctx: &RequestContext, endpoint: &EndpointConfig) -> Result<HttpResponse, AttemptError> {
        let mut request = self
            .client
            .request(reqwest_method(endpoint.method), &endpoint.url)
            .header(CONTENT_TYPE, "application/json");
        for (name, value) in &ctx.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if endpoint.method.carries_body() {
            request = request.json(&ctx.payload);
        }

        match tokio::time::timeout(endpoint.timeout(), send_and_read(request)).await {
            Ok(result) => result,
            Err(_) => Err(AttemptError::Timeout),
        }
    }

    /// Lightweight GET against the endpoint's health URL (or main URL).
    /// Bypasses breaker, limiter and retries. Any status below 500 is healthy.
    pub async fn probe(&self, endpoint: &EndpointConfig, timeout: Duration) -> EndpointHealth {
        let url = endpoint.probe_url().to_string();
        let started = Instant::now();
        let request = self
            .client
            .get(&url)
            .header(HEADER_REQUEST_ID, cr_common::new_request_id())
            .header(HEADER_COMMAND_TYPE, endpoint.command_type.as_str());

        let outcome = tokio::time::timeout(timeout, send_and_read(request)).await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        let (healthy, http_status, error) = match outcome {
            Ok(Ok(response)) if !response.is_server_error() => (true, Some(response.status), None),
            Ok(Ok(response)) => (
                false,
                Some(response.status),
                Some(format!("HTTP {} {}", response.status, response.status_text)),
            ),
            Ok(Err(AttemptError::Connect(m) | AttemptError::Transport(m) | AttemptError::Build(m))) => (false, None, Some(m)),
            Ok(Err(AttemptError::Timeout)) | Err(_) => {
                (false, None, Some(format!("Health check timed out after {}ms", timeout.as_millis())))
            }
        };

        let health = EndpointHealth {
            command_type: endpoint.command_type.clone(),
            healthy,
            url,
            http_status,
            response_time_ms,
            error,
            checked_at: Utc::now(),
        };
        self.events.publish(RouterEvent::HealthChecked(health.clone()));
        health
    }

    fn record_latency(&self, started: Instant) {
        self.counters
            .total_latency_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ExecutorStats {
        let successes = self.counters.successes.load(Ordering::Relaxed);
        let failures = self.counters.failures.load(Ordering::Relaxed);
        let completed = successes + failures;
        let avg_latency_ms = if completed == 0 {
            0.0
        } else {
            self.counters.total_latency_ms.load(Ordering::Relaxed) as f64 / completed as f64
        };

        ExecutorStats {
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            total_attempts: self.counters.total_attempts.load(Ordering::Relaxed),
            total_retries: self.counters.total_retries.load(Ordering::Relaxed),
            successes,
            failures,
            avg_latency_ms,
        }
    }
}

impl Failure {
    fn describe(&self) -> String {
        match self {
            Failure::Status(response) => format!("HTTP {} {}", response.status, response.status_text),
            Failure::Network(message) => message.clone(),
            Failure::Timeout => "timeout".to_string(),
        }
    }
}

async fn send_and_read(request: reqwest::RequestBuilder) -> Result<HttpResponse, AttemptError> {
    let response = request.send().await.map_err(classify)?;

    let status = response.status();
    let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    let bytes = response.bytes().await.map_err(classify)?;
    let size_bytes = bytes.len() as u64;
    let is_json = headers
        .get("content-type")
        .map(|ct| ct.contains("json"))
        .unwrap_or(false);

    let body = if bytes.is_empty() {
        Value::Null
    } else {
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if is_json {
            serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text))
        } else {
            Value::String(text)
        }
    };

    Ok(HttpResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
        headers,
        body,
        size_bytes,
    })
}

fn classify(err: reqwest::Error) -> AttemptError {
    if err.is_builder() {
        AttemptError::Build(err.to_string())
    } else if err.is_timeout() {
        AttemptError::Timeout
    } else if err.is_connect() {
        AttemptError::Connect(err.to_string())
    } else {
        AttemptError::Transport(err.to_string())
    }
}

fn reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Options => reqwest::Method::OPTIONS,
    }
}
