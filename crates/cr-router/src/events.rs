//! Router lifecycle events
//!
//! Components receive an [`EventBus`] handle at construction and publish
//! state changes on it. Interested parties (log shippers, the health monitor,
//! tests) call [`EventBus::subscribe`]. Every published event is also logged.

use cr_common::{CircuitState, EndpointHealth, ErrorType, HealthStatus};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum RouterEvent {
    RouteRegistered {
        command_type: String,
        url: String,
        priority: u8,
        enabled: bool,
    },
    TableBuilt {
        environment: String,
        route_count: usize,
        invalid_count: usize,
    },
    CommandRouting {
        request_id: String,
        command_type: String,
        priority: u8,
        environment: String,
    },
    CommandRouted {
        request_id: String,
        command_type: String,
        http_status: u16,
        success: bool,
        response_time_ms: u64,
        priority: u8,
        environment: String,
    },
    CommandError {
        request_id: String,
        command_type: String,
        reason: String,
        message: String,
    },
    CommandFallback {
        request_id: String,
        command_type: String,
        error_type: ErrorType,
        http_status: u16,
    },
    CircuitStateChanged {
        name: String,
        from: CircuitState,
        to: CircuitState,
        failure_rate_percent: f64,
    },
    RequestQueued {
        request_id: String,
        position: usize,
    },
    RequestDequeued {
        request_id: String,
        waited_ms: u64,
    },
    RequestTimeout {
        request_id: String,
        waited_ms: u64,
    },
    RequestRejected {
        request_id: String,
        reason: String,
    },
    RequestStarted {
        request_id: String,
        command_type: String,
        attempt: u32,
        url: String,
    },
    RequestSucceeded {
        request_id: String,
        command_type: String,
        http_status: u16,
        attempts: u32,
        latency_ms: u64,
    },
    RequestFailed {
        request_id: String,
        command_type: String,
        attempt: u32,
        latency_ms: u64,
        error: String,
        will_retry: bool,
    },
    HealthChecked(EndpointHealth),
    HealthReported {
        status: HealthStatus,
        issues: Vec<String>,
    },
}

impl RouterEvent {
    /// Canonical event name (`command:routed`, `circuit:open`, ...)
    pub fn name(&self) -> &'static str {
        match self {
            RouterEvent::RouteRegistered { .. } => "route:registered",
            RouterEvent::TableBuilt { .. } => "table:built",
            RouterEvent::CommandRouting { .. } => "command:routing",
            RouterEvent::CommandRouted { .. } => "command:routed",
            RouterEvent::CommandError { .. } => "command:error",
            RouterEvent::CommandFallback { .. } => "command:fallback",
            RouterEvent::CircuitStateChanged { to, .. } => match to {
                CircuitState::Open => "circuit:open",
                CircuitState::HalfOpen => "circuit:half-open",
                CircuitState::Closed => "circuit:close",
            },
            RouterEvent::RequestQueued { .. } => "request:queued",
            RouterEvent::RequestDequeued { .. } => "request:dequeued",
            RouterEvent::RequestTimeout { .. } => "request:timeout",
            RouterEvent::RequestRejected { .. } => "request:rejected",
            RouterEvent::RequestStarted { .. } => "request:start",
            RouterEvent::RequestSucceeded { .. } => "request:success",
            RouterEvent::RequestFailed { .. } => "request:failure",
            RouterEvent::HealthChecked(_) => "health:check",
            RouterEvent::HealthReported { .. } => "health:report",
        }
    }
}

/// Cloneable publish/subscribe handle
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RouterEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Log and broadcast. Having no subscribers is not an error.
    pub fn publish(&self, event: RouterEvent) {
        log_event(&event);
        let _ = self.tx.send(event);
    }
}

fn log_event(event: &RouterEvent) {
    let name = event.name();
    match event {
        RouterEvent::RouteRegistered { command_type, url, priority, enabled } => {
            debug!(event = name, command_type = %command_type, url = %url, priority, enabled, "Route registered");
        }
        RouterEvent::TableBuilt { environment, route_count, invalid_count } => {
            info!(event = name, environment = %environment, route_count, invalid_count, "Routing table built");
        }
        RouterEvent::CommandRouting { request_id, command_type, .. } => {
            debug!(event = name, request_id = %request_id, command_type = %command_type, "Routing command");
        }
        RouterEvent::CommandRouted { request_id, command_type, http_status, success, response_time_ms, .. } => {
            debug!(
                event = name,
                request_id = %request_id,
                command_type = %command_type,
                http_status,
                success,
                response_time_ms,
                "Command routed"
            );
        }
        RouterEvent::CommandError { request_id, command_type, reason, message } => {
            warn!(event = name, request_id = %request_id, command_type = %command_type, reason = %reason, "{}", message);
        }
        RouterEvent::CommandFallback { request_id, command_type, error_type, http_status } => {
            warn!(
                event = name,
                request_id = %request_id,
                command_type = %command_type,
                error_type = %error_type,
                http_status,
                "Returning fallback response"
            );
        }
        RouterEvent::CircuitStateChanged { name: breaker, from, to, failure_rate_percent } => match to {
            CircuitState::Open => warn!(
                event = name,
                breaker = %breaker,
                from = %from,
                failure_rate_percent,
                "Circuit opened"
            ),
            _ => info!(event = name, breaker = %breaker, from = %from, to = %to, "Circuit state changed"),
        },
        RouterEvent::RequestQueued { request_id, position } => {
            debug!(event = name, request_id = %request_id, position, "Request queued");
        }
        RouterEvent::RequestDequeued { request_id, waited_ms } => {
            debug!(event = name, request_id = %request_id, waited_ms, "Request dequeued");
        }
        RouterEvent::RequestTimeout { request_id, waited_ms } => {
            warn!(event = name, request_id = %request_id, waited_ms, "Queued request timed out");
        }
        RouterEvent::RequestRejected { request_id, reason } => {
            warn!(event = name, request_id = %request_id, reason = %reason, "Request rejected");
        }
        RouterEvent::RequestStarted { request_id, attempt, url, .. } => {
            debug!(event = name, request_id = %request_id, attempt, url = %url, "HTTP attempt started");
        }
        RouterEvent::RequestSucceeded { request_id, http_status, attempts, latency_ms, .. } => {
            debug!(event = name, request_id = %request_id, http_status, attempts, latency_ms, "HTTP request completed");
        }
        RouterEvent::RequestFailed { request_id, attempt, latency_ms, error, will_retry, .. } => {
            warn!(
                event = name,
                request_id = %request_id,
                attempt,
                latency_ms,
                will_retry,
                error = %error,
                "HTTP attempt failed"
            );
        }
        RouterEvent::HealthChecked(health) => {
            if health.healthy {
                debug!(event = name, command_type = %health.command_type, response_time_ms = health.response_time_ms, "Endpoint healthy");
            } else {
                warn!(
                    event = name,
                    command_type = %health.command_type,
                    error = ?health.error,
                    http_status = ?health.http_status,
                    "Endpoint unhealthy"
                );
            }
        }
        RouterEvent::HealthReported { status, issues } => {
            if issues.is_empty() {
                debug!(event = name, status = ?status, "Health report: OK");
            } else {
                warn!(event = name, status = ?status, issues = ?issues, "Health report");
            }
        }
    }
}
