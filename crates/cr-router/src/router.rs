//! CommandRouter - Central orchestrator for command routing
//!
//! Per call: resolve route -> admit through the limiter -> execute through
//! the endpoint's circuit breaker (which wraps the retrying executor) ->
//! release the slot -> transform -> record and publish the outcome.
//!
//! Configuration errors are returned as [`RouterError`]; every other outcome
//! is a [`RoutingResult`] envelope.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cr_common::{new_request_id, EndpointConfig, EndpointHealth, ErrorType, RoutingErrorDetail, RoutingResult};
use cr_config::{ConfigSource, RouterConfig, RouterSettings};
use futures::future::join_all;
use metrics::{counter, histogram};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{BreakerError, CircuitBreakerConfig};
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::context::RequestContext;
use crate::error::RouterError;
use crate::events::{EventBus, RouterEvent};
use crate::executor::{RequestExecutor, RetryPolicy};
use crate::fallback::FallbackResponder;
use crate::history::RoutingHistory;
use crate::limiter::{ConcurrencyLimiter, LimiterConfig};
use crate::table::RoutingTable;
use crate::transform::ResponseTransformer;
use crate::Result;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Caller-supplied options for a single call
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    /// Extra headers forwarded downstream
    pub headers: BTreeMap<String, String>,
    /// Advisory strategy label, recorded for observability
    pub routing_strategy: Option<String>,
    /// Bound on queue wait plus all HTTP attempts
    pub deadline: Option<Duration>,
}

impl RouteOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Counts a call as in flight for its whole lifetime
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct CommandRouter {
    source: Arc<dyn ConfigSource>,
    settings: RouterSettings,

    /// Swapped whole on reload; calls keep the snapshot they started with
    table: RwLock<Arc<RoutingTable>>,

    limiter: ConcurrencyLimiter,
    breakers: CircuitBreakerRegistry,
    executor: RequestExecutor,
    transformer: ResponseTransformer,
    history: RoutingHistory,
    events: EventBus,

    running: AtomicBool,
    in_flight: AtomicUsize,
}

impl CommandRouter {
    /// Load the configuration from `source` and build every component
    pub fn from_source(source: Arc<dyn ConfigSource>, events: EventBus) -> Result<Self> {
        let config = source.load()?;
        Self::new(config, source, events)
    }

    pub fn new(config: RouterConfig, source: Arc<dyn ConfigSource>, events: EventBus) -> Result<Self> {
        let settings = config.router.clone();
        let executor = RequestExecutor::new(RetryPolicy::from_settings(&settings), events.clone())?;
        Ok(Self::with_executor(config, source, events, executor))
    }

    pub fn with_executor(
        config: RouterConfig,
        source: Arc<dyn ConfigSource>,
        events: EventBus,
        executor: RequestExecutor,
    ) -> Self {
        let settings = config.router.clone();
        let table = RoutingTable::from_config(&config, &events);

        info!(
            environment = %table.environment(),
            routes = table.len(),
            max_concurrent = settings.max_concurrent_requests,
            queue_size = settings.queue_size,
            source = %source.describe(),
            "Command router initialized"
        );

        Self {
            limiter: ConcurrencyLimiter::new(LimiterConfig::from_settings(&settings), events.clone()),
            breakers: CircuitBreakerRegistry::new(CircuitBreakerConfig::from_settings(&settings), events.clone()),
            history: RoutingHistory::new(settings.history_capacity),
            transformer: ResponseTransformer::standard(),
            table: RwLock::new(Arc::new(table)),
            source,
            settings,
            executor,
            events,
            running: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Replace the response transformer (custom normalizers/validation rules)
    pub fn with_transformer(mut self, transformer: ResponseTransformer) -> Self {
        self.transformer = transformer;
        self
    }

    /// Route one command to its endpoint
    pub async fn route_command(&self, command_type: &str, payload: Value, options: RouteOptions) -> Result<RoutingResult> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(RouterError::ShuttingDown);
        }

        let table = self.table();
        let endpoint = match table.check(command_type) {
            Ok(endpoint) => endpoint.clone(),
            Err(reason) => {
                counter!("cr_commands_total", "command_type" => command_type.to_string(), "outcome" => reason.as_str())
                    .increment(1);
                let err = RouterError::unsupported(command_type, reason, table.invalid_reason(command_type));
                self.events.publish(RouterEvent::CommandError {
                    request_id: new_request_id(),
                    command_type: command_type.to_string(),
                    reason: reason.as_str().to_string(),
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        let _in_flight = InFlight::enter(&self.in_flight);
        let ctx = RequestContext::new(&endpoint, table.environment(), payload, &options.headers);

        debug!(
            request_id = %ctx.request_id,
            command_type = %command_type,
            strategy = ?options.routing_strategy,
            deadline_ms = ?options.deadline.map(|d| d.as_millis() as u64),
            "Routing command"
        );
        self.events.publish(RouterEvent::CommandRouting {
            request_id: ctx.request_id.clone(),
            command_type: ctx.command_type.clone(),
            priority: endpoint.priority,
            environment: ctx.environment.clone(),
        });

        let result = match options.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, self.dispatch(&ctx, &endpoint)).await {
                Ok(result) => result,
                Err(_) => deadline_exceeded(&ctx, deadline),
            },
            None => self.dispatch(&ctx, &endpoint).await,
        };

        self.finish(&ctx, &endpoint, &result);
        Ok(result)
    }

    /// Limiter admission comes first and the breaker decides inside the slot, so a
    /// call to an open circuit can still queue or get a capacity fallback.
    async fn dispatch(&self, ctx: &RequestContext, endpoint: &EndpointConfig) -> RoutingResult {
        let breaker = self.breakers.get_or_create(&endpoint.command_type);
        let call = breaker.execute(self.executor.execute(ctx, endpoint));

        let outcome = self
            .limiter
            .execute(&ctx.request_id, self.limiter.config().queue_timeout, move || call)
            .await;

        match outcome {
            Err(admission) => FallbackResponder::capacity(&ctx.command_type, &ctx.request_id, ctx.elapsed_ms(), &admission),
            Ok(Err(BreakerError::Open { retry_after, .. })) => {
                FallbackResponder::circuit_open(&ctx.command_type, &ctx.request_id, ctx.elapsed_ms(), retry_after)
            }
            Ok(Err(BreakerError::Inner(err))) => self.transformer.transform_failure(err, ctx),
            Ok(Ok(execution)) => self.transformer.transform(execution.response, ctx, execution.attempts),
        }
    }

    fn finish(&self, ctx: &RequestContext, endpoint: &EndpointConfig, result: &RoutingResult) {
        let outcome = if result.fallback {
            "fallback"
        } else if result.success {
            "success"
        } else {
            "error"
        };
        counter!("cr_commands_total", "command_type" => ctx.command_type.clone(), "outcome" => outcome).increment(1);
        histogram!("cr_command_duration_seconds", "command_type" => ctx.command_type.clone())
            .record(result.response_time_ms as f64 / 1000.0);

        self.history.record(result);

        if result.fallback {
            let error_type = result.error_type().unwrap_or(ErrorType::ServiceUnavailable);
            counter!("cr_fallbacks_total", "type" => error_type.as_str()).increment(1);
            self.events.publish(RouterEvent::CommandFallback {
                request_id: ctx.request_id.clone(),
                command_type: ctx.command_type.clone(),
                error_type,
                http_status: result.http_status,
            });
        }

        self.events.publish(RouterEvent::CommandRouted {
            request_id: ctx.request_id.clone(),
            command_type: ctx.command_type.clone(),
            http_status: result.http_status,
            success: result.success,
            response_time_ms: result.response_time_ms,
            priority: endpoint.priority,
            environment: ctx.environment.clone(),
        });
    }

    /// Probe one endpoint directly, bypassing limiter, breaker and retries
    pub async fn health_check(&self, command_type: &str) -> Result<EndpointHealth> {
        let table = self.table();
        let endpoint = match table.resolve(command_type) {
            Some(endpoint) => endpoint.clone(),
            None => {
                let reason = table
                    .check(command_type)
                    .err()
                    .unwrap_or(cr_common::UnsupportedReason::NotConfigured);
                return Err(RouterError::unsupported(command_type, reason, table.invalid_reason(command_type)));
            }
        };
        Ok(self.executor.probe(&endpoint, self.settings.health_check_timeout()).await)
    }

    /// Probe every enabled endpoint concurrently
    pub async fn health_check_all(&self) -> Vec<EndpointHealth> {
        let table = self.table();
        let timeout = self.settings.health_check_timeout();
        let probes = table
            .endpoints()
            .into_iter()
            .filter(|e| e.enabled)
            .map(|endpoint| self.executor.probe(endpoint, timeout));
        join_all(probes).await
    }

    /// [`reload`](Self::reload) on the blocking thread pool, for callers on the async runtime
    pub async fn reload_blocking(self: Arc<Self>) -> Result<usize> {
        tokio::task::spawn_blocking(move || self.reload())
            .await
            .map_err(|e| RouterError::Task(e.to_string()))?
    }

    /// Re-read the configuration source and swap the routing table.
    /// In-flight calls finish against the table they started with.
    pub fn reload(&self) -> Result<usize> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(RouterError::ShuttingDown);
        }

        let config = self.source.load()?;
        if config.router != self.settings {
            warn!("Global [router] settings changed; they take effect after a restart");
        }

        let table = Arc::new(RoutingTable::from_config(&config, &self.events));
        let routes = table.len();
        self.breakers.retain(&table.command_types());
        *self.table.write() = table;

        info!(routes, source = %self.source.describe(), "Routing table reloaded");
        Ok(routes)
    }

    /// Refuse new calls, fail queued ones, then wait (bounded by the shutdown
    /// grace period) for in-flight calls to finish
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Command router shutting down...");

        let rejected = self.limiter.shutdown();
        let grace = self.settings.shutdown_grace();
        let started = Instant::now();

        while self.in_flight() > 0 && started.elapsed() < grace {
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        let remaining = self.in_flight();
        if remaining > 0 {
            warn!(remaining, "Shutdown grace period elapsed with calls still in flight");
        }
        info!(rejected_queued = rejected, "Command router shutdown complete");
    }

    /// Current routing table snapshot
    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.read().clone()
    }

    /// Resolved endpoints, sorted by command type
    pub fn routes(&self) -> Vec<EndpointConfig> {
        self.table().endpoints().into_iter().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    pub fn history(&self) -> &RoutingHistory {
        &self.history
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

fn deadline_exceeded(ctx: &RequestContext, deadline: Duration) -> RoutingResult {
    let error = RoutingErrorDetail {
        code: "DEADLINE_EXCEEDED".to_string(),
        message: format!("Command did not complete within {}ms", deadline.as_millis()),
        error_type: ErrorType::DeadlineExceeded,
        details: Some(json!({ "deadlineMs": deadline.as_millis() as u64 })),
    };
    RoutingResult::failed(&ctx.command_type, &ctx.request_id, 504, ctx.elapsed_ms(), error)
}
