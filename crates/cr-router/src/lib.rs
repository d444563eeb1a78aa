//! Command Router
//!
//! This crate provides resilient command routing with:
//! - CommandRouter: Central orchestrator (resolve, admit, execute, transform)
//! - RoutingTable: Command type to endpoint mapping, rebuilt on reload
//! - ConcurrencyLimiter: Bounded concurrency with a FIFO wait queue and optional rate limit
//! - CircuitBreaker: Rolling-window breaker per endpoint, tracked by CircuitBreakerRegistry
//! - RequestExecutor: HTTP delivery with per-attempt timeout and exponential backoff
//! - ResponseTransformer: Uniform result envelopes with per-command normalization
//! - FallbackResponder: Synthetic envelopes for circuit-open and capacity refusals
//! - HealthMonitor / Lifecycle: Sampled health reports and background tasks
//! - EventBus: Broadcast of structured routing events

pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod fallback;
pub mod health;
pub mod history;
pub mod lifecycle;
pub mod limiter;
pub mod router;
pub mod table;
pub mod transform;

pub use circuit_breaker::{BreakerError, CallPermit, CircuitBreaker, CircuitBreakerConfig};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use context::RequestContext;
pub use error::RouterError;
pub use events::{EventBus, RouterEvent};
pub use executor::{Execution, ExecutorError, HttpResponse, RequestExecutor, RetryPolicy};
pub use fallback::FallbackResponder;
pub use health::{HealthMonitor, HealthMonitorConfig};
pub use history::{CommandSummary, RoutingHistory};
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use limiter::{ConcurrencyLimiter, LimiterConfig, LimiterError, Slot};
pub use router::{CommandRouter, RouteOptions};
pub use table::RoutingTable;
pub use transform::{NormalizerRegistry, ResponseNormalizer, ResponseTransformer, ResponseValidator};

pub type Result<T> = std::result::Result<T, RouterError>;
