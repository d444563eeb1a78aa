//! ConcurrencyLimiter - global admission control
//!
//! - At most `max_concurrent` calls execute at once
//! - Overflow waits in a strict FIFO queue bounded by `queue_size`
//! - Each queued entry has its own wait timeout
//! - A freed slot is handed directly to the head of the queue
//! - Optional requests-per-minute cap using governor
//!
//! All counters live behind one mutex so `active <= max_concurrent` and
//! `queued <= queue_size` hold at every observable instant.

use std::collections::VecDeque;
use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;

use cr_common::LimiterStats;
use cr_config::RouterSettings;
use governor::{clock::DefaultClock, state::{InMemoryState, NotKeyed}, Quota, RateLimiter};
use metrics::gauge;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::events::{EventBus, RouterEvent};

/// Exponential smoothing weight given to the newest processing-time sample
const SMOOTHING_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    pub max_concurrent: u32,
    pub queue_size: u32,
    pub queue_enabled: bool,
    pub queue_timeout: Duration,
    pub rate_limit_per_minute: Option<u32>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            queue_size: 100,
            queue_enabled: true,
            queue_timeout: Duration::from_secs(30),
            rate_limit_per_minute: None,
        }
    }
}

impl LimiterConfig {
    pub fn from_settings(settings: &RouterSettings) -> Self {
        Self {
            max_concurrent: settings.max_concurrent_requests.max(1),
            queue_size: settings.queue_size,
            queue_enabled: settings.queue_enabled,
            queue_timeout: settings.queue_timeout(),
            rate_limit_per_minute: settings.rate_limit_per_minute,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LimiterError {
    #[error("Concurrency limit reached and queue is full ({queued}/{queue_size} queued)")]
    QueueFull { queued: u32, queue_size: u32 },

    #[error("Request waited {waited_ms}ms in queue without getting a slot")]
    QueueTimeout { waited_ms: u64 },

    #[error("Limiter is shutting down")]
    ShuttingDown,

    #[error("Rate limit of {per_minute} requests per minute exceeded")]
    RateLimited { per_minute: u32 },
}

impl LimiterError {
    pub fn reason(&self) -> &'static str {
        match self {
            LimiterError::QueueFull { .. } => "queue_full",
            LimiterError::QueueTimeout { .. } => "queue_timeout",
            LimiterError::ShuttingDown => "shutdown",
            LimiterError::RateLimited { .. } => "rate_limited",
        }
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<(), LimiterError>>,
}

#[derive(Default)]
struct LimiterState {
    active: u32,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
    shutting_down: bool,
    avg_processing_ms: f64,
    total_processed: u64,
    total_queued: u64,
    total_rejected: u64,
    total_timeouts: u64,
    peak_active: u32,
    peak_queued: u32,
}

enum Admission {
    Run,
    Wait { id: u64, rx: oneshot::Receiver<Result<(), LimiterError>>, position: usize },
    Reject(LimiterError),
}

pub struct ConcurrencyLimiter {
    config: LimiterConfig,
    state: Mutex<LimiterState>,
    rate_limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    events: EventBus,
}

impl ConcurrencyLimiter {
    pub fn new(config: LimiterConfig, events: EventBus) -> Self {
        let rate_limiter = config
            .rate_limit_per_minute
            .and_then(NonZeroU32::new)
            .map(|rpm| RateLimiter::direct(Quota::per_minute(rpm)));

        Self {
            config,
            state: Mutex::new(LimiterState::default()),
            rate_limiter,
            events,
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Run `f` once a slot is available. Queue wait is bounded by `queue_timeout`;
    /// the slot is released when `f` completes or the returned future is dropped.
    pub async fn execute<F, Fut, T>(&self, request_id: &str, queue_timeout: Duration, f: F) -> Result<T, LimiterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _slot = self.acquire(request_id, queue_timeout).await?;
        Ok(f().await)
    }

    /// Obtain a slot, queueing if necessary
    pub async fn acquire(&self, request_id: &str, queue_timeout: Duration) -> Result<Slot<'_>, LimiterError> {
        let admission = self.admit();
        let (id, rx, position) = match admission {
            Admission::Run => return Ok(Slot::new(self)),
            Admission::Reject(err) => {
                self.events.publish(RouterEvent::RequestRejected {
                    request_id: request_id.to_string(),
                    reason: err.reason().to_string(),
                });
                return Err(err);
            }
            Admission::Wait { id, rx, position } => (id, rx, position),
        };

        self.events.publish(RouterEvent::RequestQueued {
            request_id: request_id.to_string(),
            position,
        });

        let enqueued_at = Instant::now();
        let mut ticket = QueueTicket { limiter: self, id, rx, settled: false };
        let outcome = tokio::time::timeout(queue_timeout, &mut ticket.rx).await;
        let waited_ms = enqueued_at.elapsed().as_millis() as u64;

        let granted = match outcome {
            Ok(Ok(granted)) => granted,
            // Sender dropped without an answer
            Ok(Err(_)) => Err(LimiterError::ShuttingDown),
            Err(_) => {
                let mut st = self.state.lock();
                if let Some(pos) = st.queue.iter().position(|w| w.id == id) {
                    st.queue.remove(pos);
                    st.total_timeouts += 1;
                    self.publish_gauges(&st);
                    drop(st);
                    ticket.settled = true;
                    self.events.publish(RouterEvent::RequestTimeout {
                        request_id: request_id.to_string(),
                        waited_ms,
                    });
                    return Err(LimiterError::QueueTimeout { waited_ms });
                }
                // A slot was handed over between the timer firing and taking the lock
                ticket.rx.try_recv().unwrap_or(Err(LimiterError::ShuttingDown))
            }
        };
        ticket.settled = true;

        granted?;
        self.events.publish(RouterEvent::RequestDequeued {
            request_id: request_id.to_string(),
            waited_ms,
        });
        Ok(Slot::new(self))
    }

    fn admit(&self) -> Admission {
        let mut st = self.state.lock();
        if st.shutting_down {
            st.total_rejected += 1;
            return Admission::Reject(LimiterError::ShuttingDown);
        }

        if let (Some(rl), Some(per_minute)) = (&self.rate_limiter, self.config.rate_limit_per_minute) {
            if rl.check().is_err() {
                st.total_rejected += 1;
                return Admission::Reject(LimiterError::RateLimited { per_minute });
            }
        }

        if st.active < self.config.max_concurrent {
            st.active += 1;
            st.peak_active = st.peak_active.max(st.active);
            self.publish_gauges(&st);
            return Admission::Run;
        }

        let queued = st.queue.len() as u32;
        if !self.config.queue_enabled || queued >= self.config.queue_size {
            st.total_rejected += 1;
            debug!(active = st.active, queued, "Limiter at capacity, rejecting");
            return Admission::Reject(LimiterError::QueueFull {
                queued,
                queue_size: self.config.queue_size,
            });
        }

        let (tx, rx) = oneshot::channel();
        let id = st.next_waiter_id;
        st.next_waiter_id += 1;
        st.queue.push_back(Waiter { id, tx });
        st.total_queued += 1;
        st.peak_queued = st.peak_queued.max(st.queue.len() as u32);
        self.publish_gauges(&st);

        Admission::Wait { id, rx, position: st.queue.len() }
    }

    fn release(&self, processing: Duration) {
        let sample = processing.as_secs_f64() * 1000.0;
        let mut st = self.state.lock();
        st.avg_processing_ms = if st.total_processed == 0 {
            sample
        } else {
            SMOOTHING_WEIGHT * sample + (1.0 - SMOOTHING_WEIGHT) * st.avg_processing_ms
        };
        st.total_processed += 1;
        self.free_slot(&mut st);
    }

    /// Give the slot to the oldest live waiter, or return it to the pool
    fn free_slot(&self, st: &mut LimiterState) {
        while let Some(waiter) = st.queue.pop_front() {
            if waiter.tx.send(Ok(())).is_ok() {
                self.publish_gauges(st);
                return;
            }
        }
        st.active = st.active.saturating_sub(1);
        self.publish_gauges(st);
    }

    /// Remove an abandoned queue entry, or give back a slot it was handed
    fn abandon(&self, id: u64, rx: &mut oneshot::Receiver<Result<(), LimiterError>>) {
        let mut st = self.state.lock();
        if let Some(pos) = st.queue.iter().position(|w| w.id == id) {
            st.queue.remove(pos);
            self.publish_gauges(&st);
        } else if let Ok(Ok(())) = rx.try_recv() {
            self.free_slot(&mut st);
        }
    }

    /// Fail every queued entry and refuse new admissions.
    /// Running calls are left to finish.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<Waiter> = {
            let mut st = self.state.lock();
            st.shutting_down = true;
            let drained: Vec<Waiter> = st.queue.drain(..).collect();
            st.total_rejected += drained.len() as u64;
            self.publish_gauges(&st);
            drained
        };

        let count = drained.len();
        for waiter in drained {
            let _ = waiter.tx.send(Err(LimiterError::ShuttingDown));
        }
        info!(rejected_queued = count, "Concurrency limiter shut down");
        count
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    pub fn active(&self) -> u32 {
        self.state.lock().active
    }

    pub fn queued(&self) -> u32 {
        self.state.lock().queue.len() as u32
    }

    pub fn is_idle(&self) -> bool {
        let st = self.state.lock();
        st.active == 0 && st.queue.is_empty()
    }

    pub fn stats(&self) -> LimiterStats {
        let st = self.state.lock();
        LimiterStats {
            active: st.active,
            queued: st.queue.len() as u32,
            max_concurrent: self.config.max_concurrent,
            queue_size: self.config.queue_size,
            queue_enabled: self.config.queue_enabled,
            utilization_percent: st.active as f64 * 100.0 / self.config.max_concurrent as f64,
            avg_processing_ms: st.avg_processing_ms,
            total_processed: st.total_processed,
            total_queued: st.total_queued,
            total_rejected: st.total_rejected,
            total_timeouts: st.total_timeouts,
            peak_active: st.peak_active,
            peak_queued: st.peak_queued,
            rate_limit_per_minute: self.config.rate_limit_per_minute,
            shutting_down: st.shutting_down,
        }
    }

    fn publish_gauges(&self, st: &LimiterState) {
        gauge!("cr_limiter_active").set(st.active as f64);
        gauge!("cr_limiter_queued").set(st.queue.len() as f64);
    }
}

/// An occupied execution slot; freed (or handed over) on drop
pub struct Slot<'a> {
    limiter: &'a ConcurrencyLimiter,
    started: Instant,
}

impl<'a> Slot<'a> {
    fn new(limiter: &'a ConcurrencyLimiter) -> Self {
        Self { limiter, started: Instant::now() }
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.limiter.release(self.started.elapsed());
    }
}

struct QueueTicket<'a> {
    limiter: &'a ConcurrencyLimiter,
    id: u64,
    rx: oneshot::Receiver<Result<(), LimiterError>>,
    settled: bool,
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.limiter.abandon(self.id, &mut self.rx);
        }
    }
}
