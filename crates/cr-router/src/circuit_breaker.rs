//! CircuitBreaker - per-endpoint failure-rate breaker
//!
//! - Rolling time window of call outcomes
//! - Opens when the failure percentage exceeds the threshold and the window
//!   holds at least `volume_threshold` outcomes
//! - After `reset_timeout` a single trial call is let through (half-open)
//! - The trial's outcome closes or re-opens the circuit
//!
//! State check and window update happen under one lock so concurrent callers
//! against the same endpoint observe a linear sequence of transitions.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use cr_common::{CircuitBreakerStats, CircuitState};
use cr_config::RouterSettings;
use metrics::counter;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::events::{EventBus, RouterEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failure percentage (strictly exceeded) that trips the breaker
    pub error_threshold_percentage: u32,
    /// Minimum outcomes in the window before the percentage is evaluated
    pub volume_threshold: u32,
    /// Time spent open before a trial call is allowed
    pub reset_timeout: Duration,
    /// Rolling window length
    pub window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_percentage: 50,
            volume_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            window: Duration::from_secs(10),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_settings(settings: &RouterSettings) -> Self {
        Self {
            error_threshold_percentage: settings.circuit_breaker_threshold,
            volume_threshold: settings.circuit_breaker_volume_threshold,
            reset_timeout: settings.circuit_breaker_timeout(),
            window: settings.circuit_breaker_window(),
        }
    }
}

#[derive(Error, Debug)]
pub enum BreakerError<E> {
    /// Short-circuited without invoking the wrapped call
    #[error("Circuit '{name}' is open")]
    Open { name: String, retry_after: Duration },

    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// (recorded_at, failed)
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    times_opened: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            opened_at: None,
            trial_in_flight: false,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
            times_opened: 0,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.window.front() {
            if now.duration_since(*at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_counts(&self) -> (u32, u32) {
        let calls = self.window.len() as u32;
        let failures = self.window.iter().filter(|(_, failed)| *failed).count() as u32;
        (calls, failures)
    }

    fn failure_rate(&self) -> f64 {
        let (calls, failures) = self.window_counts();
        if calls == 0 {
            0.0
        } else {
            failures as f64 * 100.0 / calls as f64
        }
    }
}

type Transition = (CircuitState, CircuitState, f64);

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    events: EventBus,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Run `call` through the breaker. Only the final outcome of `call` is
    /// recorded, so retries performed inside it count once.
    pub async fn execute<T, E, Fut>(&self, call: Fut) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let mut permit = self.try_acquire()?;
        let outcome = call.await;
        permit.record(outcome.is_err());
        outcome.map_err(BreakerError::Inner)
    }

    /// Admission decision. The returned permit must be resolved with
    /// [`CallPermit::record`]; dropping it unresolved frees a half-open trial.
    pub fn try_acquire<E>(&self) -> Result<CallPermit<'_>, BreakerError<E>> {
        let now = Instant::now();
        let mut transition = None;

        let admitted = {
            let mut st = self.state.lock();
            match st.state {
                CircuitState::Closed => Ok(false),
                CircuitState::Open => {
                    let opened_at = st.opened_at.unwrap_or(now);
                    let elapsed = now.duration_since(opened_at);
                    if elapsed >= self.config.reset_timeout {
                        let rate = st.failure_rate();
                        st.state = CircuitState::HalfOpen;
                        st.trial_in_flight = true;
                        transition = Some((CircuitState::Open, CircuitState::HalfOpen, rate));
                        Ok(true)
                    } else {
                        st.total_rejections += 1;
                        Err(self.config.reset_timeout - elapsed)
                    }
                }
                CircuitState::HalfOpen => {
                    if st.trial_in_flight {
                        st.total_rejections += 1;
                        Err(Duration::ZERO)
                    } else {
                        st.trial_in_flight = true;
                        Ok(true)
                    }
                }
            }
        };

        if let Some(t) = transition {
            self.announce(t);
        }

        match admitted {
            Ok(trial) => Ok(CallPermit {
                breaker: self,
                trial,
                resolved: false,
            }),
            Err(retry_after) => {
                debug!(breaker = %self.name, retry_after_ms = retry_after.as_millis() as u64, "Circuit open, short-circuiting");
                Err(BreakerError::Open {
                    name: self.name.clone(),
                    retry_after,
                })
            }
        }
    }

    fn record(&self, failed: bool, trial: bool) {
        let now = Instant::now();
        let transition = {
            let mut st = self.state.lock();
            st.prune(now, self.config.window);
            st.window.push_back((now, failed));
            if failed {
                st.total_failures += 1;
            } else {
                st.total_successes += 1;
            }

            match st.state {
                CircuitState::HalfOpen if trial => {
                    st.trial_in_flight = false;
                    if failed {
                        self.open(&mut st, now, CircuitState::HalfOpen)
                    } else {
                        let rate = st.failure_rate();
                        st.state = CircuitState::Closed;
                        st.opened_at = None;
                        st.window.clear();
                        Some((CircuitState::HalfOpen, CircuitState::Closed, rate))
                    }
                }
                CircuitState::Closed if failed => {
                    let (calls, _) = st.window_counts();
                    let rate = st.failure_rate();
                    if calls >= self.config.volume_threshold
                        && rate > self.config.error_threshold_percentage as f64
                    {
                        self.open(&mut st, now, CircuitState::Closed)
                    } else {
                        None
                    }
                }
                // Calls admitted before the circuit opened only feed the window
                _ => None,
            }
        };

        if let Some(t) = transition {
            self.announce(t);
        }
    }

    fn open(&self, st: &mut BreakerState, now: Instant, from: CircuitState) -> Option<Transition> {
        st.state = CircuitState::Open;
        st.opened_at = Some(now);
        st.times_opened += 1;
        Some((from, CircuitState::Open, st.failure_rate()))
    }

    fn release_trial(&self) {
        let mut st = self.state.lock();
        if st.state == CircuitState::HalfOpen {
            st.trial_in_flight = false;
        }
    }

    fn announce(&self, (from, to, rate): Transition) {
        counter!("cr_circuit_state_changes_total", "breaker" => self.name.clone(), "to" => to.as_str()).increment(1);
        self.events.publish(RouterEvent::CircuitStateChanged {
            name: self.name.clone(),
            from,
            to,
            failure_rate_percent: rate,
        });
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let now = Instant::now();
        let mut st = self.state.lock();
        st.prune(now, self.config.window);
        let (window_calls, window_failures) = st.window_counts();
        let retry_after_ms = match (st.state, st.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                self.config
                    .reset_timeout
                    .saturating_sub(now.duration_since(opened_at))
                    .as_millis() as u64,
            ),
            _ => None,
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: st.state,
            window_calls,
            window_failures,
            failure_rate_percent: st.failure_rate(),
            total_successes: st.total_successes,
            total_failures: st.total_failures,
            total_rejections: st.total_rejections,
            times_opened: st.times_opened,
            retry_after_ms,
        }
    }
}

/// Admission ticket handed out by [`CircuitBreaker::try_acquire`]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl CallPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record(&mut self, failed: bool) {
        if !self.resolved {
            self.resolved = true;
            self.breaker.record(failed, self.trial);
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(volume: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "scrape",
            CircuitBreakerConfig {
                error_threshold_percentage: 50,
                volume_threshold: volume,
                reset_timeout: Duration::from_secs(30),
                window: Duration::from_secs(10),
            },
            EventBus::default(),
        )
    }

    async fn fail(cb: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), BreakerError<&'static str>> {
        cb.execute(async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("boom")
        })
        .await
    }

    async fn succeed(cb: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), BreakerError<&'static str>> {
        cb.execute(async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<(), &'static str>(())
        })
        .await
    }

    #[tokio::test]
    async fn test_stays_closed_below_volume() {
        let cb = breaker(5);
        let calls = AtomicUsize::new(0);
        for _ in 0..4 {
            assert!(matches!(fail(&cb, &calls).await, Err(BreakerError::Inner(_))));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().window_failures, 4);
    }

    #[tokio::test]
    async fn test_exactly_threshold_does_not_trip() {
        let cb = breaker(4);
        let calls = AtomicUsize::new(0);
        succeed(&cb, &calls).await.unwrap();
        succeed(&cb, &calls).await.unwrap();
        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        // 50% is not strictly above 50%
        assert_eq!(cb.state(), CircuitState::Closed);

        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().times_opened, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_short_circuits_then_single_trial() {
        let cb = breaker(3);
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = fail(&cb, &calls).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Within the reset timeout: no calls go through
        for _ in 0..5 {
            assert!(matches!(succeed(&cb, &calls).await, Err(BreakerError::Open { .. })));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cb.stats().total_rejections, 5);

        tokio::time::advance(Duration::from_secs(31)).await;

        // First caller becomes the trial; a concurrent caller is rejected
        let mut trial = cb.try_acquire::<()>().ok().unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire::<()>().is_err());

        trial.record(false);
        drop(trial);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().window_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let cb = breaker(2);
        let calls = AtomicUsize::new(0);
        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().times_opened, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_slot() {
        let cb = breaker(1);
        let calls = AtomicUsize::new(0);
        let _ = fail(&cb, &calls).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let trial = cb.try_acquire::<()>().ok().unwrap();
        drop(trial);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb, &calls).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_outcomes_leave_window() {
        let cb = breaker(3);
        let calls = AtomicUsize::new(0);
        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = fail(&cb, &calls).await;

        assert_eq!(cb.state(), CircuitState::Closed);
        let stats = cb.stats();
        assert_eq!(stats.window_calls, 1);
        assert_eq!(stats.total_failures, 3);
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let cb = CircuitBreaker::new(
            "search",
            CircuitBreakerConfig { volume_threshold: 1, ..Default::default() },
            events,
        );
        let calls = AtomicUsize::new(0);
        let _ = fail(&cb, &calls).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "circuit:open");
    }
}
