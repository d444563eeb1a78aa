//! Per-endpoint circuit breaker registry
//!
//! One breaker per command type, created lazily on first use. Breakers are
//! never shared between endpoints.

use std::sync::Arc;

use cr_common::{CircuitBreakerStats, CircuitState};
use dashmap::DashMap;
use tracing::info;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::events::EventBus;

pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
    events: EventBus,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            events,
        }
    }

    pub fn get_or_create(&self, command_type: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(command_type) {
            return existing.clone();
        }
        self.breakers
            .entry(command_type.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(command_type, self.config.clone(), self.events.clone()))
            })
            .clone()
    }

    pub fn get(&self, command_type: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(command_type).map(|b| b.clone())
    }

    /// Current state, `Closed` for endpoints that have not been called yet
    pub fn state(&self, command_type: &str) -> CircuitState {
        self.breakers
            .get(command_type)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Drop breakers for command types no longer present after a reload
    pub fn retain(&self, command_types: &[String]) {
        let before = self.breakers.len();
        self.breakers.retain(|name, _| command_types.iter().any(|c| c == name));
        let removed = before - self.breakers.len();
        if removed > 0 {
            info!(removed, "Removed circuit breakers for retired routes");
        }
    }

    pub fn in_state(&self, state: CircuitState) -> Vec<String> {
        let mut names: Vec<String> = self
            .breakers
            .iter()
            .filter(|entry| entry.value().state() == state)
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Stats for every breaker, sorted by name
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<CircuitBreakerStats> = self.breakers.iter().map(|b| b.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
