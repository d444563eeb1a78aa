//! RoutingTable - command type to endpoint mapping
//!
//! Built once per configuration snapshot by deep-merging the environment
//! override layer onto the base endpoint blocks. Commands that are absent
//! from the merged table are unroutable; there is no default endpoint.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use cr_common::{EndpointConfig, UnsupportedReason};
use cr_config::{resolve_endpoint, EndpointSpec, RouterConfig};
use tracing::warn;

use crate::events::{EventBus, RouterEvent};

#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<String, EndpointConfig>,
    /// Command types whose merged config could not be resolved, with the reason
    invalid: HashMap<String, String>,
    environment: String,
    built_at: DateTime<Utc>,
}

impl RoutingTable {
    /// Merge `overrides` onto `base` per command type and resolve every entry
    pub fn build(
        base: &BTreeMap<String, EndpointSpec>,
        overrides: &BTreeMap<String, EndpointSpec>,
        environment: &str,
        events: &EventBus,
    ) -> Self {
        let mut routes = HashMap::new();
        let mut invalid = HashMap::new();

        let mut command_types: Vec<&String> = base.keys().chain(overrides.keys()).collect();
        command_types.sort();
        command_types.dedup();

        for command_type in command_types {
            let merged = match (base.get(command_type), overrides.get(command_type)) {
                (Some(b), Some(o)) => b.merged_with(o),
                (Some(b), None) => b.clone(),
                (None, Some(o)) => o.clone(),
                (None, None) => continue,
            };

            match resolve_endpoint(command_type, &merged) {
                Ok(resolved) => {
                    for warning in &resolved.warnings {
                        warn!(command_type = %command_type, "{}", warning);
                    }
                    events.publish(RouterEvent::RouteRegistered {
                        command_type: command_type.clone(),
                        url: resolved.config.url.clone(),
                        priority: resolved.config.priority,
                        enabled: resolved.config.enabled,
                    });
                    routes.insert(command_type.clone(), resolved.config);
                }
                Err(reason) => {
                    warn!(
                        command_type = %command_type,
                        reason = %reason,
                        "Endpoint configuration invalid, command will be rejected"
                    );
                    invalid.insert(command_type.clone(), reason);
                }
            }
        }

        events.publish(RouterEvent::TableBuilt {
            environment: environment.to_string(),
            route_count: routes.len(),
            invalid_count: invalid.len(),
        });

        Self {
            routes,
            invalid,
            environment: environment.to_string(),
            built_at: Utc::now(),
        }
    }

    /// Build from a loaded configuration using its active environment
    pub fn from_config(config: &RouterConfig, events: &EventBus) -> Self {
        Self::build(&config.endpoints, &config.effective_overrides(), &config.environment, events)
    }

    pub fn resolve(&self, command_type: &str) -> Option<&EndpointConfig> {
        self.routes.get(command_type)
    }

    /// Routable endpoint, or the reason the command cannot be routed
    pub fn check(&self, command_type: &str) -> Result<&EndpointConfig, UnsupportedReason> {
        match self.routes.get(command_type) {
            Some(endpoint) if endpoint.enabled => Ok(endpoint),
            Some(_) => Err(UnsupportedReason::Disabled),
            None if self.invalid.contains_key(command_type) => Err(UnsupportedReason::InvalidConfiguration),
            None => Err(UnsupportedReason::NotConfigured),
        }
    }

    pub fn is_supported(&self, command_type: &str) -> Result<(), UnsupportedReason> {
        self.check(command_type).map(|_| ())
    }

    /// Command types with the given priority, sorted lexicographically
    pub fn by_priority(&self, priority: u8) -> Vec<String> {
        let mut matching: Vec<String> = self
            .routes
            .values()
            .filter(|e| e.priority == priority)
            .map(|e| e.command_type.clone())
            .collect();
        matching.sort();
        matching
    }

    /// All routable command types, sorted
    pub fn command_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every resolved endpoint, sorted by command type
    pub fn endpoints(&self) -> Vec<&EndpointConfig> {
        let mut endpoints: Vec<&EndpointConfig> = self.routes.values().collect();
        endpoints.sort_by(|a, b| a.command_type.cmp(&b.command_type));
        endpoints
    }

    pub fn invalid_reason(&self, command_type: &str) -> Option<&str> {
        self.invalid.get(command_type).map(String::as_str)
    }

    /// Command types rejected at build time, with the reason
    pub fn invalid_routes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.invalid.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.routes.values().filter(|e| e.enabled).count()
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }
}
