use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::env::{command_env_key, parse_bool, parse_var, EnvLookup};
use crate::{ConfigError, Result, DEFAULT_ENVIRONMENT};

/// Global block: admission control, breaker and retry tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    pub max_concurrent_requests: u32,
    pub queue_size: u32,
    pub queue_enabled: bool,
    pub queue_timeout_ms: u64,
    /// Failure percentage over the rolling window that opens a circuit
    pub circuit_breaker_threshold: u32,
    /// Minimum outcomes in the window before the failure percentage is trusted
    pub circuit_breaker_volume_threshold: u32,
    /// How long a circuit stays open before a trial call
    pub circuit_breaker_timeout_ms: u64,
    pub circuit_breaker_window_ms: u64,
    pub rate_limit_per_minute: Option<u32>,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub health_check_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub history_capacity: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            queue_size: 100,
            queue_enabled: true,
            queue_timeout_ms: 30_000,
            circuit_breaker_threshold: 50,
            circuit_breaker_volume_threshold: 5,
            circuit_breaker_timeout_ms: 30_000,
            circuit_breaker_window_ms: 10_000,
            rate_limit_per_minute: None,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 10_000,
            health_check_timeout_ms: 5_000,
            shutdown_grace_ms: 30_000,
            history_capacity: 500,
        }
    }
}

impl RouterSettings {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_timeout_ms)
    }

    pub fn circuit_breaker_window(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_window_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid("max_concurrent_requests must be at least 1".to_string()));
        }
        if self.circuit_breaker_threshold == 0 || self.circuit_breaker_threshold > 100 {
            return Err(ConfigError::Invalid(format!(
                "circuit_breaker_threshold must be within 1-100, got {}",
                self.circuit_breaker_threshold
            )));
        }
        if self.circuit_breaker_volume_threshold == 0 {
            return Err(ConfigError::Invalid("circuit_breaker_volume_threshold must be at least 1".to_string()));
        }
        if self.circuit_breaker_window_ms == 0 {
            return Err(ConfigError::Invalid("circuit_breaker_window_ms must be positive".to_string()));
        }
        if self.rate_limit_per_minute == Some(0) {
            return Err(ConfigError::Invalid("rate_limit_per_minute must be positive when set".to_string()));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    fn apply_env(&mut self, env: &dyn EnvLookup) {
        if let Some(v) = parse_var(env, "CR_MAX_CONCURRENT_REQUESTS") {
            self.max_concurrent_requests = v;
        }
        if let Some(v) = parse_var(env, "CR_QUEUE_SIZE") {
            self.queue_size = v;
        }
        if let Some(v) = parse_bool(env, "CR_QUEUE_ENABLED") {
            self.queue_enabled = v;
        }
        if let Some(v) = parse_var(env, "CR_QUEUE_TIMEOUT_MS") {
            self.queue_timeout_ms = v;
        }
        if let Some(v) = parse_var(env, "CR_CIRCUIT_BREAKER_THRESHOLD") {
            self.circuit_breaker_threshold = v;
        }
        if let Some(v) = parse_var(env, "CR_CIRCUIT_BREAKER_VOLUME_THRESHOLD") {
            self.circuit_breaker_volume_threshold = v;
        }
        if let Some(v) = parse_var(env, "CR_CIRCUIT_BREAKER_TIMEOUT_MS") {
            self.circuit_breaker_timeout_ms = v;
        }
        if let Some(v) = parse_var(env, "CR_RATE_LIMIT_PER_MINUTE") {
            self.rate_limit_per_minute = Some(v);
        }
    }
}

/// Partial endpoint block; every field may be absent at any layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSpec {
    pub url: Option<String>,
    pub method: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub priority: Option<u8>,
    pub enabled: Option<bool>,
    pub health_url: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl EndpointSpec {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Deep merge: fields set on `over` win, headers are merged key by key
    pub fn merged_with(&self, over: &EndpointSpec) -> EndpointSpec {
        let mut headers = self.headers.clone();
        headers.extend(over.headers.iter().map(|(k, v)| (k.clone(), v.clone())));

        EndpointSpec {
            url: over.url.clone().or_else(|| self.url.clone()),
            method: over.method.clone().or_else(|| self.method.clone()),
            timeout_ms: over.timeout_ms.or(self.timeout_ms),
            max_retries: over.max_retries.or(self.max_retries),
            priority: over.priority.or(self.priority),
            enabled: over.enabled.or(self.enabled),
            health_url: over.health_url.clone().or_else(|| self.health_url.clone()),
            headers,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == EndpointSpec::default()
    }

    fn from_env(command_type: &str, env: &dyn EnvLookup) -> EndpointSpec {
        let prefix = format!("CR_ENDPOINT_{}", command_env_key(command_type));
        EndpointSpec {
            url: env.var(&format!("{prefix}_URL")),
            method: env.var(&format!("{prefix}_METHOD")),
            timeout_ms: parse_var(env, &format!("{prefix}_TIMEOUT_MS")),
            max_retries: parse_var(env, &format!("{prefix}_MAX_RETRIES")),
            priority: parse_var(env, &format!("{prefix}_PRIORITY")),
            enabled: parse_bool(env, &format!("{prefix}_ENABLED")),
            health_url: env.var(&format!("{prefix}_HEALTH_URL")),
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentOverride {
    pub endpoints: BTreeMap<String, EndpointSpec>,
}

/// Complete configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub environment: String,
    pub router: RouterSettings,
    pub endpoints: BTreeMap<String, EndpointSpec>,
    pub environments: BTreeMap<String, EnvironmentOverride>,
    /// Highest-precedence layer collected from environment variables
    #[serde(skip)]
    pub env_overrides: BTreeMap<String, EndpointSpec>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            environment: DEFAULT_ENVIRONMENT.to_string(),
            router: RouterSettings::default(),
            endpoints: BTreeMap::new(),
            environments: BTreeMap::new(),
            env_overrides: BTreeMap::new(),
        }
    }
}

impl RouterConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: RouterConfig = toml::from_str(raw)?;
        Ok(config)
    }

    /// Apply environment-variable overrides for the environment name, the
    /// global block, and every command type known to any layer
    pub fn apply_env(&mut self, env: &dyn EnvLookup) {
        if let Some(environment) = env.var("CR_ENVIRONMENT") {
            self.environment = environment;
        }
        self.router.apply_env(env);

        for command_type in self.command_types() {
            let spec = EndpointSpec::from_env(&command_type, env);
            if !spec.is_empty() {
                debug!(command_type = %command_type, "Environment variable overrides found");
                self.env_overrides.insert(command_type, spec);
            }
        }
    }

    /// Every command type named by the base block or any environment block
    pub fn command_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.keys().cloned().collect();
        for block in self.environments.values() {
            names.extend(block.endpoints.keys().cloned());
        }
        names.sort();
        names.dedup();
        names
    }

    /// Environment block for the active environment merged with the env-var layer
    pub fn effective_overrides(&self) -> BTreeMap<String, EndpointSpec> {
        let mut merged = self
            .environments
            .get(&self.environment)
            .map(|block| block.endpoints.clone())
            .unwrap_or_default();

        for (command_type, spec) in &self.env_overrides {
            let layered = merged
                .get(command_type)
                .map(|existing| existing.merged_with(spec))
                .unwrap_or_else(|| spec.clone());
            merged.insert(command_type.clone(), layered);
        }
        merged
    }

    pub fn validate(&self) -> Result<()> {
        if self.environment.trim().is_empty() {
            return Err(ConfigError::Invalid("environment must not be empty".to_string()));
        }
        self.router.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MapEnv;

    const SAMPLE: &str = r#"
environment = "staging"

[router]
max_concurrent_requests = 4
queue_size = 8

[endpoints.scrape]
url = "http://scraper.internal/run"
timeout_ms = 20000
priority = 2

[endpoints.scrape.headers]
x-team = "data"

[endpoints.search]
url = "http://search.internal/query"
enabled = false

[environments.staging.endpoints.scrape]
url = "http://scraper.staging/run"

[environments.staging.endpoints.scrape.headers]
x-stage = "yes"

[environments.production.endpoints.search]
enabled = true
"#;

    #[test]
    fn test_parse_sample() {
        let config = RouterConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.environment, "staging");
        assert_eq!(config.router.max_concurrent_requests, 4);
        assert_eq!(config.router.queue_size, 8);
        // untouched settings keep their defaults
        assert_eq!(config.router.circuit_breaker_threshold, 50);
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints["scrape"].priority, Some(2));
        assert_eq!(config.endpoints["search"].enabled, Some(false));
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = RouterConfig::from_toml_str("").unwrap();
        assert_eq!(config.environment, "development");
        assert_eq!(config.router, RouterSettings::default());
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn test_merge_prefers_override_and_merges_headers() {
        let config = RouterConfig::from_toml_str(SAMPLE).unwrap();
        let overrides = config.effective_overrides();
        let merged = config.endpoints["scrape"].merged_with(&overrides["scrape"]);

        assert_eq!(merged.url.as_deref(), Some("http://scraper.staging/run"));
        assert_eq!(merged.timeout_ms, Some(20000));
        assert_eq!(merged.headers.get("x-team").map(String::as_str), Some("data"));
        assert_eq!(merged.headers.get("x-stage").map(String::as_str), Some("yes"));
    }

    #[test]
    fn test_env_vars_take_highest_precedence() {
        let mut config = RouterConfig::from_toml_str(SAMPLE).unwrap();
        let env = MapEnv::new()
            .with("CR_ENDPOINT_SCRAPE_URL", "http://scraper.env/run")
            .with("CR_ENDPOINT_SEARCH_ENABLED", "true")
            .with("CR_QUEUE_SIZE", "0");
        config.apply_env(&env);

        assert_eq!(config.router.queue_size, 0);
        let overrides = config.effective_overrides();
        assert_eq!(overrides["scrape"].url.as_deref(), Some("http://scraper.env/run"));
        // staging header from the environment block survives the env-var layer
        assert_eq!(overrides["scrape"].headers.get("x-stage").map(String::as_str), Some("yes"));
        assert_eq!(overrides["search"].enabled, Some(true));
    }

    #[test]
    fn test_environment_switch_via_env() {
        let mut config = RouterConfig::from_toml_str(SAMPLE).unwrap();
        config.apply_env(&MapEnv::new().with("CR_ENVIRONMENT", "production"));

        assert_eq!(config.environment, "production");
        let overrides = config.effective_overrides();
        assert!(overrides.get("scrape").is_none());
        assert_eq!(overrides["search"].enabled, Some(true));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = RouterConfig::default();
        config.router.max_concurrent_requests = 0;
        assert!(config.validate().is_err());

        let mut config = RouterConfig::default();
        config.router.circuit_breaker_threshold = 150;
        assert!(config.validate().is_err());

        let mut config = RouterConfig::default();
        config.router.rate_limit_per_minute = Some(0);
        assert!(config.validate().is_err());
    }
}
