//! Environment variable lookup
//!
//! Lookups go through [`EnvLookup`] so configuration can be resolved against
//! the process environment in production and against a plain map in tests.

use std::collections::HashMap;

pub trait EnvLookup: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads from `std::env`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

/// Fixed set of variables
#[derive(Debug, Clone, Default)]
pub struct MapEnv(HashMap<String, String>);

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}

impl EnvLookup for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.0.get(key).filter(|v| !v.is_empty()).cloned()
    }
}

/// `web-scrape` -> `WEB_SCRAPE`
pub fn command_env_key(command_type: &str) -> String {
    command_type
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// Parse a variable, ignoring (with a warning) values that do not parse
pub(crate) fn parse_var<T: std::str::FromStr>(env: &dyn EnvLookup, key: &str) -> Option<T> {
    let raw = env.var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key = %key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

pub(crate) fn parse_bool(env: &dyn EnvLookup, key: &str) -> Option<bool> {
    let raw = env.var(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key = %key, value = %raw, "Ignoring unparseable boolean override");
            None
        }
    }
}
