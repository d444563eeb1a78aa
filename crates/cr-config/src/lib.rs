//! CommandRouter Configuration
//!
//! Layered configuration for the command router:
//! - Base endpoint blocks (`[endpoints.<command>]`)
//! - Environment override blocks (`[environments.<env>.endpoints.<command>]`)
//! - Environment variables (`CR_ENDPOINT_<COMMAND>_*`, `CR_*` globals)
//! - Hard-coded defaults
//!
//! Precedence is env var > environment block > base block > defaults.

pub mod env;
pub mod model;
pub mod resolve;
pub mod source;

use std::path::PathBuf;

pub use env::{EnvLookup, MapEnv, ProcessEnv, command_env_key};
pub use model::{EndpointSpec, EnvironmentOverride, RouterConfig, RouterSettings};
pub use resolve::{ResolvedEndpoint, resolve_endpoint};
pub use source::{ConfigSource, StaticSource, TomlFileSource};

pub const DEFAULT_CONFIG_PATH: &str = "config/routes.toml";
pub const DEFAULT_ENVIRONMENT: &str = "development";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
