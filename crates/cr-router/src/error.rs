use cr_common::UnsupportedReason;
use cr_config::ConfigError;
use thiserror::Error;

use crate::executor::ExecutorError;

/// Errors surfaced to the caller instead of a routing envelope
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Command type '{0}' is not configured")]
    NotConfigured(String),

    #[error("Command type '{0}' is disabled")]
    Disabled(String),

    #[error("Command type '{command_type}' has an invalid endpoint configuration: {reason}")]
    InvalidEndpoint { command_type: String, reason: String },

    #[error("Router is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client error: {0}")]
    Http(#[from] ExecutorError),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl RouterError {
    pub fn unsupported(command_type: &str, reason: UnsupportedReason, detail: Option<&str>) -> Self {
        match reason {
            UnsupportedReason::NotConfigured => RouterError::NotConfigured(command_type.to_string()),
            UnsupportedReason::Disabled => RouterError::Disabled(command_type.to_string()),
            UnsupportedReason::InvalidConfiguration => RouterError::InvalidEndpoint {
                command_type: command_type.to_string(),
                reason: detail.unwrap_or("unknown").to_string(),
            },
        }
    }

    /// Why the command could not be routed, for configuration errors
    pub fn reason(&self) -> Option<UnsupportedReason> {
        match self {
            RouterError::NotConfigured(_) => Some(UnsupportedReason::NotConfigured),
            RouterError::Disabled(_) => Some(UnsupportedReason::Disabled),
            RouterError::InvalidEndpoint { .. } => Some(UnsupportedReason::InvalidConfiguration),
            RouterError::ShuttingDown | RouterError::Config(_) | RouterError::Http(_) | RouterError::Task(_) => None,
        }
    }
}
