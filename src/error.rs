use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("Failed to execute {command}: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Failed to parse driver output: {0}")]
    Parse(String),

    #[error("Unsupported security mode '{security}' for interface '{interface}'")]
    UnsupportedSecurity { interface: String, security: String },

    #[error("Interface '{interface}' is missing required field '{field}'")]
    MissingField { interface: String, field: &'static str },

    #[error("Failed to resolve '{hostname}': {reason}")]
    Resolution { hostname: String, reason: String },

    #[error("Scan on '{interface}' produced no results within {timeout:?}")]
    ScanTimedOut { interface: String, timeout: Duration },

    #[error("Scan on '{0}' was cancelled")]
    ScanCancelled(String),

    #[error("Network supervisor is not running")]
    SupervisorGone,
}

impl NetworkError {
    /// True for errors that describe a bad persisted record rather than a
    /// runtime condition.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            NetworkError::UnsupportedSecurity { .. } | NetworkError::MissingField { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Supervisor '{supervisor}' exceeded {restarts} restarts within {window:?}")]
    RestartIntensityExceeded {
        supervisor: String,
        restarts: usize,
        window: Duration,
    },

    #[error("Supervisor '{0}' control channel closed")]
    ChannelClosed(String),

    #[error("Child '{0}' is already running")]
    AlreadyStarted(String),
}
