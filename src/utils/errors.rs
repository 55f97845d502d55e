// src/utils/errors.rs
//! Error taxonomy for the worker service
//!
//! `AuthFailure` and `BadRequest` never carry side effects.
//! `ResourceExhausted` and `SpawnFailure` are reported after the partial
//! allocation has been rolled back. `TransportError` is confined to one
//! connection or one request.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Worker service errors
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("authentication failed")]
    AuthFailure,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("failed to spawn agent: {0}")]
    SpawnFailure(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("worker is shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Message reported to a remote caller.
    ///
    /// Authentication failures are indistinguishable from unknown roles.
    pub fn client_message(&self) -> String {
        match self {
            WorkerError::AuthFailure | WorkerError::BadRequest(_) => "bad request".to_string(),
            other => other.to_string(),
        }
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::AuthFailure => "auth_failure",
            WorkerError::BadRequest(_) => "bad_request",
            WorkerError::ResourceExhausted(_) => "resource_exhausted",
            WorkerError::SpawnFailure(_) => "spawn_failure",
            WorkerError::TransportError(_) => "transport_error",
            WorkerError::ShuttingDown => "shutting_down",
            WorkerError::ConfigError(_) => "config_error",
            WorkerError::Io(_) => "io",
        }
    }
}

impl From<config::ConfigError> for WorkerError {
    fn from(e: config::ConfigError) -> Self {
        WorkerError::ConfigError(e.to_string())
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(e: serde_json::Error) -> Self {
        WorkerError::TransportError(format!("malformed message: {}", e))
    }
}
