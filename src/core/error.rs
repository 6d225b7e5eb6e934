//! Custom error types for agentrelay
//!
//! Provides a unified error handling system across all modules. Expected
//! business outcomes (a run that failed remotely, a tool call whose handler
//! errored) are *not* errors here; they are carried as values in
//! [`RunOutcome`](crate::core::RunOutcome) and
//! [`ToolCallResult`](crate::core::ToolCallResult).

use thiserror::Error;

/// Main error type for agentrelay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A registrar failed while registering its functions
    #[error("Registration error in '{registrar}': {message}")]
    Registration { registrar: String, message: String },

    /// No handler bound to this function name
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// No thread has been initialized for this agent
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// A non-terminal run already holds this thread
    #[error("Thread {thread_id} is busy with another run")]
    ThreadBusy { thread_id: String },

    /// Polling gave up after exhausting local retries
    #[error("Polling run {run_id} failed: {reason}")]
    RunPollingFailed { run_id: String, reason: String },

    /// Retryable remote failure (timeout, rate limit, 5xx)
    #[error("Transient service error: {0}")]
    Transient(String),

    /// Non-retryable remote failure
    #[error("Service error ({status}): {message}")]
    Service { status: u16, message: String },

    /// Durable store failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for other cases
    #[error("{0}")]
    Other(String),
}

/// Convenience Result type for agentrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a registration error
    pub fn registration(registrar: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Registration {
            registrar: registrar.into(),
            message: msg.into(),
        }
    }

    /// Create a non-retryable service error
    pub fn service(status: u16, msg: impl Into<String>) -> Self {
        Self::Service {
            status,
            message: msg.into(),
        }
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether a bounded local retry may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Service { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
