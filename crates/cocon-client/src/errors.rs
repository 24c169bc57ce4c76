//! CoCon client error types.
//!
//! The taxonomy separates what the runtime recovers from on its own
//! (transient network failures, session invalidation) from what is surfaced
//! to callers (per-command exhaustion, fatal connect failures, cancellation).

use crate::config::ConfigError;
use thiserror::Error;

/// CoCon client error type.
///
/// Recovery behavior per variant:
/// - `TransientNetwork`: retried with backoff
/// - `SessionInvalid`: triggers reconnection, never a plain retry
/// - `Protocol`: logged, the event or command is dropped
/// - everything else: surfaced to the caller
#[derive(Debug, Clone, Error)]
pub enum CoConError {
    /// Timeout, connection reset, refused connection or server error.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// The server no longer recognizes the session id.
    #[error("Session invalid: {0}")]
    SessionInvalid(String),

    /// Malformed or unexpected response body.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server refused a command with a non-retryable status.
    #[error("'/{endpoint}' failed with HTTP {status}")]
    CommandRejected {
        endpoint: String,
        status: u16,
        body: Option<String>,
    },

    /// A command failed on every allowed attempt.
    #[error("Command '{command}' failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        command: String,
        attempts: u32,
        last_error: Box<CoConError>,
    },

    /// Session establishment failed on every allowed attempt.
    #[error("Failed to connect after {attempts} attempts: {last_error}")]
    FatalConnect {
        attempts: u32,
        last_error: Box<CoConError>,
    },

    /// The command queue is at capacity.
    #[error("Command queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The session was lost and could not be re-established.
    #[error("Not connected")]
    NotConnected,

    /// The operation was cancelled by shutdown.
    #[error("Cancelled")]
    Cancelled,

    /// The client has been closed.
    #[error("Client is closed")]
    ClientClosed,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl CoConError {
    /// Whether the command queue and connect path may retry this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoConError::TransientNetwork(_))
    }

    /// Whether this error means the session must be re-established.
    #[must_use]
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, CoConError::SessionInvalid(_))
    }

    /// Short, bounded label used for metrics and structured logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            CoConError::TransientNetwork(_) => "transient_network",
            CoConError::SessionInvalid(_) => "session_invalid",
            CoConError::Protocol(_) => "protocol",
            CoConError::CommandRejected { .. } => "command_rejected",
            CoConError::RetryExhausted { .. } => "retry_exhausted",
            CoConError::FatalConnect { .. } => "fatal_connect",
            CoConError::QueueFull { .. } => "queue_full",
            CoConError::NotConnected => "not_connected",
            CoConError::Cancelled => "cancelled",
            CoConError::ClientClosed => "client_closed",
            CoConError::Config(_) => "config",
        }
    }
}

/// Failure of a single notification handler invocation.
///
/// Reported through logs and the optional error hook; never propagated into
/// the polling loop.
#[derive(Debug, Error)]
pub enum HandlerFailure {
    /// The handler returned an error.
    #[error("handler returned error: {0:#}")]
    Error(anyhow::Error),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The handler did not finish within the configured timeout.
    #[error("handler timed out after {0:?}")]
    TimedOut(std::time::Duration),
}

impl HandlerFailure {
    /// Bounded label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerFailure::Error(_) => "error",
            HandlerFailure::Panicked(_) => "panic",
            HandlerFailure::TimedOut(_) => "timeout",
        }
    }
}
