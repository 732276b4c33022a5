// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the synchronization engine.
//!
//! Errors are categorized by their source (replica container, wire protocol,
//! transport, etc.) and carry enough context for the orchestrator to decide
//! what to do: abort the phase, skip an action, or park the replica in the
//! `Error` state until the next scheduled attempt.
//!
//! # Error Categories
//!
//! | Error Type | Kind | Description |
//! |------------|------|-------------|
//! | `Container` | Container | Replica store unreadable, schema mismatch, deleted underfoot |
//! | `Synchronization` | Synchronization | Wire protocol or acknowledgement-shape violation |
//! | `Transport` | Network | Authorization failure, not-found, generic server error |
//! | `Timeout` | Network | A transport call exceeded its per-call bound |
//! | `Config` | Unknown | Configuration invalid |
//! | `InvalidState` | Unknown | Orchestrator state machine violation |
//! | `Shutdown` | Unknown | Engine is shutting down |
//! | `Internal` | Unknown | Unexpected internal error |
//!
//! # Classification
//!
//! Use [`SyncError::kind()`] to get the user-visible [`ErrorKind`] that the
//! replica status surface reports. The orchestrator never lets any of these
//! crash the scheduler; a failed phase records the kind and waits for the
//! next tick.

use thiserror::Error;

/// Result type alias for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// User-visible error classification, surfaced on the replica status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The replica store itself is broken (unreadable, wrong schema).
    Container,
    /// The remote server and the local replica disagree on protocol shape.
    Synchronization,
    /// The server was unreachable, rejected credentials, or timed out.
    Network,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Container => write!(f, "container"),
            ErrorKind::Synchronization => write!(f, "synchronization"),
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Error returned by the [`Transport`](crate::transport::Transport)
/// collaborator. Distinguishes the three server-side failure shapes the
/// orchestrator cares about.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Credentials rejected or permission denied.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The requested resource does not exist on the server.
    #[error("not found: {0}")]
    NotFound(String),

    /// Generic server-side failure (5xx, malformed response, connection drop).
    #[error("server error: {0}")]
    Server(String),
}

/// Errors that can occur during synchronization.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Replica store error.
    ///
    /// The embedded database could not be opened, queried, or written.
    /// Not retried inline; the orchestrator re-attempts on a later tick.
    #[error("container error: {message}")]
    Container {
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// Wire protocol or acknowledgement-shape violation.
    ///
    /// The upload batch and the server's acknowledgement list did not line
    /// up, or a payload could not be encoded/decoded. Aborts the whole batch,
    /// never a partial commit.
    #[error("synchronization error: {0}")]
    Synchronization(String),

    /// Transport-level failure from the remote server.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A transport call exceeded its per-call timeout.
    ///
    /// The job fails; retry happens on the orchestrator's next tick, never
    /// inline.
    #[error("timeout during {phase}")]
    Timeout { phase: &'static str },

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Orchestrator state machine violation.
    ///
    /// An operation was attempted in the wrong state (e.g. starting a sync
    /// job on a replica already synchronizing). Indicates a bug in the caller.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a container error with a message only.
    pub fn container(message: impl Into<String>) -> Self {
        Self::Container {
            message: message.into(),
            source: None,
        }
    }

    /// Classify this error for the user-visible replica status.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Container { .. } => ErrorKind::Container,
            Self::Synchronization(_) => ErrorKind::Synchronization,
            Self::Transport(_) | Self::Timeout { .. } => ErrorKind::Network,
            Self::Config(_) | Self::InvalidState { .. } | Self::Shutdown | Self::Internal(_) => {
                ErrorKind::Unknown
            }
        }
    }

    /// Numeric code persisted into the replica metadata (`last_error_code`).
    pub fn code(&self) -> i64 {
        match self.kind() {
            ErrorKind::Container => 1,
            ErrorKind::Synchronization => 2,
            ErrorKind::Network => 3,
            ErrorKind::Unknown => 4,
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        Self::Container {
            message: e.to_string(),
            source: Some(e),
        }
    }
}
