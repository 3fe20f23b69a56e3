//! Error types for the sync engine.

use outpost_core::CoreError;
use outpost_sync_protocol::{ErrorCode, ProtocolError, SessionPhase, StartStatus};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Malformed or unexpected message.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The authority answered with an error.
    #[error("server error ({code:?}): {message}")]
    Server {
        /// Error class.
        code: ErrorCode,
        /// Server-side description.
        message: String,
    },

    /// Local store failure, including apply-time conflicts.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The session lost a race with concurrent changes and restarted too often.
    #[error("sync conflict: session restarted {restarts} time(s) and still conflicted")]
    Conflict {
        /// Restarts attempted.
        restarts: u32,
    },

    /// The authority would not open a session.
    #[error("sync session refused: {0:?}")]
    SessionRefused(StartStatus),

    /// A session is already running on this node.
    #[error("a sync session is already running")]
    AlreadyRunning,

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current phase.
        from: SessionPhase,
        /// Attempted phase.
        to: SessionPhase,
    },

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A background task failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true for transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::NotConnected => true,
            SyncError::Server { code, .. } => code.is_retryable(),
            SyncError::SessionRefused(status) => matches!(
                status,
                StartStatus::Busy | StartStatus::Queued | StartStatus::AlreadyActive
            ),
            // Restart limit exhausted within one attempt; a later attempt starts fresh.
            SyncError::Conflict { .. } => true,
            _ => false,
        }
    }

    /// Returns true if the session lost a race.
    pub fn is_conflict(&self) -> bool {
        match self {
            SyncError::Conflict { .. } => true,
            SyncError::Core(err) => err.is_conflict(),
            _ => false,
        }
    }

    /// Returns true for defects that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Configuration(_) => true,
            SyncError::Server { code, .. } => *code == ErrorCode::Configuration,
            SyncError::Core(err) => err.is_fatal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_core::RecordKey;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::SessionRefused(StartStatus::Busy).is_retryable());
        assert!(SyncError::SessionRefused(StartStatus::Queued).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::AlreadyRunning.is_retryable());
    }

    #[test]
    fn server_errors_follow_their_code() {
        let lapsed = SyncError::Server {
            code: ErrorCode::SessionLapsed,
            message: "lapsed".into(),
        };
        assert!(lapsed.is_retryable());
        let bad = SyncError::Server {
            code: ErrorCode::InvalidPhase,
            message: "push is not allowed".into(),
        };
        assert!(!bad.is_retryable());
        let config = SyncError::Server {
            code: ErrorCode::Configuration,
            message: "max_chunk_size".into(),
        };
        assert!(config.is_fatal());
    }

    #[test]
    fn classification_of_core_errors() {
        let conflict = SyncError::from(CoreError::Conflict {
            count: 2,
            first: RecordKey::new("patients", "p1"),
        });
        assert!(conflict.is_conflict());
        assert!(!conflict.is_fatal());

        let ordering = SyncError::from(CoreError::OrderingViolation {
            record_type: "patients".into(),
            after: "encounters".into(),
        });
        assert!(ordering.is_fatal());
        assert!(!ordering.is_retryable());
    }

    #[test]
    fn error_display() {
        assert_eq!(SyncError::NotConnected.to_string(), "not connected to server");
        let err = SyncError::InvalidStateTransition {
            from: SessionPhase::Pulling,
            to: SessionPhase::Done,
        };
        assert_eq!(err.to_string(), "invalid state transition from PULLING to DONE");
    }
}
