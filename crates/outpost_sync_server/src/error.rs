//! Error types for the sync server.

use outpost_core::{CoreError, SessionId};
use outpost_sync_protocol::{ErrorCode, ErrorResponse, ProtocolError, SessionPhase};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The session id is unknown.
    #[error("sync session {0} not found")]
    SessionNotFound(SessionId),

    /// The session saw no activity within the lapse timeout.
    #[error("sync session {0} lapsed")]
    SessionLapsed(SessionId),

    /// The session was marked errored.
    #[error("sync session {session} encountered an error: {reason}")]
    SessionErrored {
        /// Session.
        session: SessionId,
        /// Last recorded error.
        reason: String,
    },

    /// The session already completed.
    #[error("sync session {0} is already completed")]
    SessionCompleted(SessionId),

    /// The request does not fit the session's phase.
    #[error("{operation} is not allowed while session {session} is {phase}")]
    InvalidPhase {
        /// Session.
        session: SessionId,
        /// Current phase.
        phase: SessionPhase,
        /// Attempted operation.
        operation: &'static str,
    },

    /// Protocol version mismatch.
    #[error("protocol version mismatch: {0}")]
    ProtocolMismatch(String),

    /// Core failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Protocol failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if this is the node's fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::SessionNotFound(_)
                | ServerError::SessionLapsed(_)
                | ServerError::SessionErrored { .. }
                | ServerError::SessionCompleted(_)
                | ServerError::InvalidPhase { .. }
                | ServerError::ProtocolMismatch(_)
                | ServerError::Protocol(_)
        )
    }

    /// Wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            ServerError::SessionLapsed(_) | ServerError::SessionErrored { .. } => ErrorCode::SessionLapsed,
            ServerError::SessionCompleted(_) => ErrorCode::SessionClosed,
            ServerError::InvalidPhase { .. } => ErrorCode::InvalidPhase,
            ServerError::InvalidRequest(_) | ServerError::ProtocolMismatch(_) | ServerError::Protocol(_) => {
                ErrorCode::BadRequest
            }
            ServerError::Core(CoreError::Configuration(_)) => ErrorCode::Configuration,
            ServerError::Core(CoreError::UnknownType(_) | CoreError::NotSyncable(_)) => ErrorCode::BadRequest,
            ServerError::Core(_) | ServerError::Io(_) => ErrorCode::Internal,
        }
    }

    /// Converts into a wire error response.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.code(), self.to_string())
    }
}


