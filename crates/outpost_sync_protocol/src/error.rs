//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while framing or interpreting protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// Bytes could not be decoded into a message.
    #[error("decode error: {0}")]
    Decode(String),

    /// The peer speaks a different protocol version.
    #[error("unsupported protocol version {got} (expected {expected})")]
    UnsupportedVersion {
        /// Version this build speaks.
        expected: u16,
        /// Version the peer sent.
        got: u16,
    },

    /// A response did not match the request.
    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        /// Name of the expected message.
        expected: &'static str,
        /// Name of the received message.
        got: &'static str,
    },

    /// A phase transition that the state machine does not allow.
    #[error("invalid phase transition from {from} to {to}")]
    InvalidTransition {
        /// Current phase.
        from: &'static str,
        /// Requested phase.
        to: &'static str,
    },
}
