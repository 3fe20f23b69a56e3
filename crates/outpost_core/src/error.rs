//! Error types for Outpost core.

use crate::types::{RecordKey, RecordType, SessionId};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Outpost core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Records in the incoming set were modified on the counterpart during the session.
    #[error("sync conflict: {count} record(s) changed concurrently, first {first}")]
    Conflict {
        /// Number of conflicting records.
        count: usize,
        /// The first conflicting record (for diagnostics).
        first: RecordKey,
    },

    /// A staged entry failed type-level integrity checks.
    #[error("validation failed for {key}: {reason}")]
    Validation {
        /// The offending record.
        key: RecordKey,
        /// Why the record was rejected.
        reason: String,
    },

    /// Invalid or missing configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Types were applied out of dependency order.
    #[error("ordering violation: {record_type} applied after {after}")]
    OrderingViolation {
        /// The type that arrived too late (or too early).
        record_type: RecordType,
        /// The type it was applied after.
        after: RecordType,
    },

    /// A record references a row that does not exist.
    #[error("foreign key violation: {key}.{field} references missing {target}")]
    ForeignKeyViolation {
        /// The referencing record.
        key: RecordKey,
        /// The referencing field.
        field: String,
        /// The missing target.
        target: RecordKey,
    },

    /// The record type is not registered.
    #[error("unknown record type: {0}")]
    UnknownType(RecordType),

    /// The record type is registered but must not be written through this path.
    #[error("record type {0} is not syncable")]
    NotSyncable(RecordType),

    /// Record not found.
    #[error("record not found: {0}")]
    RecordNotFound(RecordKey),

    /// Record already exists.
    #[error("record already exists: {0}")]
    RecordExists(RecordKey),

    /// A persisted fact could not be parsed.
    #[error("invalid fact {key}: {value:?}")]
    InvalidFact {
        /// Fact name.
        key: String,
        /// Raw stored value.
        value: String,
    },

    /// Snapshot staging for the session does not exist.
    #[error("no staged snapshot for session {0}")]
    SessionNotStaged(SessionId),

    /// Payload is not a JSON object or could not be (de)serialized.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates a validation error.
    pub fn validation(key: RecordKey, reason: impl Into<String>) -> Self {
        Self::Validation {
            key,
            reason: reason.into(),
        }
    }

    /// Returns true if the whole session should be retried from the start.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CoreError::Conflict { .. })
    }

    /// Returns true for defects that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::Configuration(_)
                | CoreError::OrderingViolation { .. }
                | CoreError::Internal(_)
        )
    }
}


