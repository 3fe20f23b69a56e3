//! Core identifier types for Outpost.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A logical clock value.
///
/// Ticks replace wall-clock time for change detection so that devices with
/// skewed clocks still agree on what changed since a baseline.
pub type Tick = i64;

/// Baseline used before a node has completed any push or pull.
///
/// Every stamped record carries a tick of at least zero, so a `since` of
/// `NEVER_SYNCED` selects everything.
pub const NEVER_SYNCED: Tick = -1;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an identifier from any string.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Name of a registered record type (a table, in relational terms).
    RecordType
);

string_id!(
    /// Identifier of a single record within its type.
    ///
    /// Ids are compared lexicographically; the chunk planner relies on that
    /// ordering when it bisects id ranges by prefix.
    RecordId
);

string_id!(
    /// Identity of a replicating node (facility server or device).
    NodeId
);

impl RecordId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Fully-qualified reference to one record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Type of the record.
    pub record_type: RecordType,
    /// Id of the record.
    pub record_id: RecordId,
}

impl RecordKey {
    /// Creates a new record key.
    pub fn new(record_type: impl Into<RecordType>, record_id: impl Into<RecordId>) -> Self {
        Self {
            record_type: record_type.into(),
            record_id: record_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.record_type, self.record_id)
    }
}

/// Identifier of one sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generates a new random session id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive tick window `(since, until]` used to select changed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickWindow {
    /// Exclusive lower bound.
    pub since: Tick,
    /// Inclusive upper bound, or `None` for unbounded.
    pub until: Option<Tick>,
}

impl TickWindow {
    /// Records changed strictly after `since`.
    pub fn after(since: Tick) -> Self {
        Self { since, until: None }
    }

    /// Records changed in `(since, until]`.
    pub fn between(since: Tick, until: Tick) -> Self {
        Self {
            since,
            until: Some(until),
        }
    }

    /// Returns true if `tick` falls inside the window.
    pub fn contains(&self, tick: Tick) -> bool {
        tick > self.since && self.until.map_or(true, |until| tick <= until)
    }
}


