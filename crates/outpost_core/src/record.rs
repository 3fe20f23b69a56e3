//! Syncable records.

use crate::types::{RecordId, RecordKey, RecordType, Tick};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Record payload: a JSON object keyed by field name.
pub type Payload = Map<String, Value>;

/// A row belonging to a registered record type.
///
/// `updated_at_sync_tick` is non-decreasing for the lifetime of the record
/// and is only ever set through the write gateway or the apply engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Record id.
    pub id: RecordId,
    /// Record type.
    pub record_type: RecordType,
    /// Field values.
    pub data: Payload,
    /// Tick of the generation that last changed this record.
    pub updated_at_sync_tick: Tick,
    /// Tombstone marker (unix millis), `None` while the record is live.
    pub deleted_at: Option<u64>,
}

impl SyncRecord {
    /// Returns the fully-qualified key of this record.
    pub fn key(&self) -> RecordKey {
        RecordKey {
            record_type: self.record_type.clone(),
            record_id: self.id.clone(),
        }
    }

    /// Returns true if the record is tombstoned.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Reads a field as a string id reference.
    pub fn field_str(&self, field: &str) -> Option<&str> {
        field_str(&self.data, field)
    }
}

/// Reads `field` from a payload if it holds a non-empty string.
pub fn field_str<'a>(data: &'a Payload, field: &str) -> Option<&'a str> {
    match data.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
        _ => None,
    }
}

/// Names of the fields whose values differ between two payloads.
pub fn changed_fields(before: &Payload, after: &Payload) -> Vec<String> {
    let mut changed: Vec<String> = after
        .iter()
        .filter(|(name, value)| before.get(name.as_str()) != Some(value))
        .map(|(name, _)| name.clone())
        .collect();
    changed.extend(
        before
            .keys()
            .filter(|name| !after.contains_key(name.as_str()))
            .cloned(),
    );
    changed.sort();
    changed
}

/// Current wall-clock time in unix millis, used for tombstones only.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Builds a payload from a JSON value, rejecting anything but objects.
pub fn payload_from_value(value: Value) -> Option<Payload> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}


