//! The conflict guard.
//!
//! Before a staged incoming set is applied, every record in it is checked
//! against the receiving store: if the local copy moved past the session's
//! baseline while the session was in flight, the whole session aborts and
//! is retried from the start. There is no per-record or per-field merge.

use crate::error::{CoreError, CoreResult};
use crate::snapshot::{SnapshotDirection, SnapshotEntry};
use crate::store::Database;
use crate::types::{RecordKey, SessionId, Tick};
use std::collections::BTreeSet;
use tracing::warn;

/// Session-granular conflict detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictGuard {
    baseline: Tick,
    exempt: BTreeSet<Tick>,
}

impl ConflictGuard {
    /// Flags local records whose tick is above `baseline`.
    pub fn new(baseline: Tick) -> Self {
        Self {
            baseline,
            exempt: BTreeSet::new(),
        }
    }

    /// Ignores records stamped with one of `ticks`, e.g. the requester's own
    /// previously persisted pushes.
    pub fn with_exempt_ticks(mut self, ticks: impl IntoIterator<Item = Tick>) -> Self {
        self.exempt.extend(ticks);
        self
    }

    /// The baseline tick.
    pub fn baseline(&self) -> Tick {
        self.baseline
    }

    /// Returns true if a local record stamped `tick` conflicts.
    pub fn is_conflicting(&self, tick: Tick) -> bool {
        tick > self.baseline && !self.exempt.contains(&tick)
    }

    /// Keys of entries whose local copy conflicts.
    pub fn find_conflicts<'e, I>(&self, db: &Database, entries: I) -> Vec<RecordKey>
    where
        I: IntoIterator<Item = &'e SnapshotEntry>,
    {
        entries
            .into_iter()
            .map(SnapshotEntry::key)
            .filter(|key| {
                db.get(key)
                    .is_some_and(|local| self.is_conflicting(local.updated_at_sync_tick))
            })
            .collect()
    }

    /// Keys of staged entries in `direction` whose local copy conflicts.
    pub fn find_staged_conflicts(
        &self,
        db: &Database,
        session: SessionId,
        direction: SnapshotDirection,
    ) -> CoreResult<Vec<RecordKey>> {
        let snapshots = db.snapshots();
        let mut conflicts = Vec::new();
        for record_type in snapshots.types(session, direction)? {
            let entries = snapshots.entries_for_type(session, direction, &record_type)?;
            conflicts.extend(self.find_conflicts(db, &entries));
        }
        Ok(conflicts)
    }

    /// Fails with [`CoreError::Conflict`] if any staged entry conflicts.
    pub fn ensure_no_conflicts(
        &self,
        db: &Database,
        session: SessionId,
        direction: SnapshotDirection,
    ) -> CoreResult<()> {
        let conflicts = self.find_staged_conflicts(db, session, direction)?;
        match conflicts.first() {
            None => Ok(()),
            Some(first) => {
                warn!(
                    session_id = %session,
                    count = conflicts.len(),
                    first = %first,
                    baseline = self.baseline,
                    "conflicting changes detected"
                );
                Err(CoreError::Conflict {
                    count: conflicts.len(),
                    first: first.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::record::payload_from_value;
    use crate::registry::{SyncDirection, TypeDefinition, TypeRegistry};
    use crate::stamper::{RecordDraft, WriteGateway};
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (Arc<Database>, WriteGateway) {
        let registry = TypeRegistry::builder()
            .register(TypeDefinition::new("patients", SyncDirection::Bidirectional))
            .build()
            .unwrap();
        let db = Arc::new(Database::new(Arc::new(registry)));
        let gateway = WriteGateway::new(Arc::clone(&db), Arc::new(EventBus::new()));
        (db, gateway)
    }

    fn staged(db: &Database, session: SessionId, ids: &[&str]) {
        db.snapshots().open(session);
        let entries = ids.iter().map(|id| SnapshotEntry {
            record_type: "patients".into(),
            record_id: (*id).into(),
            is_deleted: false,
            deleted_at: None,
            data: payload_from_value(json!({"name": "incoming"})).unwrap(),
            updated_at_sync_tick: 1,
            saved_at_sync_tick: None,
        });
        db.snapshots()
            .insert(session, SnapshotDirection::Incoming, entries)
            .unwrap();
    }

    fn write_at(gateway: &WriteGateway, id: &str, tick: Tick) {
        let data = payload_from_value(json!({"name": id})).unwrap();
        gateway
            .write(|w| w.save(RecordDraft::new("patients", id, data).with_tick(tick)))
            .unwrap();
    }

    #[test]
    fn records_changed_after_baseline_conflict() {
        let (db, gateway) = setup();
        write_at(&gateway, "old", 5);
        write_at(&gateway, "new", 12);
        let session = SessionId::generate();
        staged(&db, session, &["old", "new", "absent"]);

        let guard = ConflictGuard::new(10);
        let conflicts = guard
            .find_staged_conflicts(&db, session, SnapshotDirection::Incoming)
            .unwrap();
        assert_eq!(conflicts, vec![RecordKey::new("patients", "new")]);

        let err = guard
            .ensure_no_conflicts(&db, session, SnapshotDirection::Incoming)
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict { count: 1, .. }));
    }

    #[test]
    fn exempt_ticks_are_ignored() {
        let (db, gateway) = setup();
        write_at(&gateway, "mine", 12);
        let session = SessionId::generate();
        staged(&db, session, &["mine"]);
        let guard = ConflictGuard::new(10).with_exempt_ticks([12]);
        assert!(guard
            .ensure_no_conflicts(&db, session, SnapshotDirection::Incoming)
            .is_ok());
    }
}
