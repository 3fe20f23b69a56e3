//! Session-scoped snapshot staging.
//!
//! Each session owns its own staging area, so sessions for different nodes
//! never contend on snapshot state. Within a session there is at most one
//! entry per `(direction, record_type, record_id)`; staging the same record
//! again replaces the earlier entry.

use crate::error::{CoreError, CoreResult};
use crate::record::{Payload, SyncRecord};
use crate::types::{RecordId, RecordKey, RecordType, SessionId, Tick};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

/// Which way a staged entry travels relative to the staging node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotDirection {
    /// Leaving this node.
    Outgoing,
    /// Arriving at this node.
    Incoming,
}

/// One staged change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Record type.
    pub record_type: RecordType,
    /// Record id.
    pub record_id: RecordId,
    /// Whether the change is a delete.
    pub is_deleted: bool,
    /// Deletion time on the origin, in Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<u64>,
    /// Field values at snapshot time.
    pub data: Payload,
    /// The record's tick on the node that staged it.
    pub updated_at_sync_tick: Tick,
    /// Tick the receiver persisted this entry at, once applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at_sync_tick: Option<Tick>,
}

impl SnapshotEntry {
    /// Captures a record as a snapshot entry.
    pub fn from_record(record: &SyncRecord) -> Self {
        Self {
            record_type: record.record_type.clone(),
            record_id: record.id.clone(),
            is_deleted: record.is_deleted(),
            deleted_at: record.deleted_at,
            data: record.data.clone(),
            updated_at_sync_tick: record.updated_at_sync_tick,
            saved_at_sync_tick: None,
        }
    }

    /// Key of the staged record.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.record_type.clone(), self.record_id.clone())
    }
}

/// A page of staged entries for one type.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotPage {
    /// Entries in id order.
    pub entries: Vec<SnapshotEntry>,
    /// Cursor for the next page, `None` when the type is exhausted.
    pub next_cursor: Option<RecordId>,
}

type StageKey = (SnapshotDirection, RecordType, RecordId);

#[derive(Default)]
struct SessionStage {
    entries: RwLock<BTreeMap<StageKey, SnapshotEntry>>,
}

/// Staging areas for all open sessions.
#[derive(Default)]
pub struct SnapshotStore {
    sessions: RwLock<HashMap<SessionId, Arc<SessionStage>>>,
}

impl SnapshotStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens staging for a session. Opening twice is harmless.
    pub fn open(&self, session: SessionId) {
        self.sessions.write().entry(session).or_default();
    }

    /// Returns true if staging exists for the session.
    pub fn is_open(&self, session: SessionId) -> bool {
        self.sessions.read().contains_key(&session)
    }

    /// Number of sessions with open staging.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn stage(&self, session: SessionId) -> CoreResult<Arc<SessionStage>> {
        self.sessions
            .read()
            .get(&session)
            .cloned()
            .ok_or(CoreError::SessionNotStaged(session))
    }

    /// Stages entries, replacing any earlier entry for the same record.
    pub fn insert<I>(&self, session: SessionId, direction: SnapshotDirection, entries: I) -> CoreResult<usize>
    where
        I: IntoIterator<Item = SnapshotEntry>,
    {
        let stage = self.stage(session)?;
        let mut staged = stage.entries.write();
        let mut count = 0;
        for entry in entries {
            let key = (direction, entry.record_type.clone(), entry.record_id.clone());
            staged.insert(key, entry);
            count += 1;
        }
        Ok(count)
    }

    /// Total entries staged in one direction.
    pub fn count(&self, session: SessionId, direction: SnapshotDirection) -> CoreResult<usize> {
        let stage = self.stage(session)?;
        let staged = stage.entries.read();
        Ok(staged.keys().filter(|(d, _, _)| *d == direction).count())
    }

    /// Entries staged in one direction, per type.
    pub fn count_by_type(
        &self,
        session: SessionId,
        direction: SnapshotDirection,
    ) -> CoreResult<BTreeMap<RecordType, usize>> {
        let stage = self.stage(session)?;
        let staged = stage.entries.read();
        let mut counts = BTreeMap::new();
        for (d, record_type, _) in staged.keys() {
            if *d == direction {
                *counts.entry(record_type.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// Types with at least one staged entry in one direction.
    pub fn types(&self, session: SessionId, direction: SnapshotDirection) -> CoreResult<BTreeSet<RecordType>> {
        Ok(self.count_by_type(session, direction)?.into_keys().collect())
    }

    /// Reads up to `limit` entries of one type with ids after `after`.
    pub fn page(
        &self,
        session: SessionId,
        direction: SnapshotDirection,
        record_type: &RecordType,
        after: Option<&RecordId>,
        limit: usize,
    ) -> CoreResult<SnapshotPage> {
        let stage = self.stage(session)?;
        let staged = stage.entries.read();
        let start = match after {
            Some(id) => Bound::Excluded((direction, record_type.clone(), id.clone())),
            None => Bound::Included((direction, record_type.clone(), RecordId::from(""))),
        };
        let mut iter = staged
            .range((start, Bound::Unbounded))
            .take_while(|((d, t, _), _)| *d == direction && t == record_type)
            .map(|(_, entry)| entry);
        let entries: Vec<SnapshotEntry> = iter.by_ref().take(limit.max(1)).cloned().collect();
        let next_cursor = match (iter.next(), entries.last()) {
            (Some(_), Some(last)) => Some(last.record_id.clone()),
            _ => None,
        };
        Ok(SnapshotPage {
            entries,
            next_cursor,
        })
    }

    /// All entries of one type in one direction, in id order.
    pub fn entries_for_type(
        &self,
        session: SessionId,
        direction: SnapshotDirection,
        record_type: &RecordType,
    ) -> CoreResult<Vec<SnapshotEntry>> {
        let stage = self.stage(session)?;
        let staged = stage.entries.read();
        Ok(staged
            .iter()
            .filter(|((d, t, _), _)| *d == direction && t == record_type)
            .map(|(_, e)| e.clone())
            .collect())
    }

    /// Looks up the staged entry for one record.
    pub fn get(
        &self,
        session: SessionId,
        direction: SnapshotDirection,
        key: &RecordKey,
    ) -> CoreResult<Option<SnapshotEntry>> {
        let stage = self.stage(session)?;
        let staged = stage.entries.read();
        Ok(staged
            .get(&(direction, key.record_type.clone(), key.record_id.clone()))
            .cloned())
    }

    /// Records the tick every entry in `direction` was persisted at.
    pub fn mark_saved(&self, session: SessionId, direction: SnapshotDirection, tick: Tick) -> CoreResult<()> {
        let stage = self.stage(session)?;
        let mut staged = stage.entries.write();
        for ((d, _, _), entry) in staged.iter_mut() {
            if *d == direction {
                entry.saved_at_sync_tick = Some(tick);
            }
        }
        Ok(())
    }

    /// Drops outgoing entries that merely echo what this session pushed.
    ///
    /// An outgoing entry is an echo when the same record was received in
    /// this session and has not changed since it was persisted.
    pub fn remove_echoes(&self, session: SessionId) -> CoreResult<usize> {
        let stage = self.stage(session)?;
        let mut staged = stage.entries.write();
        let echoes: Vec<StageKey> = staged
            .iter()
            .filter(|((d, _, _), _)| *d == SnapshotDirection::Outgoing)
            .filter(|((_, t, id), outgoing)| {
                staged
                    .get(&(SnapshotDirection::Incoming, t.clone(), id.clone()))
                    .and_then(|incoming| incoming.saved_at_sync_tick)
                    == Some(outgoing.updated_at_sync_tick)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &echoes {
            staged.remove(key);
        }
        Ok(echoes.len())
    }

    /// Discards every entry in one direction.
    pub fn clear_direction(&self, session: SessionId, direction: SnapshotDirection) -> CoreResult<usize> {
        let stage = self.stage(session)?;
        let mut staged = stage.entries.write();
        let before = staged.len();
        staged.retain(|(d, _, _), _| *d != direction);
        Ok(before - staged.len())
    }

    /// Drops a session's staging. Returns false if none existed.
    pub fn drop_session(&self, session: SessionId) -> bool {
        self.sessions.write().remove(&session).is_some()
    }

    /// Drops all staging, e.g. leftovers from before a restart.
    pub fn drop_all(&self) -> usize {
        let mut sessions = self.sessions.write();
        let count = sessions.len();
        sessions.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(record_type: &str, id: &str, tick: Tick) -> SnapshotEntry {
        SnapshotEntry {
            record_type: record_type.into(),
            record_id: id.into(),
            is_deleted: false,
            deleted_at: None,
            data: Payload::new(),
            updated_at_sync_tick: tick,
            saved_at_sync_tick: None,
        }
    }

    #[test]
    fn at_most_one_entry_per_record() {
        let store = SnapshotStore::new();
        let session = SessionId::generate();
        store.open(session);
        store
            .insert(session, SnapshotDirection::Outgoing, vec![entry("p", "1", 1), entry("p", "1", 2)])
            .unwrap();
        store
            .insert(session, SnapshotDirection::Incoming, vec![entry("p", "1", 3)])
            .unwrap();
        assert_eq!(store.count(session, SnapshotDirection::Outgoing).unwrap(), 1);
        let staged = store
            .get(session, SnapshotDirection::Outgoing, &RecordKey::new("p", "1"))
            .unwrap()
            .unwrap();
        assert_eq!(staged.updated_at_sync_tick, 2);
    }

    #[test]
    fn sessions_are_isolated() {
        let store = SnapshotStore::new();
        let a = SessionId::generate();
        let b = SessionId::generate();
        store.open(a);
        store.open(b);
        store.insert(a, SnapshotDirection::Outgoing, vec![entry("p", "1", 1)]).unwrap();
        assert_eq!(store.count(b, SnapshotDirection::Outgoing).unwrap(), 0);
        assert!(store.drop_session(a));
        assert!(matches!(
            store.count(a, SnapshotDirection::Outgoing),
            Err(CoreError::SessionNotStaged(_))
        ));
        assert!(store.is_open(b));
    }

    #[test]
    fn paging_walks_one_type_by_cursor() {
        let store = SnapshotStore::new();
        let session = SessionId::generate();
        store.open(session);
        let entries = ["a", "b", "c", "d", "e"].iter().map(|id| entry("p", id, 1));
        store.insert(session, SnapshotDirection::Outgoing, entries).unwrap();
        store.insert(session, SnapshotDirection::Outgoing, vec![entry("q", "a", 1)]).unwrap();

        let p = RecordType::from("p");
        let first = store.page(session, SnapshotDirection::Outgoing, &p, None, 2).unwrap();
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.next_cursor.as_ref().map(RecordId::as_str), Some("b"));

        let second = store
            .page(session, SnapshotDirection::Outgoing, &p, first.next_cursor.as_ref(), 2)
            .unwrap();
        assert_eq!(second.next_cursor.as_ref().map(RecordId::as_str), Some("d"));

        let last = store
            .page(session, SnapshotDirection::Outgoing, &p, second.next_cursor.as_ref(), 2)
            .unwrap();
        assert_eq!(last.entries.len(), 1);
        assert_eq!(last.next_cursor, None);
    }

    #[test]
    fn exact_page_boundary_reports_no_more() {
        let store = SnapshotStore::new();
        let session = SessionId::generate();
        store.open(session);
        store
            .insert(session, SnapshotDirection::Outgoing, vec![entry("p", "a", 1), entry("p", "b", 1)])
            .unwrap();
        let page = store
            .page(session, SnapshotDirection::Outgoing, &"p".into(), None, 2)
            .unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn echoes_are_removed() {
        let store = SnapshotStore::new();
        let session = SessionId::generate();
        store.open(session);
        store
            .insert(session, SnapshotDirection::Incoming, vec![entry("p", "1", 4), entry("p", "2", 4)])
            .unwrap();
        store.mark_saved(session, SnapshotDirection::Incoming, 21).unwrap();
        // p/1 unchanged since persisted, p/2 changed again afterwards
        store
            .insert(session, SnapshotDirection::Outgoing, vec![entry("p", "1", 21), entry("p", "2", 23)])
            .unwrap();
        assert_eq!(store.remove_echoes(session).unwrap(), 1);
        let left = store
            .entries_for_type(session, SnapshotDirection::Outgoing, &"p".into())
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].record_id.as_str(), "2");
    }

    #[test]
    fn clear_direction_keeps_the_other() {
        let store = SnapshotStore::new();
        let session = SessionId::generate();
        store.open(session);
        store.insert(session, SnapshotDirection::Incoming, vec![entry("p", "1", 1)]).unwrap();
        store.insert(session, SnapshotDirection::Outgoing, vec![entry("p", "1", 1)]).unwrap();
        assert_eq!(store.clear_direction(session, SnapshotDirection::Incoming).unwrap(), 1);
        assert_eq!(store.count(session, SnapshotDirection::Outgoing).unwrap(), 1);
        assert_eq!(store.drop_all(), 1);
    }
}
