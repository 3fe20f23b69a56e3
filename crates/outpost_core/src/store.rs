//! In-memory record store with serializable transactions.
//!
//! The store keeps one ordered table per record type plus the node's fact
//! table. A transaction holds the store's write lock for its whole duration
//! and buffers writes in an overlay, so readers never observe a partially
//! applied batch and a failed closure leaves no trace.
//!
//! Record writes are crate-private: outside code goes through
//! [`WriteGateway`](crate::WriteGateway) (which stamps ticks) or the
//! [`ApplyEngine`](crate::ApplyEngine) (which stamps on behalf of sync).

use crate::chunk::{ChunkSource, IdRange, IdStats, PrefixBucket};
use crate::error::{CoreError, CoreResult};
use crate::record::{field_str, SyncRecord};
use crate::registry::TypeRegistry;
use crate::snapshot::SnapshotStore;
use crate::types::{RecordId, RecordKey, RecordType, Tick, TickWindow, NEVER_SYNCED};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

type Table = BTreeMap<RecordId, SyncRecord>;

#[derive(Debug, Default)]
struct StoreState {
    tables: HashMap<RecordType, Table>,
    facts: BTreeMap<String, String>,
    max_written_tick: Option<Tick>,
}

/// A node's local replica.
pub struct Database {
    registry: Arc<TypeRegistry>,
    state: RwLock<StoreState>,
    snapshots: SnapshotStore,
}

impl Database {
    /// Creates an empty store for the given registry.
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            state: RwLock::new(StoreState::default()),
            snapshots: SnapshotStore::new(),
        }
    }

    /// Returns the type registry.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Returns the session snapshot staging area.
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Executes `f` inside a transaction.
    ///
    /// Writes become visible atomically when `f` returns `Ok`; on `Err`
    /// nothing is applied.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> CoreResult<T>,
    {
        let mut state = self.state.write();
        let mut txn = Transaction {
            base: &*state,
            registry: &self.registry,
            writes: BTreeMap::new(),
            facts: BTreeMap::new(),
            max_written_tick: state.max_written_tick,
        };
        let value = f(&mut txn)?;
        let Transaction {
            writes,
            facts,
            max_written_tick,
            ..
        } = txn;

        for (key, write) in writes {
            let table = state.tables.entry(key.record_type).or_default();
            match write {
                Some(record) => {
                    table.insert(key.record_id, record);
                }
                None => {
                    table.remove(&key.record_id);
                }
            }
        }
        state.facts.extend(facts);
        state.max_written_tick = max_written_tick;
        Ok(value)
    }

    /// Reads one record.
    pub fn get(&self, key: &RecordKey) -> Option<SyncRecord> {
        let state = self.state.read();
        state
            .tables
            .get(&key.record_type)
            .and_then(|t| t.get(&key.record_id))
            .cloned()
    }

    /// Reads a fact value.
    pub fn fact(&self, key: &str) -> Option<String> {
        self.state.read().facts.get(key).cloned()
    }

    /// Number of rows (tombstones included) of a type.
    pub fn count(&self, record_type: &RecordType) -> usize {
        self.state
            .read()
            .tables
            .get(record_type)
            .map_or(0, BTreeMap::len)
    }

    /// All rows of a type in id order.
    pub fn records(&self, record_type: &RecordType) -> Vec<SyncRecord> {
        self.state
            .read()
            .tables
            .get(record_type)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Rows of a type whose tick falls in `window`, tombstones included.
    pub fn changed_in(&self, record_type: &RecordType, window: TickWindow) -> Vec<SyncRecord> {
        self.read_range(record_type, window, &IdRange::all())
    }

    /// Rows of a type in an id range whose tick falls in `window`.
    pub fn read_range(
        &self,
        record_type: &RecordType,
        window: TickWindow,
        range: &IdRange,
    ) -> Vec<SyncRecord> {
        let state = self.state.read();
        let Some(table) = state.tables.get(record_type) else {
            return Vec::new();
        };
        table
            .range(range.bounds())
            .map(|(_, r)| r)
            .filter(|r| window.contains(r.updated_at_sync_tick))
            .cloned()
            .collect()
    }

    /// Highest tick ever written to this store.
    pub fn max_written_tick(&self) -> Tick {
        self.state.read().max_written_tick.unwrap_or(NEVER_SYNCED)
    }
}

impl ChunkSource for Database {
    fn id_stats(&self, record_type: &RecordType, window: TickWindow) -> CoreResult<IdStats> {
        let state = self.state.read();
        let mut stats = IdStats::default();
        if let Some(table) = state.tables.get(record_type) {
            for (id, record) in table {
                if window.contains(record.updated_at_sync_tick) {
                    stats.observe(id);
                }
            }
        }
        Ok(stats)
    }

    fn prefix_buckets(
        &self,
        record_type: &RecordType,
        window: TickWindow,
        prefix: &str,
        len: usize,
    ) -> CoreResult<Vec<PrefixBucket>> {
        let state = self.state.read();
        let Some(table) = state.tables.get(record_type) else {
            return Ok(Vec::new());
        };
        let start = Bound::Included(RecordId::from(prefix));
        let mut buckets: Vec<PrefixBucket> = Vec::new();
        for (id, record) in table.range((start, Bound::Unbounded)) {
            if !id.as_str().starts_with(prefix) {
                break;
            }
            if !window.contains(record.updated_at_sync_tick) {
                continue;
            }
            let key: String = id.as_str().chars().take(len).collect();
            match buckets.last_mut() {
                Some(bucket) if bucket.prefix == key => bucket.count += 1,
                _ => buckets.push(PrefixBucket {
                    prefix: key,
                    count: 1,
                    first_id: id.clone(),
                }),
            }
        }
        Ok(buckets)
    }
}

/// Overlay state captured by [`Transaction::savepoint`].
pub(crate) struct Savepoint {
    writes: BTreeMap<RecordKey, Option<SyncRecord>>,
    max_written_tick: Option<Tick>,
}

/// Buffered view over the store used inside [`Database::transaction`].
pub struct Transaction<'a> {
    base: &'a StoreState,
    registry: &'a TypeRegistry,
    writes: BTreeMap<RecordKey, Option<SyncRecord>>,
    facts: BTreeMap<String, String>,
    max_written_tick: Option<Tick>,
}

impl<'a> Transaction<'a> {
    /// Reads a record, seeing this transaction's own writes.
    pub fn get(&self, key: &RecordKey) -> Option<&SyncRecord> {
        match self.writes.get(key) {
            Some(write) => write.as_ref(),
            None => self
                .base
                .tables
                .get(&key.record_type)
                .and_then(|t| t.get(&key.record_id)),
        }
    }

    /// Returns true if a row (live or tombstoned) exists.
    pub fn exists(&self, key: &RecordKey) -> bool {
        self.get(key).is_some()
    }

    /// Reads a fact, seeing this transaction's own writes.
    pub fn fact(&self, key: &str) -> Option<&str> {
        self.facts
            .get(key)
            .or_else(|| self.base.facts.get(key))
            .map(String::as_str)
    }

    /// Highest tick written so far, including this transaction.
    pub fn max_written_tick(&self) -> Tick {
        self.max_written_tick.unwrap_or(NEVER_SYNCED)
    }

    pub(crate) fn set_fact(&mut self, key: &str, value: String) {
        self.facts.insert(key.to_owned(), value);
    }

    /// Verifies that every declared reference on a live record resolves.
    pub fn check_references(&self, record: &SyncRecord) -> CoreResult<()> {
        if record.is_deleted() {
            return Ok(());
        }
        let def = self.registry.definition(&record.record_type)?;
        for rel in &def.relationships {
            match field_str(&record.data, &rel.field) {
                Some(target_id) => {
                    let target = RecordKey::new(rel.target.clone(), target_id);
                    if !self.exists(&target) {
                        return Err(CoreError::ForeignKeyViolation {
                            key: record.key(),
                            field: rel.field.clone(),
                            target,
                        });
                    }
                }
                None if !rel.optional => {
                    return Err(CoreError::validation(
                        record.key(),
                        format!("required reference {} is missing", rel.field),
                    ));
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Writes a record after checking its references.
    pub(crate) fn put(&mut self, record: SyncRecord) -> CoreResult<()> {
        self.check_references(&record)?;
        self.put_unchecked(record);
        Ok(())
    }

    pub(crate) fn put_unchecked(&mut self, record: SyncRecord) {
        let tick = record.updated_at_sync_tick;
        self.max_written_tick = Some(self.max_written_tick.map_or(tick, |m| m.max(tick)));
        self.writes.insert(record.key(), Some(record));
    }

    /// Captures the overlay so later writes can be discarded with
    /// [`rollback_to`](Self::rollback_to).
    pub(crate) fn savepoint(&self) -> Savepoint {
        Savepoint {
            writes: self.writes.clone(),
            max_written_tick: self.max_written_tick,
        }
    }

    /// Discards every write made since `savepoint`. Fact writes are kept.
    pub(crate) fn rollback_to(&mut self, savepoint: Savepoint) {
        self.writes = savepoint.writes;
        self.max_written_tick = savepoint.max_written_tick;
    }

    /// Physically removes a row.
    pub(crate) fn purge(&mut self, key: &RecordKey) {
        self.writes.insert(key.clone(), None);
    }

    /// Moves a record's tick forward to `tick`. Returns false if the record
    /// is missing or already at or past `tick`.
    pub(crate) fn restamp(&mut self, key: &RecordKey, tick: Tick) -> bool {
        let Some(current) = self.get(key) else {
            return false;
        };
        if current.updated_at_sync_tick >= tick {
            return false;
        }
        let mut record = current.clone();
        record.updated_at_sync_tick = tick;
        self.put_unchecked(record);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Payload;
    use crate::registry::{SyncDirection, TypeDefinition};
    use serde_json::json;

    fn registry() -> Arc<TypeRegistry> {
        Arc::new(
            TypeRegistry::builder()
                .register(TypeDefinition::new("patients", SyncDirection::Bidirectional))
                .register(
                    TypeDefinition::new("encounters", SyncDirection::Bidirectional)
                        .with_reference("patient_id", "patients"),
                )
                .build()
                .unwrap(),
        )
    }

    fn record(record_type: &str, id: &str, tick: Tick, data: serde_json::Value) -> SyncRecord {
        let data: Payload = crate::record::payload_from_value(data).unwrap();
        SyncRecord {
            id: id.into(),
            record_type: record_type.into(),
            data,
            updated_at_sync_tick: tick,
            deleted_at: None,
        }
    }

    #[test]
    fn transaction_commits_atomically() {
        let db = Database::new(registry());
        db.transaction(|txn| {
            txn.put(record("patients", "p1", 1, json!({})))?;
            txn.put(record("encounters", "e1", 1, json!({"patient_id": "p1"})))?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.count(&"patients".into()), 1);
        assert_eq!(db.count(&"encounters".into()), 1);
        assert_eq!(db.max_written_tick(), 1);
    }

    #[test]
    fn failed_transaction_leaves_no_trace() {
        let db = Database::new(registry());
        let result = db.transaction(|txn| {
            txn.put(record("patients", "p1", 1, json!({})))?;
            txn.set_fact("x", "1".into());
            txn.put(record("encounters", "e1", 1, json!({"patient_id": "nope"})))
        });
        assert!(matches!(result, Err(CoreError::ForeignKeyViolation { .. })));
        assert_eq!(db.count(&"patients".into()), 0);
        assert_eq!(db.fact("x"), None);
        assert_eq!(db.max_written_tick(), NEVER_SYNCED);
    }

    #[test]
    fn missing_required_reference_is_a_validation_error() {
        let db = Database::new(registry());
        let err = db
            .transaction(|txn| txn.put(record("encounters", "e1", 1, json!({}))))
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[test]
    fn rollback_to_savepoint_discards_later_writes() {
        let db = Database::new(registry());
        db.transaction(|txn| {
            txn.put(record("patients", "p1", 1, json!({})))?;
            let savepoint = txn.savepoint();
            txn.put(record("patients", "p2", 4, json!({})))?;
            txn.purge(&RecordKey::new("patients", "p1"));
            txn.rollback_to(savepoint);
            assert!(txn.exists(&RecordKey::new("patients", "p1")));
            assert!(!txn.exists(&RecordKey::new("patients", "p2")));
            Ok(())
        })
        .unwrap();
        assert_eq!(db.count(&"patients".into()), 1);
        assert_eq!(db.max_written_tick(), 1);
    }

    #[test]
    fn restamp_only_moves_forward() {
        let db = Database::new(registry());
        db.transaction(|txn| txn.put(record("patients", "p1", 5, json!({}))))
            .unwrap();
        let key = RecordKey::new("patients", "p1");
        let moved = db.transaction(|txn| Ok(txn.restamp(&key, 3))).unwrap();
        assert!(!moved);
        let moved = db.transaction(|txn| Ok(txn.restamp(&key, 9))).unwrap();
        assert!(moved);
        assert_eq!(db.get(&key).unwrap().updated_at_sync_tick, 9);
    }

    #[test]
    fn read_range_filters_by_window_and_ids() {
        let db = Database::new(registry());
        db.transaction(|txn| {
            for (id, tick) in [("a", 1), ("b", 5), ("c", 7), ("d", 9)] {
                txn.put(record("patients", id, tick, json!({})))?;
            }
            Ok(())
        })
        .unwrap();
        let range = IdRange::new("b", Some("d".into()));
        let rows = db.read_range(&"patients".into(), TickWindow::after(4), &range);
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let changed = db.changed_in(&"patients".into(), TickWindow::between(1, 7));
        assert_eq!(changed.len(), 2);
    }

    #[test]
    fn prefix_buckets_group_contiguous_ids() {
        let db = Database::new(registry());
        db.transaction(|txn| {
            for id in ["a", "ab", "abc", "ac", "b1"] {
                txn.put(record("patients", id, 1, json!({})))?;
            }
            Ok(())
        })
        .unwrap();
        let buckets = db
            .prefix_buckets(&"patients".into(), TickWindow::after(0), "a", 2)
            .unwrap();
        let summary: Vec<_> = buckets
            .iter()
            .map(|b| (b.prefix.as_str(), b.count, b.first_id.as_str()))
            .collect();
        assert_eq!(summary, vec![("a", 1, "a"), ("ab", 2, "ab"), ("ac", 1, "ac")]);
    }
}
