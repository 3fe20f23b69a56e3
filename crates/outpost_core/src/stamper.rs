//! The write gateway: the only public write path for syncable records.
//!
//! Every create, update and delete passes through a [`StampedWriter`], which
//! stamps `updated_at_sync_tick` with the clock's current tick (unless the
//! caller supplies an explicit tick) and queues a change event. Events are
//! published on the bus after the transaction commits.

use crate::clock::txn_current_tick;
use crate::error::{CoreError, CoreResult};
use crate::events::{ChangeEvent, ChangeKind, EventBus};
use crate::record::{changed_fields, now_millis, Payload, SyncRecord};
use crate::store::{Database, Transaction};
use crate::types::{RecordId, RecordKey, RecordType, Tick};
use std::sync::Arc;

/// A record as supplied by a caller of [`StampedWriter::save`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDraft {
    /// Record type.
    pub record_type: RecordType,
    /// Record id.
    pub id: RecordId,
    /// Field values.
    pub data: Payload,
    /// Explicit tick; `None` stamps the current tick.
    pub updated_at_sync_tick: Option<Tick>,
}

impl RecordDraft {
    /// Creates a draft with no explicit tick.
    pub fn new(record_type: impl Into<RecordType>, id: impl Into<RecordId>, data: Payload) -> Self {
        Self {
            record_type: record_type.into(),
            id: id.into(),
            data,
            updated_at_sync_tick: None,
        }
    }

    /// Overrides the stamped tick.
    pub fn with_tick(mut self, tick: Tick) -> Self {
        self.updated_at_sync_tick = Some(tick);
        self
    }
}

/// Tick-stamping write path.
#[derive(Clone)]
pub struct WriteGateway {
    db: Arc<Database>,
    bus: Arc<EventBus>,
}

impl WriteGateway {
    /// Creates a gateway writing into `db` and publishing on `bus`.
    pub fn new(db: Arc<Database>, bus: Arc<EventBus>) -> Self {
        Self { db, bus }
    }

    /// The underlying database (read access).
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Runs `f` in one transaction; all writes share the current tick.
    pub fn write<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut StampedWriter<'_, '_>) -> CoreResult<T>,
    {
        let (value, events) = self.db.transaction(|txn| {
            let tick = txn_current_tick(txn)?;
            let mut writer = StampedWriter {
                txn,
                tick,
                events: Vec::new(),
            };
            let value = f(&mut writer)?;
            Ok((value, writer.events))
        })?;
        self.bus.publish(&events);
        Ok(value)
    }

    /// Inserts a record with a generated id.
    pub fn create(&self, record_type: impl Into<RecordType>, data: Payload) -> CoreResult<RecordId> {
        let record_type = record_type.into();
        let id = RecordId::generate();
        self.write(|w| w.insert(record_type, id.clone(), data))?;
        Ok(id)
    }

    /// Inserts a record with a known id.
    pub fn insert(
        &self,
        record_type: impl Into<RecordType>,
        id: impl Into<RecordId>,
        data: Payload,
    ) -> CoreResult<()> {
        let (record_type, id) = (record_type.into(), id.into());
        self.write(|w| w.insert(record_type, id, data))
    }

    /// Replaces a record's payload.
    pub fn update(
        &self,
        record_type: impl Into<RecordType>,
        id: impl Into<RecordId>,
        data: Payload,
    ) -> CoreResult<()> {
        let (record_type, id) = (record_type.into(), id.into());
        self.write(|w| w.update(record_type, id, data))
    }

    /// Tombstones a record.
    pub fn delete(&self, record_type: impl Into<RecordType>, id: impl Into<RecordId>) -> CoreResult<()> {
        let (record_type, id) = (record_type.into(), id.into());
        self.write(|w| w.delete(record_type, id))
    }
}

/// Writer handed to [`WriteGateway::write`] closures.
pub struct StampedWriter<'t, 'a> {
    txn: &'t mut Transaction<'a>,
    tick: Tick,
    events: Vec<ChangeEvent>,
}

impl<'t, 'a> StampedWriter<'t, 'a> {
    /// The tick stamped onto writes in this transaction.
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Reads a record, seeing earlier writes from this transaction.
    pub fn get(&self, key: &RecordKey) -> Option<&SyncRecord> {
        self.txn.get(key)
    }

    /// Inserts a new record. Fails if a row with this id already exists.
    pub fn insert(&mut self, record_type: RecordType, id: RecordId, data: Payload) -> CoreResult<()> {
        self.save_inner(RecordDraft::new(record_type, id, data), Some(false))
    }

    /// Replaces the payload of an existing record. Unchanged payloads are a no-op.
    pub fn update(&mut self, record_type: RecordType, id: RecordId, data: Payload) -> CoreResult<()> {
        self.save_inner(RecordDraft::new(record_type, id, data), Some(true))
    }

    /// Inserts or updates, honouring an explicit tick if the draft carries one.
    pub fn save(&mut self, draft: RecordDraft) -> CoreResult<()> {
        self.save_inner(draft, None)
    }

    /// Tombstones a record. Deleting an already-deleted record is a no-op.
    pub fn delete(&mut self, record_type: RecordType, id: RecordId) -> CoreResult<()> {
        let key = RecordKey::new(record_type, id);
        let existing = self
            .txn
            .get(&key)
            .cloned()
            .ok_or_else(|| CoreError::RecordNotFound(key.clone()))?;
        if existing.is_deleted() {
            return Ok(());
        }
        let record = SyncRecord {
            updated_at_sync_tick: self.tick.max(existing.updated_at_sync_tick),
            deleted_at: Some(now_millis()),
            ..existing
        };
        self.txn.put(record)?;
        self.events.push(ChangeEvent {
            record_type: key.record_type,
            kind: ChangeKind::Delete,
            changed_fields: vec!["deleted_at".into()],
            record_id: key.record_id,
            tick: self.tick,
        });
        Ok(())
    }

    fn save_inner(&mut self, draft: RecordDraft, must_exist: Option<bool>) -> CoreResult<()> {
        let key = RecordKey::new(draft.record_type.clone(), draft.id.clone());
        let existing = self.txn.get(&key).cloned();
        match (must_exist, &existing) {
            (Some(false), Some(_)) => return Err(CoreError::RecordExists(key)),
            (Some(true), None) => return Err(CoreError::RecordNotFound(key)),
            _ => {}
        }

        let tick = match (draft.updated_at_sync_tick, &existing) {
            (Some(explicit), Some(prev)) if explicit != prev.updated_at_sync_tick => explicit,
            (Some(explicit), None) => explicit,
            _ => self.tick,
        };
        if let Some(prev) = &existing {
            if tick < prev.updated_at_sync_tick {
                return Err(CoreError::validation(
                    key,
                    format!(
                        "tick {} would move backwards from {}",
                        tick, prev.updated_at_sync_tick
                    ),
                ));
            }
        }

        let (kind, fields) = match &existing {
            None => (ChangeKind::Insert, {
                let mut all: Vec<String> = draft.data.keys().cloned().collect();
                all.sort();
                all
            }),
            Some(prev) => {
                let mut fields = changed_fields(&prev.data, &draft.data);
                if prev.is_deleted() {
                    fields.push("deleted_at".into());
                }
                if fields.is_empty() {
                    return Ok(());
                }
                (ChangeKind::Update, fields)
            }
        };

        self.txn.put(SyncRecord {
            id: draft.id,
            record_type: draft.record_type,
            data: draft.data,
            updated_at_sync_tick: tick,
            deleted_at: None,
        })?;
        self.events.push(ChangeEvent {
            record_type: key.record_type,
            kind,
            changed_fields: fields,
            record_id: key.record_id,
            tick,
        });
        Ok(())
    }
}


