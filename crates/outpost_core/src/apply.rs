//! The apply engine.
//!
//! Applies staged snapshot entries to the local store. Types are applied
//! strictly in dependency order inside one transaction, so an apply either
//! commits every type or leaves the store untouched. Within a type entries
//! are partitioned into creates, updates and deletes and applied in that
//! order. Applying an entry whose content is already present is a no-op, so
//! a retried session never double-applies.

use crate::error::{CoreError, CoreResult};
use crate::events::{ChangeEvent, ChangeKind, EventBus};
use crate::record::{changed_fields, now_millis, SyncRecord};
use crate::registry::DeletionMode;
use crate::snapshot::{SnapshotDirection, SnapshotEntry};
use crate::store::{Database, Transaction};
use crate::types::{RecordKey, RecordType, SessionId, Tick};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to do with the rest of a type's batch when one record is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    /// Reject the offending record, apply the rest.
    #[default]
    SkipInvalid,
    /// Reject the whole type's batch.
    RejectType,
}

/// Type-level integrity check supplied by the owner of a record type.
pub trait RecordValidator: Send + Sync {
    /// Returns a reason if the entry must be rejected.
    fn validate(&self, entry: &SnapshotEntry) -> Result<(), String>;
}

impl<F> RecordValidator for F
where
    F: Fn(&SnapshotEntry) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, entry: &SnapshotEntry) -> Result<(), String> {
        self(entry)
    }
}

/// Per-apply options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Tick stamped onto applied records.
    pub tick: Tick,
    /// Abort with a conflict if a local record about to be overwritten
    /// carries a tick above this value.
    pub conflict_above: Option<Tick>,
}

impl ApplyOptions {
    /// Stamps applied records with `tick`.
    pub fn at(tick: Tick) -> Self {
        Self {
            tick,
            conflict_above: None,
        }
    }

    /// Enables the in-transaction conflict check.
    pub fn with_conflict_guard(mut self, baseline: Tick) -> Self {
        self.conflict_above = Some(baseline);
        self
    }
}

/// A record the apply engine refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    /// The refused record.
    pub key: RecordKey,
    /// Why it was refused.
    pub reason: String,
}

/// Outcome of an apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Rows inserted.
    pub created: usize,
    /// Rows changed.
    pub updated: usize,
    /// Rows tombstoned or purged.
    pub deleted: usize,
    /// Entries that matched the local row already.
    pub unchanged: usize,
    /// Refused records.
    pub rejected: Vec<RejectedRecord>,
    /// Types whose whole batch was refused under [`BatchPolicy::RejectType`].
    pub rejected_types: Vec<RecordType>,
}

impl ApplyReport {
    /// Rows actually modified.
    pub fn changed(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

#[derive(Default)]
struct TypeOutcome {
    created: usize,
    updated: usize,
    deleted: usize,
    unchanged: usize,
    events: Vec<ChangeEvent>,
}

/// Applies staged entries to a store.
pub struct ApplyEngine {
    db: Arc<Database>,
    bus: Arc<EventBus>,
    policy: BatchPolicy,
    validators: HashMap<RecordType, Vec<Arc<dyn RecordValidator>>>,
}

impl ApplyEngine {
    /// Creates an engine applying into `db` and publishing on `bus`.
    pub fn new(db: Arc<Database>, bus: Arc<EventBus>) -> Self {
        Self {
            db,
            bus,
            policy: BatchPolicy::default(),
            validators: HashMap::new(),
        }
    }

    /// Sets the batch policy.
    pub fn with_policy(mut self, policy: BatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Adds a validator for one type.
    pub fn with_validator(mut self, record_type: impl Into<RecordType>, validator: Arc<dyn RecordValidator>) -> Self {
        self.validators
            .entry(record_type.into())
            .or_default()
            .push(validator);
        self
    }

    /// Applies every incoming entry staged for `session`.
    ///
    /// Staged data survives a failed apply, so calling this again resumes
    /// where the previous attempt stopped.
    pub fn apply_session(&self, session: SessionId, options: ApplyOptions) -> CoreResult<ApplyReport> {
        let snapshots = self.db.snapshots();
        let types = snapshots.types(session, SnapshotDirection::Incoming)?;
        let ordered = self.db.registry().sort_by_dependency(types)?;
        let mut batches = Vec::with_capacity(ordered.len());
        for record_type in ordered {
            let entries = snapshots.entries_for_type(session, SnapshotDirection::Incoming, &record_type)?;
            batches.push((record_type, entries));
        }
        self.apply_batches(batches, options)
    }

    /// Applies per-type batches, which must already be in dependency order.
    ///
    /// An out-of-order batch list fails with
    /// [`CoreError::OrderingViolation`] before anything is written. Any
    /// other error, a conflict included, rolls back every type.
    pub fn apply_batches(
        &self,
        batches: Vec<(RecordType, Vec<SnapshotEntry>)>,
        options: ApplyOptions,
    ) -> CoreResult<ApplyReport> {
        let types: Vec<RecordType> = batches.iter().map(|(t, _)| t.clone()).collect();
        self.db.registry().check_order(&types)?;

        let (report, events) = self.db.transaction(|txn| {
            let mut report = ApplyReport::default();
            let mut events = Vec::new();
            for (record_type, entries) in batches {
                self.apply_type(txn, &record_type, entries, options, &mut report, &mut events)?;
            }
            Ok((report, events))
        })?;
        self.bus.publish(&events);

        info!(
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            unchanged = report.unchanged,
            rejected = report.rejected.len(),
            tick = options.tick,
            "applied batch"
        );
        Ok(report)
    }

    fn apply_type(
        &self,
        txn: &mut Transaction<'_>,
        record_type: &RecordType,
        entries: Vec<SnapshotEntry>,
        options: ApplyOptions,
        report: &mut ApplyReport,
        events: &mut Vec<ChangeEvent>,
    ) -> CoreResult<()> {
        let deletion = self.db.registry().definition(record_type)?.deletion;
        let validators = self.validators.get(record_type).map(Vec::as_slice).unwrap_or(&[]);
        let savepoint = txn.savepoint();
        let mut outcome = TypeOutcome::default();
        let mut rejected: Vec<RejectedRecord> = Vec::new();

        let (mut creates, mut updates, mut deletes) = (Vec::new(), Vec::new(), Vec::new());
        for entry in entries {
            if &entry.record_type != record_type {
                rejected.push(RejectedRecord {
                    key: entry.key(),
                    reason: format!("staged under {record_type}"),
                });
            } else if entry.is_deleted {
                deletes.push(entry);
            } else if txn.get(&entry.key()).is_some_and(|r| !r.is_deleted()) {
                updates.push(entry);
            } else {
                creates.push(entry);
            }
        }

        for entry in creates.into_iter().chain(updates).chain(deletes) {
            if let Some(reason) = validators.iter().find_map(|v| v.validate(&entry).err()) {
                rejected.push(RejectedRecord {
                    key: entry.key(),
                    reason,
                });
                continue;
            }
            match apply_entry(txn, entry, deletion, options, &mut outcome) {
                Ok(()) => {}
                Err(CoreError::Validation { key, reason }) => rejected.push(RejectedRecord { key, reason }),
                Err(err @ CoreError::ForeignKeyViolation { .. }) => {
                    if let CoreError::ForeignKeyViolation { key, .. } = &err {
                        rejected.push(RejectedRecord {
                            key: key.clone(),
                            reason: err.to_string(),
                        });
                    }
                }
                Err(err) => return Err(err),
            }
        }

        for r in &rejected {
            warn!(record = %r.key, reason = %r.reason, "rejected incoming record");
        }
        if self.policy == BatchPolicy::RejectType && !rejected.is_empty() {
            txn.rollback_to(savepoint);
            warn!(record_type = %record_type, "rejected whole batch for type");
            report.rejected_types.push(record_type.clone());
            report.rejected.extend(rejected);
            return Ok(());
        }

        debug!(
            record_type = %record_type,
            created = outcome.created,
            updated = outcome.updated,
            deleted = outcome.deleted,
            unchanged = outcome.unchanged,
            "applied type"
        );
        report.created += outcome.created;
        report.updated += outcome.updated;
        report.deleted += outcome.deleted;
        report.unchanged += outcome.unchanged;
        report.rejected.extend(rejected);
        events.extend(outcome.events);
        Ok(())
    }
}

fn apply_entry(
    txn: &mut Transaction<'_>,
    entry: SnapshotEntry,
    deletion: DeletionMode,
    options: ApplyOptions,
    outcome: &mut TypeOutcome,
) -> CoreResult<()> {
    let key = entry.key();
    let existing = txn.get(&key).cloned();
    if let (Some(limit), Some(prev)) = (options.conflict_above, &existing) {
        if prev.updated_at_sync_tick > limit {
            return Err(CoreError::Conflict { count: 1, first: key });
        }
    }
    let tick = existing
        .as_ref()
        .map_or(options.tick, |prev| options.tick.max(prev.updated_at_sync_tick));

    if entry.is_deleted {
        match (deletion, &existing) {
            (DeletionMode::Purge, None) => outcome.unchanged += 1,
            (DeletionMode::Purge, Some(_)) => {
                txn.purge(&key);
                outcome.deleted += 1;
                outcome.events.push(event(&key, ChangeKind::Delete, vec!["deleted_at".into()], tick));
            }
            (DeletionMode::Tombstone, Some(prev)) if prev.is_deleted() => outcome.unchanged += 1,
            (DeletionMode::Tombstone, _) => {
                txn.put(SyncRecord {
                    id: entry.record_id,
                    record_type: entry.record_type,
                    data: entry.data,
                    updated_at_sync_tick: tick,
                    deleted_at: Some(entry.deleted_at.unwrap_or_else(now_millis)),
                })?;
                outcome.deleted += 1;
                outcome.events.push(event(&key, ChangeKind::Delete, vec!["deleted_at".into()], tick));
            }
        }
        return Ok(());
    }

    let (kind, fields) = match &existing {
        Some(prev) if !prev.is_deleted() && prev.data == entry.data => {
            outcome.unchanged += 1;
            return Ok(());
        }
        Some(prev) => {
            let mut fields = changed_fields(&prev.data, &entry.data);
            if prev.is_deleted() {
                fields.push("deleted_at".into());
            }
            (ChangeKind::Update, fields)
        }
        None => {
            let mut fields: Vec<String> = entry.data.keys().cloned().collect();
            fields.sort();
            (ChangeKind::Insert, fields)
        }
    };
    txn.put(SyncRecord {
        id: entry.record_id,
        record_type: entry.record_type,
        data: entry.data,
        updated_at_sync_tick: tick,
        deleted_at: None,
    })?;
    match kind {
        ChangeKind::Insert => outcome.created += 1,
        _ => outcome.updated += 1,
    }
    outcome.events.push(event(&key, kind, fields, tick));
    Ok(())
}

fn event(key: &RecordKey, kind: ChangeKind, changed_fields: Vec<String>, tick: Tick) -> ChangeEvent {
    ChangeEvent {
        record_type: key.record_type.clone(),
        kind,
        changed_fields,
        record_id: key.record_id.clone(),
        tick,
    }
}


