//! Snapshot builders.
//!
//! [`SnapshotBuilder::stage_push`] runs on the requesting node and stages the
//! node's own changes since its last push. [`SnapshotBuilder::stage_pull`]
//! runs on the authority and stages everything a node is entitled to since
//! its last pull. Both read through the chunk planner so no single read
//! materializes more than `max_chunk_size` rows; pull chunks are read in
//! parallel, bounded by `read_concurrency`.

use crate::chunk::{ChunkPlan, ChunkPlanner};
use crate::config::CoreConfig;
use crate::error::CoreResult;
use crate::record::SyncRecord;
use crate::scope::ScopeMaintainer;
use crate::snapshot::{SnapshotDirection, SnapshotEntry};
use crate::store::Database;
use crate::types::{RecordType, SessionId, Tick, TickWindow, NEVER_SYNCED};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

/// What a node asks to pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullSpec {
    /// Exclusive lower bound (the node's last pull).
    pub since: Tick,
    /// Inclusive upper bound (the authority's sealed tick).
    pub until: Tick,
    /// Scopes the node is entitled to.
    pub scopes: BTreeSet<String>,
    /// Restricts the pull to these types; `None` pulls every pulled type.
    pub record_types: Option<BTreeSet<RecordType>>,
    /// Types to pull from the beginning of time.
    pub full_resync_types: BTreeSet<RecordType>,
}

impl PullSpec {
    /// Pulls every pulled type changed in `(since, until]` for `scopes`.
    pub fn new(since: Tick, until: Tick, scopes: impl IntoIterator<Item = String>) -> Self {
        Self {
            since,
            until,
            scopes: scopes.into_iter().collect(),
            record_types: None,
            full_resync_types: BTreeSet::new(),
        }
    }

    /// Restricts the pull to the given types.
    pub fn with_record_types(mut self, types: impl IntoIterator<Item = RecordType>) -> Self {
        self.record_types = Some(types.into_iter().collect());
        self
    }

    /// Pulls the given types from the beginning of time.
    pub fn with_full_resync(mut self, types: impl IntoIterator<Item = RecordType>) -> Self {
        self.full_resync_types.extend(types);
        self
    }

    fn window_for(&self, record_type: &RecordType) -> TickWindow {
        if self.full_resync_types.contains(record_type) {
            TickWindow::between(NEVER_SYNCED, self.until)
        } else {
            TickWindow::between(self.since, self.until)
        }
    }
}

/// Per-type result of staging a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSummary {
    /// The staged type.
    pub record_type: RecordType,
    /// Entries staged.
    pub count: usize,
    /// Chunks read to stage them.
    pub chunks: usize,
}

/// Result of staging a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullSummary {
    /// Entries staged across all types.
    pub total: usize,
    /// Per-type detail, in dependency order.
    pub types: Vec<TypeSummary>,
}

/// Stages outgoing snapshots.
pub struct SnapshotBuilder {
    db: Arc<Database>,
    planner: ChunkPlanner,
    read_concurrency: usize,
}

impl SnapshotBuilder {
    /// Creates a builder. Fails if the configuration has no chunk size.
    pub fn new(db: Arc<Database>, config: &CoreConfig) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            db,
            planner: ChunkPlanner::from_config(config)?,
            read_concurrency: config.read_concurrency,
        })
    }

    /// The planner used for reads.
    pub fn planner(&self) -> &ChunkPlanner {
        &self.planner
    }

    /// Stages this node's pushed types changed in `window` as outgoing
    /// entries. Returns the number staged.
    pub fn stage_push(&self, session: SessionId, window: TickWindow) -> CoreResult<usize> {
        let snapshots = self.db.snapshots();
        snapshots.open(session);
        let mut total = 0;
        for record_type in self.db.registry().push_types() {
            let plan = self.planner.plan(&*self.db, &record_type, window)?;
            total += self.stage_chunks(&plan, |_| true, |records| {
                snapshots.insert(
                    session,
                    SnapshotDirection::Outgoing,
                    records.iter().map(SnapshotEntry::from_record),
                )
            })?;
        }
        debug!(session_id = %session, since = window.since, total, "staged push snapshot");
        Ok(total)
    }

    /// Stages everything in `spec` that falls in the node's scopes as
    /// outgoing entries.
    pub fn stage_pull(
        &self,
        session: SessionId,
        spec: &PullSpec,
        scope: &ScopeMaintainer,
    ) -> CoreResult<PullSummary> {
        let snapshots = self.db.snapshots();
        snapshots.open(session);
        let mut summary = PullSummary::default();
        let pulled = self
            .db
            .registry()
            .pull_types()
            .into_iter()
            .filter(|t| spec.record_types.as_ref().map_or(true, |only| only.contains(t)));
        for record_type in pulled {
            let plan = self.planner.plan(&*self.db, &record_type, spec.window_for(&record_type))?;
            let count = self.stage_chunks(&plan, |r| scope.is_in_scope(r, &spec.scopes), |records| {
                snapshots.insert(
                    session,
                    SnapshotDirection::Outgoing,
                    records.iter().map(SnapshotEntry::from_record),
                )
            })?;
            summary.total += count;
            summary.types.push(TypeSummary {
                record_type,
                count,
                chunks: plan.chunks.len(),
            });
        }
        info!(
            session_id = %session,
            since = spec.since,
            until = spec.until,
            total = summary.total,
            "staged pull snapshot"
        );
        Ok(summary)
    }

    /// Reads every chunk of `plan`, keeping rows accepted by `keep`, and
    /// hands each chunk to `stage` in chunk order. Returns the sum of what
    /// `stage` reports.
    ///
    /// Chunks are read in rounds of at most `read_concurrency`; a round is
    /// staged before the next one is read, so no more than one round of rows
    /// is held in memory.
    fn stage_chunks<F, S>(&self, plan: &ChunkPlan, keep: F, mut stage: S) -> CoreResult<usize>
    where
        F: Fn(&SyncRecord) -> bool + Sync,
        S: FnMut(Vec<SyncRecord>) -> CoreResult<usize>,
    {
        let read = |index: usize| -> Vec<SyncRecord> {
            let chunk = &plan.chunks[index];
            let mut rows = self.db.read_range(&plan.record_type, plan.window, &chunk.range);
            rows.retain(|r| keep(r));
            rows
        };
        let workers = self.read_concurrency.clamp(1, plan.chunks.len().max(1));
        let mut staged = 0;
        let mut round_start = 0;
        while round_start < plan.chunks.len() {
            let round = round_start..(round_start + workers).min(plan.chunks.len());
            let rows: Vec<Vec<SyncRecord>> = if round.len() == 1 {
                vec![read(round.start)]
            } else {
                let slots: Vec<Mutex<Vec<SyncRecord>>> = round.clone().map(|_| Mutex::new(Vec::new())).collect();
                thread::scope(|s| {
                    for (slot, index) in slots.iter().zip(round.clone()) {
                        let read = &read;
                        s.spawn(move || *slot.lock() = read(index));
                    }
                });
                slots.into_iter().map(Mutex::into_inner).collect()
            };
            for chunk in rows {
                staged += stage(chunk)?;
            }
            round_start = round.end;
        }
        Ok(staged)
    }
}


