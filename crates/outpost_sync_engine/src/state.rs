//! Node-side session state machine.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::pull::PullJob;
use crate::transport::SyncTransport;
use outpost_core::{
    now_millis, ApplyEngine, ApplyOptions, ApplyReport, CoreError, CoreResult, Database, EventBus, LogicalClock,
    RecordType, RecordValidator, SessionId, SnapshotBuilder, SnapshotDirection, StampedWriter, Tick, TickWindow,
    WriteGateway,
};
use outpost_sync_protocol::{
    AbortSessionRequest, AdvanceSessionRequest, EndSessionRequest, InitiatePullRequest, PullPlan, PushRequest,
    SessionPhase, StartSessionRequest, StartSessionResponse, StartStatus, SyncStatus, WireRecord,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Statistics about sync sessions.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Sessions completed.
    pub sessions_completed: u64,
    /// Records pushed.
    pub records_pushed: u64,
    /// Records pulled.
    pub records_pulled: u64,
    /// Sessions restarted after losing a race.
    pub conflicts: u64,
    /// Retries after transient failures.
    pub retries: u64,
    /// Authority tick pulled up to by the last completed session.
    pub last_completed_tick: Option<Tick>,
    /// Wall-clock completion time of the last session (unix millis).
    pub last_completed_at: Option<u64>,
    /// Duration of the last completed session.
    pub last_duration: Option<Duration>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Outcome of a completed session.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// The session that completed.
    pub session_id: SessionId,
    /// Records sent to the authority.
    pub pushed: u64,
    /// Pushed records the authority refused.
    pub push_rejected: u64,
    /// Records fetched from the authority.
    pub pulled: u64,
    /// What applying the pull changed locally.
    pub applied: ApplyReport,
    /// New push baseline.
    pub pushed_through: Tick,
    /// New pull baseline (the authority's `pull_until`).
    pub pulled_through: Tick,
    /// Restarts after conflicts.
    pub restarts: u32,
    /// Wall time of the whole call.
    pub duration: Duration,
}

/// A pull that was fetched completely but not yet committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StagedPull {
    session: SessionId,
    /// Local tick sealed at session start: stamp for applied records,
    /// conflict baseline and new push baseline.
    sealed: Tick,
    pull_until: Tick,
}

enum Attempt {
    Done(SyncReport),
    Restart,
}

struct PushOutcome {
    pushed: u64,
    rejected: u64,
    conflict: bool,
}

/// Coordinates sync sessions for one node.
///
/// At most one session runs at a time. A session pushes the cohort sealed
/// at its start, pulls everything the authority staged for it, applies the
/// pull in dependency order and then advances both baselines in one
/// transaction. Losing a race with concurrent changes restarts the whole
/// session.
pub struct SyncEngine<T: SyncTransport> {
    config: SyncConfig,
    transport: Arc<T>,
    db: Arc<Database>,
    bus: Arc<EventBus>,
    clock: LogicalClock,
    gateway: WriteGateway,
    builder: SnapshotBuilder,
    apply: ApplyEngine,
    phase: RwLock<SessionPhase>,
    stats: RwLock<SyncStats>,
    running: AtomicBool,
    running_since: RwLock<Option<Instant>>,
    cancelled: AtomicBool,
    resumable: Mutex<Option<StagedPull>>,
    full_resync: Mutex<BTreeSet<RecordType>>,
    urgent: AtomicBool,
    /// Local writes hold it shared, the session seal exclusively.
    gate: RwLock<()>,
}

impl<T: SyncTransport> SyncEngine<T> {
    /// Creates an engine over the node's store. Fails on invalid configuration.
    pub fn new(config: SyncConfig, transport: T, db: Arc<Database>) -> SyncResult<Self> {
        config.validate()?;
        let bus = Arc::new(EventBus::new());
        let builder = SnapshotBuilder::new(Arc::clone(&db), &config.core)?;
        let apply = ApplyEngine::new(Arc::clone(&db), Arc::clone(&bus)).with_policy(config.core.batch_policy);
        Ok(Self {
            clock: LogicalClock::new(Arc::clone(&db)),
            gateway: WriteGateway::new(Arc::clone(&db), Arc::clone(&bus)),
            config,
            transport: Arc::new(transport),
            db,
            bus,
            builder,
            apply,
            phase: RwLock::new(SessionPhase::Init),
            stats: RwLock::new(SyncStats::default()),
            running: AtomicBool::new(false),
            running_since: RwLock::new(None),
            cancelled: AtomicBool::new(false),
            resumable: Mutex::new(None),
            full_resync: Mutex::new(BTreeSet::new()),
            urgent: AtomicBool::new(false),
            gate: RwLock::new(()),
        })
    }

    /// Adds a validator consulted when pulled records are applied.
    pub fn with_validator(mut self, record_type: impl Into<RecordType>, validator: Arc<dyn RecordValidator>) -> Self {
        self.apply = self.apply.with_validator(record_type, validator);
        self
    }

    /// Runs a local write, stamped with the node's current tick.
    pub fn write<F, R>(&self, f: F) -> SyncResult<R>
    where
        F: FnOnce(&mut StampedWriter<'_, '_>) -> CoreResult<R>,
    {
        let _shared = self.gate.read();
        Ok(self.gateway.write(f)?)
    }

    /// The engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The node's store.
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Change events from local writes and applied pulls.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The node's clock.
    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    /// The transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Gets the current phase.
    pub fn phase(&self) -> SessionPhase {
        *self.phase.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns true while a session (or a resumed apply) is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Operator-facing status.
    pub fn status(&self) -> SyncStatus {
        let stats = self.stats.read();
        SyncStatus {
            is_sync_running: self.is_running(),
            last_completed_tick: stats.last_completed_tick,
            last_completed_at: stats.last_completed_at,
            last_completed_duration_ms: stats.last_duration.map(|d| d.as_millis() as u64),
            current_duration_ms: self.running_since.read().map(|s| s.elapsed().as_millis() as u64),
        }
    }

    /// Asks the next session to pull these types from the beginning.
    pub fn request_full_resync(&self, types: impl IntoIterator<Item = RecordType>) {
        self.full_resync.lock().extend(types);
    }

    /// Asks the authority to serve this node's next session ahead of
    /// non-urgent nodes. Cleared once a session starts.
    pub fn request_urgent(&self) {
        self.urgent.store(true, Ordering::SeqCst);
    }

    /// Session whose pull is staged and can be applied with
    /// [`resume_apply`](Self::resume_apply).
    pub fn resumable_session(&self) -> Option<SessionId> {
        self.resumable.lock().map(|s| s.session)
    }

    /// Cancels the running session at its next phase or page boundary.
    ///
    /// Staged incoming entries are discarded, the authority is told and the
    /// single-flight guard is released. Nothing is kept for resumption.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn begin(&self) -> SyncResult<FlightGuard<'_, T>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SyncError::AlreadyRunning)?;
        *self.running_since.write() = Some(Instant::now());
        Ok(FlightGuard { engine: self })
    }

    fn transition(&self, next: SessionPhase) -> SyncResult<()> {
        let mut phase = self.phase.write();
        if !phase.can_transition_to(next) {
            return Err(SyncError::InvalidStateTransition { from: *phase, to: next });
        }
        *phase = next;
        Ok(())
    }

    fn set_phase(&self, phase: SessionPhase) {
        *self.phase.write() = phase;
    }

    /// Runs one sync session, restarting it after conflicts.
    pub fn sync(&self) -> SyncResult<SyncReport> {
        let _flight = self.begin()?;
        self.cancelled.store(false, Ordering::SeqCst);
        let started = Instant::now();
        let mut restarts = 0;
        loop {
            match self.run_session() {
                Ok(Attempt::Done(mut report)) => {
                    report.restarts = restarts;
                    report.duration = started.elapsed();
                    self.record_success(&report);
                    return Ok(report);
                }
                Ok(Attempt::Restart) => {
                    self.stats.write().conflicts += 1;
                    if restarts >= self.config.max_conflict_restarts {
                        let err = SyncError::Conflict { restarts };
                        self.record_failure(&err);
                        return Err(err);
                    }
                    restarts += 1;
                }
                Err(err) => {
                    self.record_failure(&err);
                    return Err(err);
                }
            }
        }
    }

    /// Runs [`sync`](Self::sync), retrying transient failures with backoff.
    pub fn sync_with_retry(&self) -> SyncResult<SyncReport> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                std::thread::sleep(retry.delay_for_attempt(attempt));
                self.stats.write().retries += 1;
            }
            match self.sync() {
                Ok(report) => return Ok(report),
                Err(err) if err.is_retryable() && attempt + 1 < retry.max_attempts => {
                    debug!(attempt, error = %err, "retrying sync");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Applies and commits a pull that was fetched completely by a session
    /// that then failed.
    ///
    /// Applying is idempotent, so entries that made it in before the
    /// failure are left as they are. The authority is not contacted.
    pub fn resume_apply(&self, session: SessionId) -> SyncResult<SyncReport> {
        let _flight = self.begin()?;
        let started = Instant::now();
        let staged = self
            .resumable
            .lock()
            .filter(|s| s.session == session)
            .ok_or(SyncError::Core(CoreError::SessionNotStaged(session)))?;
        info!(session_id = %session, pull_until = staged.pull_until, "resuming apply");

        // Local recovery: the authority's view of the session no longer matters.
        self.set_phase(SessionPhase::Applying);
        let result = self.apply_staged(&staged).and_then(|applied| {
            self.set_phase(SessionPhase::Committing);
            self.commit(&staged)?;
            Ok(applied)
        });
        match result {
            Ok(applied) => {
                self.set_phase(SessionPhase::Done);
                let report = SyncReport {
                    session_id: session,
                    pushed: 0,
                    push_rejected: 0,
                    pulled: 0,
                    applied,
                    pushed_through: staged.sealed,
                    pulled_through: staged.pull_until,
                    restarts: 0,
                    duration: started.elapsed(),
                };
                self.record_success(&report);
                Ok(report)
            }
            Err(err) => {
                if err.is_conflict() {
                    self.discard(session);
                }
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    fn run_session(&self) -> SyncResult<Attempt> {
        self.transition(SessionPhase::Init)?;
        self.check_cancelled()?;
        // Leftovers from an earlier failed session are never reused once a
        // new session starts.
        self.resumable.lock().take();
        self.db.snapshots().drop_all();

        let last_push = self.clock.last_push()?;
        let last_pull = self.clock.last_pull()?;
        let start = self.transport.start_session(StartSessionRequest {
            node_id: self.config.node_id.clone(),
            protocol_version: self.config.protocol_version,
            scopes: self.config.scopes.clone(),
            last_pull_tick: last_pull,
            urgent: self.urgent.load(Ordering::SeqCst),
        })?;
        let session = match (start.status, start.session_id) {
            (StartStatus::Started, Some(id)) => {
                self.urgent.store(false, Ordering::SeqCst);
                id
            }
            (status, _) => return Err(SyncError::SessionRefused(status)),
        };
        info!(
            session_id = %session,
            node_id = %self.config.node_id,
            last_push,
            last_pull,
            from_tick = start.from_tick,
            "sync session started"
        );

        match self.drive(session, last_push, last_pull, &start) {
            Ok(attempt) => Ok(attempt),
            Err(err) => {
                let keep = !matches!(err, SyncError::Cancelled) && self.resumable_session() == Some(session);
                if !keep {
                    self.discard(session);
                }
                let reason = err.to_string();
                if let Err(abort_err) = self.transport.abort_session(AbortSessionRequest {
                    session_id: session,
                    reason,
                }) {
                    debug!(session_id = %session, error = %abort_err, "could not abort session at the authority");
                }
                Err(err)
            }
        }
    }

    fn drive(
        &self,
        session: SessionId,
        last_push: Tick,
        last_pull: Tick,
        start: &StartSessionResponse,
    ) -> SyncResult<Attempt> {
        self.transition(SessionPhase::Pushing)?;
        let sealed = self.seal(start.authority_tick)?;
        self.advance(session, SessionPhase::Pushing, last_push)?;
        self.check_cancelled()?;
        let push = self.push_changes(session, TickWindow::between(last_push, sealed))?;

        self.transition(SessionPhase::PushValidating)?;
        if push.conflict {
            return self.restart(session, "push conflicted with concurrent changes");
        }

        self.transition(SessionPhase::PullPlanning)?;
        self.advance(session, SessionPhase::PullPlanning, sealed)?;
        self.check_cancelled()?;
        let full_resync: Vec<RecordType> = self.full_resync.lock().iter().cloned().collect();
        let plan = self.transport.initiate_pull(InitiatePullRequest {
            session_id: session,
            since_tick: last_pull,
            record_types: self.config.pull_record_types.clone(),
            full_resync_types: full_resync.clone(),
        })?;
        debug!(session_id = %session, pull_until = plan.pull_until, total = plan.total, "pull planned");

        self.transition(SessionPhase::Pulling)?;
        let pulled = self.pull_changes(session, last_pull, &plan)?;
        let staged = StagedPull {
            session,
            sealed,
            pull_until: plan.pull_until,
        };
        *self.resumable.lock() = Some(staged);

        self.transition(SessionPhase::Applying)?;
        self.advance(session, SessionPhase::Applying, sealed)?;
        self.check_cancelled()?;
        let applied = match self.apply_staged(&staged) {
            Ok(applied) => applied,
            Err(err) if err.is_conflict() => {
                self.resumable.lock().take();
                return self.restart(session, "local changes made during the session conflict with the pull");
            }
            Err(err) => return Err(err),
        };

        self.transition(SessionPhase::Committing)?;
        self.advance(session, SessionPhase::Committing, sealed)?;
        self.commit(&staged)?;
        {
            let mut pending = self.full_resync.lock();
            for record_type in &full_resync {
                pending.remove(record_type);
            }
        }
        if let Err(err) = self.transport.end_session(EndSessionRequest { session_id: session }) {
            // Committed locally; the authority lapses the session on its own.
            warn!(session_id = %session, error = %err, "could not end session at the authority");
        }
        self.transition(SessionPhase::Done)?;

        Ok(Attempt::Done(SyncReport {
            session_id: session,
            pushed: push.pushed,
            push_rejected: push.rejected,
            pulled,
            applied,
            pushed_through: sealed,
            pulled_through: plan.pull_until,
            restarts: 0,
            duration: Duration::ZERO,
        }))
    }

    /// Closes the local cohort and adopts the authority's clock.
    ///
    /// Writes made from here on land after the sealed tick and go out with
    /// the next session.
    fn seal(&self, authority_tick: Tick) -> SyncResult<Tick> {
        let _exclusive = self.gate.write();
        let sealed = self.clock.seal_generation()?;
        let current = self.clock.adopt(authority_tick)?;
        debug!(sealed, current, "sealed local cohort");
        Ok(sealed)
    }

    fn advance(&self, session: SessionId, phase: SessionPhase, from_tick: Tick) -> SyncResult<Tick> {
        let response = self.transport.advance_session(AdvanceSessionRequest {
            session_id: session,
            phase,
            from_tick,
        })?;
        Ok(response.authority_tick)
    }

    fn push_changes(&self, session: SessionId, window: TickWindow) -> SyncResult<PushOutcome> {
        let staged = self.builder.stage_push(session, window)?;
        let snapshots = self.db.snapshots();
        let mut records: Vec<WireRecord> = Vec::with_capacity(staged);
        let types = snapshots.types(session, SnapshotDirection::Outgoing)?;
        for record_type in self.db.registry().sort_by_dependency(types)? {
            let entries = snapshots.entries_for_type(session, SnapshotDirection::Outgoing, &record_type)?;
            records.extend(entries.into_iter().map(WireRecord::from));
        }

        let batch_size = self.config.push_batch_size as usize;
        let mut batches: Vec<Vec<WireRecord>> = Vec::new();
        let mut records = records.into_iter().peekable();
        while records.peek().is_some() {
            batches.push(records.by_ref().take(batch_size).collect());
        }
        if batches.is_empty() {
            batches.push(Vec::new());
        }

        let last = batches.len() - 1;
        let mut outcome = PushOutcome {
            pushed: 0,
            rejected: 0,
            conflict: false,
        };
        for (index, batch) in batches.into_iter().enumerate() {
            self.check_cancelled()?;
            outcome.pushed += batch.len() as u64;
            let response = self.transport.push(PushRequest {
                session_id: session,
                records: batch,
                complete: index == last,
            })?;
            if response.conflict {
                warn!(session_id = %session, staged = response.staged, "authority reported a push conflict");
                outcome.conflict = true;
                return Ok(outcome);
            }
            outcome.rejected = response.rejected;
            if let Some(tick) = response.accepted_up_to_tick {
                debug!(session_id = %session, tick, pushed = outcome.pushed, "push accepted");
            }
        }
        if outcome.rejected > 0 {
            warn!(session_id = %session, rejected = outcome.rejected, "authority refused pushed records");
        }
        snapshots.clear_direction(session, SnapshotDirection::Outgoing)?;
        Ok(outcome)
    }

    fn pull_changes(&self, session: SessionId, since: Tick, plan: &PullPlan) -> SyncResult<u64> {
        self.db.snapshots().open(session);
        let job = PullJob {
            transport: &*self.transport,
            db: &self.db,
            session,
            since,
            config: &self.config.pull,
            cancelled: &self.cancelled,
        };
        let pulled = job.run(plan)?;
        debug!(session_id = %session, pulled, planned = plan.total, "pull staged");
        Ok(pulled)
    }

    fn apply_staged(&self, staged: &StagedPull) -> SyncResult<ApplyReport> {
        let _shared = self.gate.read();
        let options = ApplyOptions::at(staged.sealed).with_conflict_guard(staged.sealed);
        Ok(self.apply.apply_session(staged.session, options)?)
    }

    fn commit(&self, staged: &StagedPull) -> SyncResult<()> {
        let next = self.clock.commit_session(staged.sealed, staged.pull_until)?;
        self.resumable.lock().take();
        self.db.snapshots().drop_session(staged.session);
        debug!(
            session_id = %staged.session,
            pushed_through = staged.sealed,
            pulled_through = staged.pull_until,
            next_tick = next,
            "committed session"
        );
        Ok(())
    }

    fn restart(&self, session: SessionId, reason: &str) -> SyncResult<Attempt> {
        warn!(session_id = %session, reason, "sync session aborted, restarting");
        self.transition(SessionPhase::Aborted)?;
        self.discard(session);
        if let Err(err) = self.transport.abort_session(AbortSessionRequest {
            session_id: session,
            reason: reason.to_owned(),
        }) {
            debug!(session_id = %session, error = %err, "authority already closed the session");
        }
        Ok(Attempt::Restart)
    }

    fn discard(&self, session: SessionId) {
        let mut resumable = self.resumable.lock();
        if resumable.is_some_and(|s| s.session == session) {
            resumable.take();
        }
        self.db.snapshots().drop_session(session);
    }

    fn record_success(&self, report: &SyncReport) {
        info!(
            session_id = %report.session_id,
            pushed = report.pushed,
            pulled = report.pulled,
            changed = report.applied.changed(),
            pull_until = report.pulled_through,
            restarts = report.restarts,
            duration_ms = report.duration.as_millis() as u64,
            "sync session completed"
        );
        let mut stats = self.stats.write();
        stats.sessions_completed += 1;
        stats.records_pushed += report.pushed;
        stats.records_pulled += report.pulled;
        stats.last_completed_tick = Some(report.pulled_through);
        stats.last_completed_at = Some(now_millis());
        stats.last_duration = Some(report.duration);
        stats.last_error = None;
    }

    fn record_failure(&self, err: &SyncError) {
        if matches!(err, SyncError::Cancelled) {
            warn!("sync session cancelled");
        } else {
            error!(error = %err, "sync session failed");
        }
        self.set_phase(SessionPhase::Failed);
        self.stats.write().last_error = Some(err.to_string());
    }
}

/// Releases the single-flight slot when a run ends, however it ends.
struct FlightGuard<'a, T: SyncTransport> {
    engine: &'a SyncEngine<T>,
}

impl<T: SyncTransport> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        *self.engine.running_since.write() = None;
        self.engine.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use outpost_core::{payload_from_value, CoreConfig, SyncDirection, TypeDefinition, TypeRegistry};
    use outpost_sync_protocol::{
        AdvanceSessionResponse, PullResponse, PushResponse, SessionClosed, SyncMessage, TypePlan,
    };
    use serde_json::json;

    fn engine() -> SyncEngine<MockTransport> {
        let registry = TypeRegistry::builder()
            .register(TypeDefinition::new("facilities", SyncDirection::PullOnly))
            .register(TypeDefinition::new("notes", SyncDirection::Bidirectional))
            .build()
            .unwrap();
        let db = Arc::new(Database::new(Arc::new(registry)));
        let config = SyncConfig::new("node-1", "mock://central")
            .with_scopes(["f1"])
            .with_core(CoreConfig::new(100));
        SyncEngine::new(config, MockTransport::new(), db).unwrap()
    }

    fn advanced(session_id: SessionId, phase: SessionPhase) -> SyncMessage {
        SyncMessage::SessionAdvanced(AdvanceSessionResponse {
            session_id,
            phase,
            authority_tick: 20,
        })
    }

    fn script_session(transport: &MockTransport, id: SessionId, push: PushResponse, plan_types: Vec<TypePlan>) {
        transport.queue_reply(SyncMessage::SessionStarted(StartSessionResponse::started(id, 15, 16)));
        transport.queue_reply(advanced(id, SessionPhase::Pushing));
        transport.queue_reply(SyncMessage::PushAck(push));
        transport.queue_reply(advanced(id, SessionPhase::PullPlanning));
        let total = plan_types.iter().map(|t| t.count).sum();
        transport.queue_reply(SyncMessage::PullPlanned(PullPlan {
            session_id: id,
            pull_until: 15,
            total,
            types: plan_types,
        }));
    }

    #[test]
    fn engine_initial_state() {
        let engine = engine();
        assert_eq!(engine.phase(), SessionPhase::Init);
        assert_eq!(engine.stats().sessions_completed, 0);
        assert!(!engine.is_running());
        assert_eq!(engine.status(), SyncStatus::default());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let db = Arc::new(Database::new(Arc::new(TypeRegistry::builder().build().unwrap())));
        let result = SyncEngine::new(SyncConfig::new("n", ""), MockTransport::new(), db);
        assert!(matches!(result, Err(SyncError::Core(CoreError::Configuration(_)))));
    }

    #[test]
    fn scripted_session_pulls_and_commits() {
        let engine = engine();
        let id = SessionId::generate();
        let transport = engine.transport();
        script_session(
            transport,
            id,
            PushResponse::accepted(15, 0, 0),
            vec![TypePlan {
                record_type: "facilities".into(),
                count: 1,
                chunks: 1,
            }],
        );
        transport.queue_reply(SyncMessage::PullPage(PullResponse {
            entries: vec![WireRecord {
                record_type: "facilities".into(),
                record_id: "f1".into(),
                data: payload_from_value(json!({"name": "North"})).unwrap(),
                is_deleted: false,
                deleted_at: None,
                updated_at_sync_tick: 15,
            }],
            done: true,
            next_cursor: None,
        }));
        transport.queue_reply(advanced(id, SessionPhase::Applying));
        transport.queue_reply(advanced(id, SessionPhase::Committing));
        transport.queue_reply(SyncMessage::SessionClosed(SessionClosed { session_id: id }));

        let report = engine.sync().unwrap();
        assert_eq!(report.session_id, id);
        assert_eq!(report.pulled, 1);
        assert_eq!(report.applied.created, 1);
        assert_eq!(report.pulled_through, 15);
        assert_eq!(engine.phase(), SessionPhase::Done);
        assert_eq!(engine.clock().last_pull().unwrap(), 15);
        assert!(engine.clock().current_tick().unwrap() > 16);
        assert!(engine.database().get(&outpost_core::RecordKey::new("facilities", "f1")).is_some());

        let names: Vec<&str> = transport.requests().iter().map(|m| m.name()).collect();
        assert_eq!(
            names,
            [
                "start_session",
                "advance_session",
                "push",
                "advance_session",
                "initiate_pull",
                "pull",
                "advance_session",
                "advance_session",
                "end_session"
            ]
        );
        let status = engine.status();
        assert!(!status.is_sync_running);
        assert_eq!(status.last_completed_tick, Some(15));
        assert!(status.last_completed_at.is_some());
    }

    #[test]
    fn refused_start_is_reported() {
        let engine = engine();
        engine
            .transport()
            .queue_reply(SyncMessage::SessionStarted(StartSessionResponse::refused(StartStatus::Busy, 3)));
        let err = engine.sync().unwrap_err();
        assert!(matches!(err, SyncError::SessionRefused(StartStatus::Busy)));
        assert!(err.is_retryable());
        assert_eq!(engine.phase(), SessionPhase::Failed);
        assert!(!engine.is_running());
        assert!(engine.stats().last_error.is_some());
    }

    #[test]
    fn urgency_is_sent_until_a_session_starts() {
        let engine = engine();
        engine.request_urgent();
        let transport = engine.transport();
        transport.queue_reply(SyncMessage::SessionStarted(StartSessionResponse::refused(StartStatus::Queued, 0)));
        assert!(matches!(engine.sync(), Err(SyncError::SessionRefused(StartStatus::Queued))));
        transport.queue_reply(SyncMessage::SessionStarted(StartSessionResponse::refused(StartStatus::Busy, 0)));
        assert!(engine.sync().is_err());

        let urgent: Vec<bool> = transport
            .requests()
            .into_iter()
            .filter_map(|r| match r {
                SyncMessage::StartSession(start) => Some(start.urgent),
                _ => None,
            })
            .collect();
        assert_eq!(urgent, [true, true]);
    }

    #[test]
    fn push_conflicts_restart_until_the_limit() {
        let engine = engine();
        let transport = engine.transport();
        for _ in 0..=engine.config().max_conflict_restarts {
            let id = SessionId::generate();
            transport.queue_reply(SyncMessage::SessionStarted(StartSessionResponse::started(id, 1, 2)));
            transport.queue_reply(advanced(id, SessionPhase::Pushing));
            transport.queue_reply(SyncMessage::PushAck(PushResponse::conflict(0)));
            transport.queue_reply(SyncMessage::SessionClosed(SessionClosed { session_id: id }));
        }
        let err = engine.sync().unwrap_err();
        assert!(matches!(err, SyncError::Conflict { restarts: 3 }));
        assert_eq!(engine.stats().conflicts, 4);
        assert_eq!(engine.clock().last_push().unwrap(), outpost_core::NEVER_SYNCED);
    }

    #[test]
    fn cancelled_before_start_does_not_contact_the_authority() {
        let engine = engine();
        engine.cancel();
        // A new sync clears an earlier cancel.
        engine
            .transport()
            .queue_reply(SyncMessage::SessionStarted(StartSessionResponse::refused(StartStatus::Busy, 0)));
        assert!(matches!(engine.sync(), Err(SyncError::SessionRefused(_))));
    }

    #[test]
    fn local_writes_are_stamped_with_the_current_tick() {
        let engine = engine();
        engine
            .write(|w| w.insert("notes".into(), "n1".into(), payload_from_value(json!({"text": "hi"})).unwrap()))
            .unwrap();
        let record = engine.database().get(&outpost_core::RecordKey::new("notes", "n1")).unwrap();
        assert_eq!(record.updated_at_sync_tick, engine.clock().current_tick().unwrap());
    }

    #[test]
    fn resume_requires_a_staged_pull() {
        let engine = engine();
        let err = engine.resume_apply(SessionId::generate()).unwrap_err();
        assert!(matches!(err, SyncError::Core(CoreError::SessionNotStaged(_))));
    }
}
