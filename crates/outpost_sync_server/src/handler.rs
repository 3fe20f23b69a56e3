//! Request handlers for the sync authority.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::session::{NewSession, PushLedger, SessionRecord, SessionRegistry};
use outpost_core::{
    ApplyEngine, ApplyOptions, ConflictGuard, CoreResult, Database, EventBus, LogicalClock, PullSpec,
    ScopeMaintainer, SessionId, SnapshotBuilder, SnapshotDirection, SnapshotEntry, StampedWriter, Tick, TypeRegistry, WriteGateway,
};
use outpost_sync_protocol::{
    AbortSessionRequest, AdvanceSessionRequest, AdvanceSessionResponse, EndSessionRequest, InitiatePullRequest,
    PullPlan, PullRequest, PullResponse, PushRequest, PushResponse, SessionClosed, SessionPhase,
    StartSessionRequest, StartSessionResponse, TypePlan, WireRecord, PROTOCOL_VERSION,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Shared state behind every handler.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// The authority's store.
    pub db: Arc<Database>,
    /// Change events from the gateway and the apply engine.
    pub bus: Arc<EventBus>,
    /// The authority's clock.
    pub clock: LogicalClock,
    /// Tick-stamping write path; reached only through [`write`](Self::write).
    gateway: WriteGateway,
    /// Scope index; subscribed to `bus`.
    pub scope: Arc<ScopeMaintainer>,
    builder: SnapshotBuilder,
    apply: ApplyEngine,
    sessions: SessionRegistry,
    ledger: PushLedger,
    /// Writers (push persistence, direct writes) hold it shared; clock
    /// seals hold it exclusively so a sealed tick never has writes still
    /// in flight.
    gate: RwLock<()>,
}

impl HandlerContext {
    /// Wires up a context over a fresh store.
    pub fn new(config: ServerConfig, registry: Arc<TypeRegistry>) -> ServerResult<Self> {
        Self::with_database(config, Arc::new(Database::new(registry)))
    }

    /// Wires up a context over an existing store, rebuilding the scope index.
    pub fn with_database(config: ServerConfig, db: Arc<Database>) -> ServerResult<Self> {
        config.validate()?;
        let bus = Arc::new(EventBus::new());
        let scope = Arc::new(ScopeMaintainer::new(Arc::clone(&db)));
        scope.rebuild()?;
        bus.subscribe(scope.clone());
        let builder = SnapshotBuilder::new(Arc::clone(&db), &config.core)?;
        let apply = ApplyEngine::new(Arc::clone(&db), Arc::clone(&bus)).with_policy(config.core.batch_policy);
        // Staging left over from a previous process is never resumable.
        db.snapshots().drop_all();
        Ok(Self {
            clock: LogicalClock::new(Arc::clone(&db)),
            gateway: WriteGateway::new(Arc::clone(&db), Arc::clone(&bus)),
            config,
            db,
            bus,
            scope,
            builder,
            apply,
            sessions: SessionRegistry::new(),
            ledger: PushLedger::new(),
            gate: RwLock::new(()),
        })
    }

    /// Runs a direct authority write, serialized against clock seals.
    pub fn write<F, T>(&self, f: F) -> ServerResult<T>
    where
        F: FnOnce(&mut StampedWriter<'_, '_>) -> CoreResult<T>,
    {
        let _shared = self.gate.read();
        Ok(self.gateway.write(f)?)
    }

    /// The session registry.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    fn seal(&self) -> ServerResult<Tick> {
        let _exclusive = self.gate.write();
        Ok(self.clock.seal_generation()?)
    }

    fn connect(&self, id: SessionId) -> ServerResult<SessionRecord> {
        self.sessions.connect(id, Instant::now(), self.config.session_timeout)
    }

    fn close(&self, id: SessionId, phase: SessionPhase) -> Option<SessionRecord> {
        self.db.snapshots().drop_session(id);
        self.sessions.close(id, phase)
    }

    fn fail(&self, id: SessionId, err: &ServerError) {
        self.sessions.fail(id, err.to_string());
        self.db.snapshots().drop_session(id);
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Opens a session, sealing the authority clock as its baseline.
    pub fn handle_start(&self, request: StartSessionRequest) -> ServerResult<StartSessionResponse> {
        let ctx = &self.context;
        if request.protocol_version != PROTOCOL_VERSION {
            return Err(ServerError::ProtocolMismatch(format!(
                "expected {PROTOCOL_VERSION}, got {}",
                request.protocol_version
            )));
        }
        self.purge_lapsed_sessions();

        let from_tick = ctx.seal()?;
        let authority_tick = ctx.clock.current_tick()?;
        let new = NewSession {
            node_id: request.node_id.clone(),
            scopes: request.scopes.into_iter().collect(),
            from_tick,
            since_tick: request.last_pull_tick,
            urgent: request.urgent,
        };
        match ctx
            .sessions
            .register(new, ctx.config.max_concurrent_sessions, Instant::now())
        {
            Ok(id) => {
                ctx.db.snapshots().open(id);
                ctx.ledger.prune(&request.node_id, request.last_pull_tick);
                info!(session_id = %id, node_id = %request.node_id, from_tick, "sync session started");
                Ok(StartSessionResponse::started(id, from_tick, authority_tick))
            }
            Err(status) => {
                warn!(node_id = %request.node_id, ?status, "sync session refused");
                Ok(StartSessionResponse::refused(status, authority_tick))
            }
        }
    }

    /// Records the node moving to a new phase.
    pub fn handle_advance(&self, request: AdvanceSessionRequest) -> ServerResult<AdvanceSessionResponse> {
        let ctx = &self.context;
        if !matches!(
            request.phase,
            SessionPhase::Pushing | SessionPhase::PullPlanning | SessionPhase::Applying | SessionPhase::Committing
        ) {
            return Err(ServerError::InvalidRequest(format!(
                "phase {} cannot be reported through advance",
                request.phase
            )));
        }
        ctx.connect(request.session_id)?;
        ctx.sessions
            .update(request.session_id, |s| s.advance(request.phase, "advance"))?;
        debug!(
            session_id = %request.session_id,
            phase = %request.phase,
            node_tick = request.from_tick,
            "session advanced"
        );
        Ok(AdvanceSessionResponse {
            session_id: request.session_id,
            phase: request.phase,
            authority_tick: ctx.clock.current_tick()?,
        })
    }

    /// Stages a push batch; the final batch is validated and persisted.
    pub fn handle_push(&self, request: PushRequest) -> ServerResult<PushResponse> {
        let ctx = &self.context;
        let id = request.session_id;
        if request.records.len() > ctx.config.max_push_batch as usize {
            return Err(ServerError::InvalidRequest(format!(
                "too many records: {} > {}",
                request.records.len(),
                ctx.config.max_push_batch
            )));
        }
        let session = ctx.connect(id)?;
        session.require(SessionPhase::Pushing, "push")?;

        let registry = ctx.db.registry();
        let mut refused = 0u64;
        let entries: Vec<SnapshotEntry> = request
            .records
            .into_iter()
            .filter(|r| {
                let accepted = registry.should_push(&r.record_type);
                if !accepted {
                    warn!(session_id = %id, record_type = %r.record_type, "refused record of a type nodes do not push");
                    refused += 1;
                }
                accepted
            })
            .map(WireRecord::into_entry)
            .collect();
        let snapshots = ctx.db.snapshots();
        snapshots.insert(id, SnapshotDirection::Incoming, entries)?;
        let staged = snapshots.count(id, SnapshotDirection::Incoming)? as u64;
        ctx.sessions.update(id, |s| {
            s.refused += refused;
            Ok(())
        })?;

        if !request.complete {
            debug!(session_id = %id, staged, "staged push batch");
            return Ok(PushResponse::staged(staged));
        }

        ctx.sessions
            .update(id, |s| s.advance(SessionPhase::PushValidating, "push"))?;
        let refused = session.refused + refused;
        if staged == 0 {
            return Ok(PushResponse::accepted(session.from_tick, 0, refused));
        }

        match self.persist_push(&session) {
            Ok(response) => Ok(PushResponse { rejected: response.rejected + refused, ..response }),
            Err(ServerError::Core(err)) if err.is_conflict() => {
                ctx.close(id, SessionPhase::Aborted);
                Ok(PushResponse::conflict(staged))
            }
            Err(err) => {
                ctx.fail(id, &err);
                Err(err)
            }
        }
    }

    fn persist_push(&self, session: &SessionRecord) -> ServerResult<PushResponse> {
        let ctx = &self.context;
        let id = session.id;
        let guard = ConflictGuard::new(session.from_tick).with_exempt_ticks(ctx.ledger.ticks_for(&session.node_id));
        guard.ensure_no_conflicts(&ctx.db, id, SnapshotDirection::Incoming)?;

        let _shared = ctx.gate.read();
        let (tick, _) = ctx.clock.tick_tock()?;
        let report = ctx.apply.apply_session(id, ApplyOptions::at(tick))?;
        let snapshots = ctx.db.snapshots();
        snapshots.mark_saved(id, SnapshotDirection::Incoming, tick)?;
        ctx.ledger.record(&session.node_id, tick);
        ctx.sessions.update(id, |s| {
            s.persisted_at = Some(tick);
            Ok(())
        })?;
        let staged = snapshots.count(id, SnapshotDirection::Incoming)? as u64;
        info!(
            session_id = %id,
            node_id = %session.node_id,
            tick,
            staged,
            changed = report.changed(),
            rejected = report.rejected.len(),
            "persisted push"
        );
        Ok(PushResponse::accepted(tick, staged, report.rejected.len() as u64))
    }

    /// Seals the clock and stages everything the node is entitled to.
    pub fn handle_initiate_pull(&self, request: InitiatePullRequest) -> ServerResult<PullPlan> {
        let ctx = &self.context;
        let id = request.session_id;
        let session = ctx.connect(id)?;
        session.require(SessionPhase::PullPlanning, "initiate pull")?;
        let registry = ctx.db.registry();
        for record_type in request.record_types.iter().flatten().chain(&request.full_resync_types) {
            registry.definition(record_type)?;
        }

        let result = self.stage_pull(&session, &request);
        if let Err(err) = &result {
            ctx.fail(id, err);
        }
        result
    }

    fn stage_pull(&self, session: &SessionRecord, request: &InitiatePullRequest) -> ServerResult<PullPlan> {
        let ctx = &self.context;
        let id = session.id;
        let pull_until = ctx.seal()?;
        let mut spec = PullSpec::new(request.since_tick, pull_until, session.scopes.iter().cloned())
            .with_full_resync(request.full_resync_types.iter().cloned());
        if let Some(types) = &request.record_types {
            spec = spec.with_record_types(types.iter().cloned());
        }
        let summary = ctx.builder.stage_pull(id, &spec, &ctx.scope)?;
        let snapshots = ctx.db.snapshots();
        let echoes = snapshots.remove_echoes(id)?;
        let counts = snapshots.count_by_type(id, SnapshotDirection::Outgoing)?;
        let types: Vec<TypePlan> = summary
            .types
            .iter()
            .filter_map(|t| {
                counts.get(&t.record_type).map(|count| TypePlan {
                    record_type: t.record_type.clone(),
                    count: *count as u64,
                    chunks: t.chunks as u64,
                })
            })
            .collect();
        let total = types.iter().map(|t| t.count).sum();
        ctx.sessions.update(id, |s| {
            s.since_tick = request.since_tick;
            s.pull_until = Some(pull_until);
            s.advance(SessionPhase::Pulling, "initiate pull")
        })?;
        info!(session_id = %id, since = request.since_tick, pull_until, total, echoes, "pull snapshot ready");
        Ok(PullPlan {
            session_id: id,
            pull_until,
            total,
            types,
        })
    }

    /// Serves one page of the staged pull.
    pub fn handle_pull(&self, request: PullRequest) -> ServerResult<PullResponse> {
        let ctx = &self.context;
        let session = ctx.connect(request.session_id)?;
        session.require(SessionPhase::Pulling, "pull")?;
        if request.since_tick != session.since_tick {
            return Err(ServerError::InvalidRequest(format!(
                "pull since {} does not match the staged snapshot (since {})",
                request.since_tick, session.since_tick
            )));
        }
        let limit = request.limit.clamp(1, ctx.config.max_pull_page) as usize;
        let page = ctx.db.snapshots().page(
            request.session_id,
            SnapshotDirection::Outgoing,
            &request.record_type,
            request.cursor.as_ref(),
            limit,
        )?;
        debug!(
            session_id = %request.session_id,
            record_type = %request.record_type,
            entries = page.entries.len(),
            "served pull page"
        );
        Ok(PullResponse {
            entries: page.entries.into_iter().map(WireRecord::from).collect(),
            done: page.next_cursor.is_none(),
            next_cursor: page.next_cursor,
        })
    }

    /// Completes a session and drops its staging.
    pub fn handle_end(&self, request: EndSessionRequest) -> ServerResult<SessionClosed> {
        let ctx = &self.context;
        let session = ctx.connect(request.session_id)?;
        session.require(SessionPhase::Committing, "end")?;
        ctx.close(request.session_id, SessionPhase::Done);
        info!(
            session_id = %request.session_id,
            node_id = %session.node_id,
            duration_ms = session.started_at.elapsed().as_millis() as u64,
            "sync session completed"
        );
        Ok(SessionClosed {
            session_id: request.session_id,
        })
    }

    /// Abandons a session at the node's request.
    pub fn handle_abort(&self, request: AbortSessionRequest) -> ServerResult<SessionClosed> {
        let ctx = &self.context;
        let closed = ctx
            .close(request.session_id, SessionPhase::Aborted)
            .ok_or(ServerError::SessionNotFound(request.session_id))?;
        warn!(
            session_id = %request.session_id,
            node_id = %closed.node_id,
            reason = %request.reason,
            "sync session aborted by node"
        );
        Ok(SessionClosed {
            session_id: request.session_id,
        })
    }

    /// Purges lapsed sessions and their staging. Returns how many.
    pub fn purge_lapsed_sessions(&self) -> usize {
        let ctx = &self.context;
        let lapsed = ctx
            .sessions
            .purge_lapsed(Instant::now(), ctx.config.session_lapse_timeout);
        for id in &lapsed {
            ctx.db.snapshots().drop_session(*id);
            warn!(session_id = %id, "purged lapsed sync session");
        }
        lapsed.len()
    }
}
