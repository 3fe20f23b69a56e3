//! Authority-side session registry.

use outpost_core::{NodeId, SessionId, Tick};
use outpost_sync_protocol::{SessionPhase, StartStatus};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::error::{ServerError, ServerResult};

/// State the authority keeps for one session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Session id.
    pub id: SessionId,
    /// Requesting node.
    pub node_id: NodeId,
    /// Scopes the node is entitled to.
    pub scopes: BTreeSet<String>,
    /// Phase as last reported or reached.
    pub phase: SessionPhase,
    /// Authority tick sealed when the session started.
    pub from_tick: Tick,
    /// The node's pull baseline.
    pub since_tick: Tick,
    /// Upper bound of the staged pull.
    pub pull_until: Option<Tick>,
    /// Tick the push was persisted at.
    pub persisted_at: Option<Tick>,
    /// Pushed records refused before staging.
    pub refused: u64,
    /// Last error, once the session failed.
    pub error: Option<String>,
    /// When the session started.
    pub started_at: Instant,
    /// Last request seen for the session.
    pub last_activity: Instant,
}

impl SessionRecord {
    /// Returns true while the session holds a capacity slot.
    pub fn is_open(&self) -> bool {
        self.error.is_none() && !matches!(self.phase, SessionPhase::Done | SessionPhase::Aborted | SessionPhase::Failed)
    }

    /// Fails unless the session is in `phase`.
    pub fn require(&self, phase: SessionPhase, operation: &'static str) -> ServerResult<()> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(ServerError::InvalidPhase {
                session: self.id,
                phase: self.phase,
                operation,
            })
        }
    }

    /// Moves to `next` if the state machine allows it.
    pub fn advance(&mut self, next: SessionPhase, operation: &'static str) -> ServerResult<()> {
        if self.phase.can_transition_to(next) {
            self.phase = next;
            Ok(())
        } else {
            Err(ServerError::InvalidPhase {
                session: self.id,
                phase: self.phase,
                operation,
            })
        }
    }
}

/// Parameters of a new session.
#[derive(Debug, Clone)]
pub struct NewSession {
    /// Requesting node.
    pub node_id: NodeId,
    /// Scopes the node is entitled to.
    pub scopes: BTreeSet<String>,
    /// Authority tick sealed at start.
    pub from_tick: Tick,
    /// The node's pull baseline.
    pub since_tick: Tick,
    /// Whether the node asked to be served first.
    pub urgent: bool,
}

/// A node waiting for a capacity slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedNode {
    /// Waiting node.
    pub node_id: NodeId,
    /// Set once any request from the node was urgent.
    pub urgent: bool,
    /// The node's pull baseline from its latest request.
    pub since_tick: Tick,
    /// Arrival order, for ties.
    pub arrival: u64,
    /// Latest request from the node.
    pub last_seen: Instant,
}

impl QueuedNode {
    /// Urgent nodes first, then the stalest baseline, then first come.
    fn priority(&self) -> (bool, Tick, u64) {
        (!self.urgent, self.since_tick, self.arrival)
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, SessionRecord>,
    by_node: HashMap<NodeId, SessionId>,
    queue: HashMap<NodeId, QueuedNode>,
    arrivals: u64,
}

impl RegistryState {
    fn open_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_open()).count()
    }

    fn front(&self) -> Option<&QueuedNode> {
        self.queue.values().min_by_key(|q| q.priority())
    }
}

/// All sessions known to the authority.
///
/// At most one open session exists per node; starting a second one while
/// the first is open is refused with [`StartStatus::AlreadyActive`].
///
/// Nodes that cannot start join a queue. A node keeps its place by asking
/// again; only the node at the front may take a free slot. A front node
/// that finds no free slot is told [`StartStatus::Busy`], the others
/// [`StartStatus::Queued`].
#[derive(Default)]
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session unless the node already has one open, another
    /// node is ahead of it in the queue, or the authority is at `capacity`.
    pub fn register(&self, new: NewSession, capacity: usize, now: Instant) -> Result<SessionId, StartStatus> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        if let Some(existing) = state.by_node.get(&new.node_id) {
            if state.sessions.get(existing).is_some_and(SessionRecord::is_open) {
                return Err(StartStatus::AlreadyActive);
            }
        }

        if !state.queue.contains_key(&new.node_id) {
            state.arrivals += 1;
            let queued = QueuedNode {
                node_id: new.node_id.clone(),
                urgent: false,
                since_tick: new.since_tick,
                arrival: state.arrivals,
                last_seen: now,
            };
            state.queue.insert(new.node_id.clone(), queued);
        }
        if let Some(queued) = state.queue.get_mut(&new.node_id) {
            queued.urgent |= new.urgent;
            queued.since_tick = new.since_tick;
            queued.last_seen = now;
        }

        if state.front().is_some_and(|front| front.node_id != new.node_id) {
            return Err(StartStatus::Queued);
        }
        if state.open_count() >= capacity {
            return Err(StartStatus::Busy);
        }
        state.queue.remove(&new.node_id);
        let id = SessionId::generate();
        state.by_node.insert(new.node_id.clone(), id);
        state.sessions.insert(
            id,
            SessionRecord {
                id,
                node_id: new.node_id,
                scopes: new.scopes,
                phase: SessionPhase::Init,
                from_tick: new.from_tick,
                since_tick: new.since_tick,
                pull_until: None,
                persisted_at: None,
                refused: 0,
                error: None,
                started_at: now,
                last_activity: now,
            },
        );
        Ok(id)
    }

    /// Looks up a session for a new request, touching its activity time.
    ///
    /// Fails if the session is unknown, errored, completed, or older than
    /// `timeout`; a timed-out session is marked errored.
    pub fn connect(&self, id: SessionId, now: Instant, timeout: Option<Duration>) -> ServerResult<SessionRecord> {
        let mut state = self.state.write();
        let session = state.sessions.get_mut(&id).ok_or(ServerError::SessionNotFound(id))?;
        if session.error.is_none() && timeout.is_some_and(|t| now.duration_since(session.started_at) > t) {
            session.error = Some(format!("sync session {id} timed out"));
            session.phase = SessionPhase::Failed;
        }
        if let Some(reason) = &session.error {
            return Err(ServerError::SessionErrored {
                session: id,
                reason: reason.clone(),
            });
        }
        if matches!(session.phase, SessionPhase::Done | SessionPhase::Aborted) {
            return Err(ServerError::SessionCompleted(id));
        }
        session.last_activity = now;
        Ok(session.clone())
    }

    /// Runs `f` against a session's record.
    pub fn update<T>(&self, id: SessionId, f: impl FnOnce(&mut SessionRecord) -> ServerResult<T>) -> ServerResult<T> {
        let mut state = self.state.write();
        let session = state.sessions.get_mut(&id).ok_or(ServerError::SessionNotFound(id))?;
        f(session)
    }

    /// Closes a session in a terminal phase and frees its node.
    pub fn close(&self, id: SessionId, phase: SessionPhase) -> Option<SessionRecord> {
        let mut state = self.state.write();
        let session = state.sessions.get_mut(&id)?;
        session.phase = phase;
        let closed = session.clone();
        if state.by_node.get(&closed.node_id) == Some(&id) {
            state.by_node.remove(&closed.node_id);
        }
        Some(closed)
    }

    /// Marks a session errored.
    pub fn fail(&self, id: SessionId, reason: impl Into<String>) {
        let mut state = self.state.write();
        if let Some(session) = state.sessions.get_mut(&id) {
            session.error = Some(reason.into());
            session.phase = SessionPhase::Failed;
        }
    }

    /// Removes sessions idle for longer than `lapse`, open or not, and
    /// queued nodes that stopped asking for as long.
    pub fn purge_lapsed(&self, now: Instant, lapse: Duration) -> Vec<SessionId> {
        let mut state = self.state.write();
        state.queue.retain(|_, q| now.duration_since(q.last_seen) <= lapse);
        let lapsed: Vec<SessionId> = state
            .sessions
            .values()
            .filter(|s| now.duration_since(s.last_activity) > lapse)
            .map(|s| s.id)
            .collect();
        for id in &lapsed {
            if let Some(session) = state.sessions.remove(id) {
                if state.by_node.get(&session.node_id) == Some(id) {
                    state.by_node.remove(&session.node_id);
                }
            }
        }
        lapsed
    }

    /// A copy of a session's record.
    pub fn get(&self, id: SessionId) -> Option<SessionRecord> {
        self.state.read().sessions.get(&id).cloned()
    }

    /// Sessions currently holding a capacity slot.
    pub fn open_count(&self) -> usize {
        self.state.read().open_count()
    }

    /// Waiting nodes in the order they will be served.
    pub fn queue(&self) -> Vec<QueuedNode> {
        let mut queue: Vec<QueuedNode> = self.state.read().queue.values().cloned().collect();
        queue.sort_by_key(QueuedNode::priority);
        queue
    }

    /// Sessions known, open or closed.
    pub fn len(&self) -> usize {
        self.state.read().sessions.len()
    }

    /// Returns true if no sessions are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ticks at which each node's pushes were persisted.
///
/// Records stamped with one of a node's own push ticks never count as
/// conflicting with that node's later pushes.
#[derive(Default)]
pub struct PushLedger {
    ticks: RwLock<HashMap<NodeId, BTreeSet<Tick>>>,
}

impl PushLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a persisted push.
    pub fn record(&self, node: &NodeId, tick: Tick) {
        self.ticks.write().entry(node.clone()).or_default().insert(tick);
    }

    /// The node's persisted push ticks.
    pub fn ticks_for(&self, node: &NodeId) -> BTreeSet<Tick> {
        self.ticks.read().get(node).cloned().unwrap_or_default()
    }

    /// Forgets ticks at or below `tick`; the node has pulled past them.
    pub fn prune(&self, node: &NodeId, tick: Tick) {
        if let Some(ticks) = self.ticks.write().get_mut(node) {
            ticks.retain(|t| *t > tick);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session(node: &str) -> NewSession {
        NewSession {
            node_id: node.into(),
            scopes: BTreeSet::from(["facility-a".to_owned()]),
            from_tick: 5,
            since_tick: -1,
            urgent: false,
        }
    }

    fn waiting(node: &str, since_tick: Tick, urgent: bool) -> NewSession {
        NewSession {
            since_tick,
            urgent,
            ..new_session(node)
        }
    }

    #[test]
    fn one_open_session_per_node() {
        let registry = SessionRegistry::new();
        let now = Instant::now();
        let first = registry.register(new_session("f1"), 10, now).unwrap();
        assert_eq!(registry.register(new_session("f1"), 10, now), Err(StartStatus::AlreadyActive));

        registry.close(first, SessionPhase::Done);
        assert!(registry.register(new_session("f1"), 10, now).is_ok());
    }

    #[test]
    fn capacity_counts_open_sessions_only() {
        let registry = SessionRegistry::new();
        let now = Instant::now();
        let a = registry.register(new_session("a"), 2, now).unwrap();
        registry.register(new_session("b"), 2, now).unwrap();
        assert_eq!(registry.register(new_session("c"), 2, now), Err(StartStatus::Busy));

        registry.fail(a, "disk full");
        assert!(registry.register(new_session("c"), 2, now).is_ok());
        assert_eq!(registry.open_count(), 2);
    }

    #[test]
    fn queue_serves_the_stalest_baseline_first() {
        let registry = SessionRegistry::new();
        let now = Instant::now();
        let running = registry.register(new_session("a"), 1, now).unwrap();
        for (node, since) in [("b", 100), ("c", 200), ("d", 300), ("e", 10)] {
            assert!(registry.register(waiting(node, since, false), 1, now).is_err());
        }
        let order: Vec<String> = registry.queue().iter().map(|q| q.node_id.as_str().to_owned()).collect();
        assert_eq!(order, ["e", "b", "c", "d"]);

        registry.close(running, SessionPhase::Done);
        assert_eq!(registry.register(waiting("d", 300, false), 1, now), Err(StartStatus::Queued));
        assert!(registry.register(waiting("e", 10, false), 1, now).is_ok());
        assert_eq!(registry.queue().len(), 3);
    }

    #[test]
    fn urgent_requests_jump_the_queue_and_stay_urgent() {
        let registry = SessionRegistry::new();
        let now = Instant::now();
        let running = registry.register(new_session("a"), 1, now).unwrap();
        assert_eq!(registry.register(waiting("b", 100, false), 1, now), Err(StartStatus::Busy));
        assert_eq!(registry.register(waiting("c", 200, true), 1, now), Err(StartStatus::Busy));
        assert_eq!(registry.register(waiting("e", 10, false), 1, now), Err(StartStatus::Queued));

        registry.close(running, SessionPhase::Done);
        assert_eq!(registry.register(waiting("e", 10, false), 1, now), Err(StartStatus::Queued));
        // The earlier urgent flag sticks even though this request is not urgent.
        assert!(registry.register(waiting("c", 200, false), 1, now).is_ok());
    }

    #[test]
    fn nodes_that_stop_asking_leave_the_queue() {
        let registry = SessionRegistry::new();
        let start = Instant::now();
        let running = registry.register(new_session("a"), 1, start).unwrap();
        assert!(registry.register(waiting("b", 1, true), 1, start).is_err());
        let later = start + Duration::from_secs(10);
        assert_eq!(registry.register(waiting("c", 50, false), 1, later), Err(StartStatus::Queued));

        registry.close(running, SessionPhase::Done);
        registry.purge_lapsed(later, Duration::from_secs(5));
        assert!(registry.register(waiting("c", 50, false), 1, later).is_ok());
    }

    #[test]
    fn connect_rejects_closed_and_errored_sessions() {
        let registry = SessionRegistry::new();
        let now = Instant::now();
        let done = registry.register(new_session("a"), 10, now).unwrap();
        registry.close(done, SessionPhase::Done);
        assert!(matches!(
            registry.connect(done, now, None),
            Err(ServerError::SessionCompleted(_))
        ));

        let failed = registry.register(new_session("b"), 10, now).unwrap();
        registry.fail(failed, "boom");
        assert!(matches!(
            registry.connect(failed, now, None),
            Err(ServerError::SessionErrored { .. })
        ));

        assert!(matches!(
            registry.connect(SessionId::generate(), now, None),
            Err(ServerError::SessionNotFound(_))
        ));
    }

    #[test]
    fn connect_times_out_long_sessions() {
        let registry = SessionRegistry::new();
        let start = Instant::now();
        let id = registry.register(new_session("a"), 10, start).unwrap();
        assert!(registry.connect(id, start + Duration::from_millis(50), Some(Duration::from_secs(1))).is_ok());

        let late = start + Duration::from_secs(2);
        let err = registry.connect(id, late, Some(Duration::from_secs(1))).unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn purge_removes_idle_sessions() {
        let registry = SessionRegistry::new();
        let start = Instant::now();
        let idle = registry.register(new_session("a"), 10, start).unwrap();
        let busy = registry.register(new_session("b"), 10, start).unwrap();
        registry.connect(busy, start + Duration::from_secs(9), None).unwrap();

        let purged = registry.purge_lapsed(start + Duration::from_secs(10), Duration::from_secs(5));
        assert_eq!(purged, vec![idle]);
        assert!(registry.get(idle).is_none());
        assert!(registry.register(new_session("a"), 10, start).is_ok());
    }

    #[test]
    fn advance_follows_the_state_machine() {
        let registry = SessionRegistry::new();
        let id = registry.register(new_session("a"), 10, Instant::now()).unwrap();
        registry
            .update(id, |s| s.advance(SessionPhase::Pushing, "advance"))
            .unwrap();
        let err = registry
            .update(id, |s| s.advance(SessionPhase::Pulling, "advance"))
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidPhase { phase: SessionPhase::Pushing, .. }));
    }

    #[test]
    fn ledger_prunes_pulled_ticks() {
        let ledger = PushLedger::new();
        let node = NodeId::from("f1");
        ledger.record(&node, 4);
        ledger.record(&node, 9);
        ledger.prune(&node, 5);
        assert_eq!(ledger.ticks_for(&node), BTreeSet::from([9]));
        assert!(ledger.ticks_for(&NodeId::from("other")).is_empty());
    }
}
