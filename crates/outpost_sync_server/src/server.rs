//! The sync authority facade.

use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::handler::{HandlerContext, RequestHandler};
use crate::session::SessionRecord;
use outpost_core::{
    CoreResult, Database, LogicalClock, ScopeMaintainer, SessionId, StampedWriter, TypeRegistry,
};
use outpost_sync_protocol::{
    AbortSessionRequest, AdvanceSessionRequest, AdvanceSessionResponse, EndSessionRequest, InitiatePullRequest,
    ProtocolResult, PullPlan, PullRequest, PullResponse, PushRequest, PushResponse, SessionClosed,
    StartSessionRequest, StartSessionResponse, SyncMessage,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

/// The sync authority.
///
/// Holds the authoritative store and serves many nodes' sessions at once.
/// Each session stages into its own area of the snapshot store, so
/// sessions for different nodes never share staging.
///
/// # Example
///
/// ```
/// use outpost_core::{SyncDirection, TypeDefinition, TypeRegistry};
/// use outpost_sync_server::{ServerConfig, SyncServer};
/// use std::sync::Arc;
///
/// let registry = TypeRegistry::builder()
///     .register(TypeDefinition::new("facilities", SyncDirection::PullOnly))
///     .build()
///     .unwrap();
/// let server = SyncServer::new(ServerConfig::new(100_000), Arc::new(registry)).unwrap();
/// assert_eq!(server.open_sessions(), 0);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates an authority over a fresh store. Fails on invalid configuration.
    pub fn new(config: ServerConfig, registry: Arc<TypeRegistry>) -> ServerResult<Self> {
        Self::from_context(HandlerContext::new(config, registry)?)
    }

    /// Creates an authority over an existing store.
    pub fn with_database(config: ServerConfig, db: Arc<Database>) -> ServerResult<Self> {
        Self::from_context(HandlerContext::with_database(config, db)?)
    }

    fn from_context(context: HandlerContext) -> ServerResult<Self> {
        let context = Arc::new(context);
        let handler = RequestHandler::new(Arc::clone(&context));
        Ok(Self { handler, context })
    }

    /// Handles a session start request.
    pub fn handle_start(&self, request: StartSessionRequest) -> ServerResult<StartSessionResponse> {
        self.handler.handle_start(request)
    }

    /// Handles a phase report.
    pub fn handle_advance(&self, request: AdvanceSessionRequest) -> ServerResult<AdvanceSessionResponse> {
        self.handler.handle_advance(request)
    }

    /// Handles a push batch.
    pub fn handle_push(&self, request: PushRequest) -> ServerResult<PushResponse> {
        self.handler.handle_push(request)
    }

    /// Handles a pull snapshot request.
    pub fn handle_initiate_pull(&self, request: InitiatePullRequest) -> ServerResult<PullPlan> {
        self.handler.handle_initiate_pull(request)
    }

    /// Handles a pull page request.
    pub fn handle_pull(&self, request: PullRequest) -> ServerResult<PullResponse> {
        self.handler.handle_pull(request)
    }

    /// Handles a successful session end.
    pub fn handle_end(&self, request: EndSessionRequest) -> ServerResult<SessionClosed> {
        self.handler.handle_end(request)
    }

    /// Handles a session abandonment.
    pub fn handle_abort(&self, request: AbortSessionRequest) -> ServerResult<SessionClosed> {
        self.handler.handle_abort(request)
    }

    /// Handles a sync message (dispatches to the appropriate handler).
    ///
    /// Failures come back as [`SyncMessage::Error`].
    pub fn handle_message(&self, message: SyncMessage) -> SyncMessage {
        let result = match message {
            SyncMessage::StartSession(req) => self.handle_start(req).map(SyncMessage::SessionStarted),
            SyncMessage::AdvanceSession(req) => self.handle_advance(req).map(SyncMessage::SessionAdvanced),
            SyncMessage::Push(req) => self.handle_push(req).map(SyncMessage::PushAck),
            SyncMessage::InitiatePull(req) => self.handle_initiate_pull(req).map(SyncMessage::PullPlanned),
            SyncMessage::Pull(req) => self.handle_pull(req).map(SyncMessage::PullPage),
            SyncMessage::EndSession(req) => self.handle_end(req).map(SyncMessage::SessionClosed),
            SyncMessage::AbortSession(req) => self.handle_abort(req).map(SyncMessage::SessionClosed),
            other => Err(crate::error::ServerError::InvalidRequest(format!(
                "{} is not a request",
                other.name()
            ))),
        };
        result.unwrap_or_else(|err| {
            if !err.is_client_error() {
                warn!(error = %err, "sync request failed");
            }
            SyncMessage::Error(err.to_response())
        })
    }

    /// Decodes a CBOR request, handles it and encodes the response.
    pub fn handle_bytes(&self, request: &[u8]) -> ProtocolResult<Vec<u8>> {
        let message = SyncMessage::decode(request)?;
        self.handle_message(message).encode()
    }

    /// Purges sessions idle past the lapse timeout. Returns how many.
    pub fn purge_lapsed_sessions(&self) -> usize {
        self.handler.purge_lapsed_sessions()
    }

    /// Spawns a task purging lapsed sessions every `lapse_check_interval`.
    ///
    /// The task stops once the server is dropped.
    pub fn spawn_lapse_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let server = Arc::downgrade(self);
        let period = self.context.config.lapse_check_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                match server.upgrade() {
                    Some(server) => {
                        server.purge_lapsed_sessions();
                    }
                    None => break,
                }
            }
        })
    }

    /// Runs a direct write on the authority, stamped at its current tick.
    ///
    /// This is the only way to write outside a session. It is serialized
    /// against session seals, so a write never lands at a sealed baseline.
    pub fn write<F, T>(&self, f: F) -> ServerResult<T>
    where
        F: FnOnce(&mut StampedWriter<'_, '_>) -> CoreResult<T>,
    {
        self.context.write(f)
    }

    /// The authoritative store.
    pub fn database(&self) -> &Arc<Database> {
        &self.context.db
    }

    /// The authority's clock.
    pub fn clock(&self) -> &LogicalClock {
        &self.context.clock
    }

    /// The scope index.
    pub fn scope(&self) -> &Arc<ScopeMaintainer> {
        &self.context.scope
    }

    /// A session's state, if still known.
    pub fn session(&self, id: SessionId) -> Option<SessionRecord> {
        self.context.sessions().get(id)
    }

    /// Sessions currently holding a capacity slot.
    pub fn open_sessions(&self) -> usize {
        self.context.sessions().open_count()
    }
}


