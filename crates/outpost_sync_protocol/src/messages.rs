//! Protocol messages for sync.
//!
//! Every exchange is request/response and scoped to one session. A node
//! starts a session, reports its phase as it moves through the state
//! machine, pushes its changes in batches, asks the authority to stage a
//! pull snapshot and then pages through it one record type at a time.

use crate::codec::{from_cbor, to_cbor};
use crate::error::{ProtocolError, ProtocolResult};
use crate::phase::SessionPhase;
use outpost_core::{NodeId, Payload, RecordId, RecordType, SessionId, SnapshotEntry, Tick};
use serde::{Deserialize, Serialize};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 1;

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Session start request.
    StartSession(StartSessionRequest),
    /// Session start response.
    SessionStarted(StartSessionResponse),
    /// Phase report.
    AdvanceSession(AdvanceSessionRequest),
    /// Phase acknowledgment.
    SessionAdvanced(AdvanceSessionResponse),
    /// Push batch.
    Push(PushRequest),
    /// Push acknowledgment.
    PushAck(PushResponse),
    /// Pull snapshot request.
    InitiatePull(InitiatePullRequest),
    /// Pull snapshot metadata.
    PullPlanned(PullPlan),
    /// Pull page request.
    Pull(PullRequest),
    /// Pull page.
    PullPage(PullResponse),
    /// Successful session end.
    EndSession(EndSessionRequest),
    /// Session abandonment.
    AbortSession(AbortSessionRequest),
    /// Session closed acknowledgment.
    SessionClosed(SessionClosed),
    /// Failure response.
    Error(ErrorResponse),
}

impl SyncMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncMessage::StartSession(_) => 1,
            SyncMessage::SessionStarted(_) => 2,
            SyncMessage::AdvanceSession(_) => 3,
            SyncMessage::SessionAdvanced(_) => 4,
            SyncMessage::Push(_) => 5,
            SyncMessage::PushAck(_) => 6,
            SyncMessage::InitiatePull(_) => 7,
            SyncMessage::PullPlanned(_) => 8,
            SyncMessage::Pull(_) => 9,
            SyncMessage::PullPage(_) => 10,
            SyncMessage::EndSession(_) => 11,
            SyncMessage::AbortSession(_) => 12,
            SyncMessage::SessionClosed(_) => 13,
            SyncMessage::Error(_) => 255,
        }
    }

    /// Short name of the message kind, for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            SyncMessage::StartSession(_) => "start_session",
            SyncMessage::SessionStarted(_) => "session_started",
            SyncMessage::AdvanceSession(_) => "advance_session",
            SyncMessage::SessionAdvanced(_) => "session_advanced",
            SyncMessage::Push(_) => "push",
            SyncMessage::PushAck(_) => "push_ack",
            SyncMessage::InitiatePull(_) => "initiate_pull",
            SyncMessage::PullPlanned(_) => "pull_planned",
            SyncMessage::Pull(_) => "pull",
            SyncMessage::PullPage(_) => "pull_page",
            SyncMessage::EndSession(_) => "end_session",
            SyncMessage::AbortSession(_) => "abort_session",
            SyncMessage::SessionClosed(_) => "session_closed",
            SyncMessage::Error(_) => "error",
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }

    /// Builds the error for a response of the wrong kind.
    pub fn unexpected(&self, expected: &'static str) -> ProtocolError {
        ProtocolError::UnexpectedMessage {
            expected,
            got: self.name(),
        }
    }
}

/// One record on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    /// Record type.
    pub record_type: RecordType,
    /// Record id.
    pub record_id: RecordId,
    /// Field values.
    pub data: Payload,
    /// Whether the record is a tombstone.
    pub is_deleted: bool,
    /// Deletion time on the sending node, in Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<u64>,
    /// The record's tick on the sending node.
    pub updated_at_sync_tick: Tick,
}

impl WireRecord {
    /// Converts to a snapshot entry for staging on the receiver.
    pub fn into_entry(self) -> SnapshotEntry {
        SnapshotEntry {
            record_type: self.record_type,
            record_id: self.record_id,
            is_deleted: self.is_deleted,
            deleted_at: self.deleted_at,
            data: self.data,
            updated_at_sync_tick: self.updated_at_sync_tick,
            saved_at_sync_tick: None,
        }
    }
}

impl From<SnapshotEntry> for WireRecord {
    fn from(entry: SnapshotEntry) -> Self {
        Self {
            record_type: entry.record_type,
            record_id: entry.record_id,
            data: entry.data,
            is_deleted: entry.is_deleted,
            deleted_at: entry.deleted_at,
            updated_at_sync_tick: entry.updated_at_sync_tick,
        }
    }
}

/// Session start request from a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSessionRequest {
    /// Requesting node.
    pub node_id: NodeId,
    /// Protocol version the node speaks.
    pub protocol_version: u16,
    /// Scopes the node replicates.
    pub scopes: Vec<String>,
    /// Authority tick the node last pulled up to.
    pub last_pull_tick: Tick,
    /// Asks to be served ahead of non-urgent nodes when the authority is
    /// queueing.
    #[serde(default)]
    pub urgent: bool,
}

impl StartSessionRequest {
    /// Creates a start request for the current protocol version.
    pub fn new(node_id: NodeId, scopes: Vec<String>, last_pull_tick: Tick) -> Self {
        Self {
            node_id,
            protocol_version: PROTOCOL_VERSION,
            scopes,
            last_pull_tick,
            urgent: false,
        }
    }

    /// Marks the request urgent.
    pub fn with_urgent(mut self, urgent: bool) -> Self {
        self.urgent = urgent;
        self
    }
}

/// Outcome of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    /// A session was opened.
    Started,
    /// The node is first in line but the authority is at capacity; try
    /// again later.
    Busy,
    /// Other nodes are ahead in the authority's queue; try again later.
    Queued,
    /// The node already has an active session.
    AlreadyActive,
}

/// Session start response from the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSessionResponse {
    /// Outcome.
    pub status: StartStatus,
    /// The new session, when started.
    pub session_id: Option<SessionId>,
    /// The session's baseline: the authority tick sealed at start.
    pub from_tick: Tick,
    /// The authority's current tick.
    pub authority_tick: Tick,
}

impl StartSessionResponse {
    /// A started session.
    pub fn started(session_id: SessionId, from_tick: Tick, authority_tick: Tick) -> Self {
        Self {
            status: StartStatus::Started,
            session_id: Some(session_id),
            from_tick,
            authority_tick,
        }
    }

    /// A refusal.
    pub fn refused(status: StartStatus, authority_tick: Tick) -> Self {
        Self {
            status,
            session_id: None,
            from_tick: authority_tick,
            authority_tick,
        }
    }
}

/// Phase report from a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvanceSessionRequest {
    /// Session.
    pub session_id: SessionId,
    /// Phase the node is entering.
    pub phase: SessionPhase,
    /// The node's baseline tick for this phase.
    pub from_tick: Tick,
}

/// Phase acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvanceSessionResponse {
    /// Session.
    pub session_id: SessionId,
    /// Phase recorded by the authority.
    pub phase: SessionPhase,
    /// The authority's current tick.
    pub authority_tick: Tick,
}

/// Push batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Session.
    pub session_id: SessionId,
    /// Records in this batch.
    pub records: Vec<WireRecord>,
    /// True on the last batch: the authority validates and persists then.
    pub complete: bool,
}

/// Push acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Tick the push was persisted at, once complete and accepted.
    pub accepted_up_to_tick: Option<Tick>,
    /// True if the push lost a race and the session must restart.
    pub conflict: bool,
    /// Records staged so far in this session.
    pub staged: u64,
    /// Records the authority refused.
    pub rejected: u64,
}

impl PushResponse {
    /// Acknowledges an intermediate batch.
    pub fn staged(staged: u64) -> Self {
        Self {
            accepted_up_to_tick: None,
            conflict: false,
            staged,
            rejected: 0,
        }
    }

    /// Acknowledges a persisted push.
    pub fn accepted(tick: Tick, staged: u64, rejected: u64) -> Self {
        Self {
            accepted_up_to_tick: Some(tick),
            conflict: false,
            staged,
            rejected,
        }
    }

    /// Reports a conflict.
    pub fn conflict(staged: u64) -> Self {
        Self {
            accepted_up_to_tick: None,
            conflict: true,
            staged,
            rejected: 0,
        }
    }
}

/// Pull snapshot request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiatePullRequest {
    /// Session.
    pub session_id: SessionId,
    /// Authority tick the node last pulled up to.
    pub since_tick: Tick,
    /// Restricts the pull to these types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_types: Option<Vec<RecordType>>,
    /// Types to pull from the beginning of time.
    #[serde(default)]
    pub full_resync_types: Vec<RecordType>,
}

/// Per-type pull metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypePlan {
    /// Record type.
    pub record_type: RecordType,
    /// Staged entries.
    pub count: u64,
    /// Chunks read to stage them.
    pub chunks: u64,
}

/// Pull snapshot metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullPlan {
    /// Session.
    pub session_id: SessionId,
    /// Upper bound of the pull; becomes the node's next pull baseline.
    pub pull_until: Tick,
    /// Entries to pull across all types.
    pub total: u64,
    /// Types with staged entries, in dependency order.
    pub types: Vec<TypePlan>,
}

/// Pull page request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Session.
    pub session_id: SessionId,
    /// Lower bound the snapshot was staged with.
    pub since_tick: Tick,
    /// Type to read.
    pub record_type: RecordType,
    /// Last id of the previous page.
    pub cursor: Option<RecordId>,
    /// Page size the node can absorb.
    pub limit: u32,
}

/// Pull page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Entries in id order.
    pub entries: Vec<WireRecord>,
    /// True if the type is exhausted.
    pub done: bool,
    /// Cursor for the next page.
    pub next_cursor: Option<RecordId>,
}

/// Successful session end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndSessionRequest {
    /// Session.
    pub session_id: SessionId,
}

/// Session abandonment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortSessionRequest {
    /// Session.
    pub session_id: SessionId,
    /// Why the node gave up.
    pub reason: String,
}

/// Session closed acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClosed {
    /// Session.
    pub session_id: SessionId,
}

/// Failure categories reported by the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The session does not exist.
    SessionNotFound,
    /// The session expired for inactivity.
    SessionLapsed,
    /// The session already completed or failed.
    SessionClosed,
    /// The request does not fit the session's phase.
    InvalidPhase,
    /// The request was malformed or refers to unknown types.
    BadRequest,
    /// The authority is misconfigured.
    Configuration,
    /// Unexpected failure on the authority.
    Internal,
}

impl ErrorCode {
    /// Returns true if retrying (with a new session) can succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::SessionLapsed | ErrorCode::Internal)
    }
}

/// Failure response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Category.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorResponse {
    /// Creates an error response.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}


