//! # Outpost Sync Protocol
//!
//! Wire types and CBOR framing for Outpost sync.
//!
//! This crate provides:
//! - Session messages (start, advance, end, abort)
//! - Push and chunked pull messages
//! - The session phase shared by both ends
//! - Node status and manual trigger payloads
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod messages;
mod phase;
mod status;

pub use codec::{from_cbor, to_cbor};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    AbortSessionRequest, AdvanceSessionRequest, AdvanceSessionResponse, EndSessionRequest,
    ErrorCode, ErrorResponse, InitiatePullRequest, PullPlan, PullRequest, PullResponse,
    PushRequest, PushResponse, SessionClosed, StartSessionRequest, StartSessionResponse,
    StartStatus, SyncMessage, TypePlan, WireRecord, PROTOCOL_VERSION,
};
pub use phase::SessionPhase;
pub use status::{SyncStatus, TriggerOutcome};
