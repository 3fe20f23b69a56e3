//! # Outpost Sync Server
//!
//! The central sync authority for Outpost.
//!
//! This crate provides:
//! - Session handling (start, advance, end, abort) with one open session per node
//! - Push staging, conflict checking and dependency-ordered persistence
//! - Scoped, chunked pull snapshots served page by page
//! - Lapsed-session purging
//!
//! # Clock
//!
//! The authority seals its clock when a session starts and again when a
//! pull is planned, so every tick handed to a node is closed to further
//! writes. Pushes are persisted at a tick allocated with a tick-tock: the
//! tick belongs to that push alone, and direct authority writes continue at
//! the tock.
//!
//! # Protocol
//!
//! 1. Node starts a session and reports `PUSHING`
//! 2. Node pushes its changes in batches; the last batch is validated and persisted
//! 3. Node reports `PULL_PLANNING` and asks for a pull snapshot
//! 4. Node pages through the snapshot, one type at a time
//! 5. Node applies, reports `APPLYING` then `COMMITTING`, and ends the session

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod server;
mod session;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use server::SyncServer;
pub use session::{NewSession, PushLedger, QueuedNode, SessionRecord, SessionRegistry};
