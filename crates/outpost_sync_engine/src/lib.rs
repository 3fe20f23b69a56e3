//! # Outpost Sync Engine
//!
//! The node side of Outpost replication: facility servers and devices run
//! this engine against the central authority.
//!
//! This crate provides:
//! - The session state machine (`INIT → PUSHING → … → DONE`) with conflict restarts
//! - A transport abstraction with an HTTP/CBOR implementation
//! - Chunked pull with per-type parallelism and an adaptive page size
//! - Retry with exponential backoff and jitter
//! - A single-flight scheduler with periodic runs and a manual trigger
//!
//! ## Session
//!
//! 1. The node seals its local cohort and adopts the authority's clock
//! 2. Changes since the last push are staged and pushed in batches
//! 3. The authority stages a pull snapshot; the node pages through it
//! 4. The pull is applied in dependency order, guarded against local
//!    changes made after the seal
//! 5. Both baselines advance in one transaction
//!
//! ## Key Invariants
//!
//! - At most one session per node at a time
//! - Baselines only move forward, and only on commit
//! - A fully fetched pull survives a failed apply and can be resumed
//! - Applying a pull twice changes nothing the second time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod http;
mod pull;
mod scheduler;
mod state;
mod transport;

pub use config::{PullConfig, RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use http::{
    HttpClient, HttpFailure, HttpResponse, HttpTransport, LoopbackClient, LoopbackServer, DEFAULT_OFFLINE_AFTER,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use pull::AdaptiveLimit;
pub use scheduler::SyncScheduler;
pub use state::{SyncEngine, SyncReport, SyncStats};
pub use transport::{MockTransport, SyncTransport};
