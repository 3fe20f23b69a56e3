//! # Outpost Core
//!
//! Storage-agnostic replication core for Outpost.
//!
//! This crate provides:
//! - A per-node logical clock kept in the fact table
//! - The tick-stamping write gateway and change event bus
//! - The type registry with direction policy and dependency order
//! - Scope maintenance over a derived ownership index
//! - Adaptive chunk planning for large record sets
//! - Session-scoped snapshot staging and builders
//! - The dependency-ordered apply engine
//! - The session-granular conflict guard
//!
//! ## Key Invariants
//!
//! - `updated_at_sync_tick` never moves backwards for a record
//! - All local writes between two syncs share one tick
//! - Types are applied strictly in dependency order
//! - Applying the same staged entry twice changes nothing
//! - Every planned chunk holds at most `max_chunk_size` rows
//!
//! This crate performs no network I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply;
mod chunk;
mod clock;
mod config;
mod conflict;
mod error;
mod events;
mod outgoing;
mod record;
mod registry;
mod scope;
mod snapshot;
mod stamper;
mod store;
mod types;

pub use apply::{ApplyEngine, ApplyOptions, ApplyReport, BatchPolicy, RecordValidator, RejectedRecord};
pub use chunk::{
    ChunkPlan, ChunkPlanner, ChunkSource, IdRange, IdStats, NumericChunkPlanner, NumericRange,
    PlannedChunk, PrefixBucket,
};
pub use clock::{LogicalClock, FACT_CURRENT_TICK, FACT_LAST_PULL, FACT_LAST_PUSH, INITIAL_TICK};
pub use config::CoreConfig;
pub use conflict::ConflictGuard;
pub use error::{CoreError, CoreResult};
pub use events::{ChangeEvent, ChangeKind, ChangeSubscriber, EventBus};
pub use outgoing::{PullSpec, PullSummary, SnapshotBuilder, TypeSummary};
pub use record::{changed_fields, field_str, now_millis, payload_from_value, Payload, SyncRecord};
pub use registry::{
    DeletionMode, Relationship, ScopeRule, SyncDirection, TypeDefinition, TypeRegistry,
    TypeRegistryBuilder,
};
pub use scope::{DerivedScopeIndex, ScopeMaintainer};
pub use snapshot::{SnapshotDirection, SnapshotEntry, SnapshotPage, SnapshotStore};
pub use stamper::{RecordDraft, StampedWriter, WriteGateway};
pub use store::{Database, Transaction};
pub use types::{NodeId, RecordId, RecordKey, RecordType, SessionId, Tick, TickWindow, NEVER_SYNCED};
