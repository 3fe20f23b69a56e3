//! CLI command implementations.

pub mod plan_chunks;
pub mod simulate;

use outpost_core::CoreError;
use outpost_sync_engine::SyncError;
use outpost_sync_server::ServerError;
use thiserror::Error;

/// Errors surfaced by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// A command-line argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Core failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Node failure.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Authority failure.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// Output serialization failure.
    #[error("failed to render output: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias for CLI commands.
pub type CliResult<T> = Result<T, CliError>;
