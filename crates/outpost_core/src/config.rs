//! Configuration for the sync core.

use crate::apply::BatchPolicy;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// Configuration shared by the chunk planner, snapshot builder and apply engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Maximum rows per planned chunk. Required: there is no unbounded fallback.
    pub max_chunk_size: Option<usize>,
    /// Chunk reads issued in parallel while staging a pull snapshot.
    pub read_concurrency: usize,
    /// What happens to a type's batch when one of its records is invalid.
    pub batch_policy: BatchPolicy,
}

impl CoreConfig {
    /// Creates a configuration with the given chunk size.
    pub fn new(max_chunk_size: usize) -> Self {
        Self {
            max_chunk_size: Some(max_chunk_size),
            ..Self::default()
        }
    }

    /// Sets the chunk size.
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = Some(size);
        self
    }

    /// Sets the read concurrency.
    pub fn with_read_concurrency(mut self, concurrency: usize) -> Self {
        self.read_concurrency = concurrency;
        self
    }

    /// Sets the batch policy.
    pub fn with_batch_policy(mut self, policy: BatchPolicy) -> Self {
        self.batch_policy = policy;
        self
    }

    /// The configured chunk size, or a fatal configuration error.
    pub fn chunk_size(&self) -> CoreResult<usize> {
        match self.max_chunk_size {
            None => Err(CoreError::configuration("max_chunk_size is not configured")),
            Some(0) => Err(CoreError::configuration("max_chunk_size must be at least 1")),
            Some(size) => Ok(size),
        }
    }

    /// Checks the configuration; meant to run once at startup.
    pub fn validate(&self) -> CoreResult<()> {
        self.chunk_size()?;
        if self.read_concurrency == 0 {
            return Err(CoreError::configuration("read_concurrency must be at least 1"));
        }
        Ok(())
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: None,
            read_concurrency: 4,
            batch_policy: BatchPolicy::SkipInvalid,
        }
    }
}


