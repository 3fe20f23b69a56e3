//! Server configuration.

use crate::error::{ServerError, ServerResult};
use outpost_core::CoreConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the sync authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Sessions allowed to be open at once; further starts wait in the
    /// session queue.
    pub max_concurrent_sessions: usize,
    /// Inactivity after which a session is considered lapsed and purged.
    #[serde(with = "millis", rename = "session_lapse_ms")]
    pub session_lapse_timeout: Duration,
    /// How often the background sweeper looks for lapsed sessions.
    #[serde(with = "millis", rename = "lapse_check_interval_ms")]
    pub lapse_check_interval: Duration,
    /// Total lifetime after which a session is marked errored.
    #[serde(with = "optional_millis", rename = "session_timeout_ms")]
    pub session_timeout: Option<Duration>,
    /// Upper bound on entries per pull page, whatever the node asks for.
    pub max_pull_page: u32,
    /// Upper bound on records per push request.
    pub max_push_batch: u32,
    /// Chunking and apply settings.
    pub core: CoreConfig,
}

impl ServerConfig {
    /// Creates a configuration with the given chunk size.
    pub fn new(max_chunk_size: usize) -> Self {
        Self {
            core: CoreConfig::new(max_chunk_size),
            ..Self::default()
        }
    }

    /// Loads a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> ServerResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|e| ServerError::InvalidRequest(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the session capacity.
    pub fn with_max_concurrent_sessions(mut self, max: usize) -> Self {
        self.max_concurrent_sessions = max;
        self
    }

    /// Sets the inactivity lapse.
    pub fn with_session_lapse_timeout(mut self, timeout: Duration) -> Self {
        self.session_lapse_timeout = timeout;
        self
    }

    /// Sets the total session lifetime.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Sets the pull page cap.
    pub fn with_max_pull_page(mut self, size: u32) -> Self {
        self.max_pull_page = size;
        self
    }

    /// Sets the push batch cap.
    pub fn with_max_push_batch(mut self, size: u32) -> Self {
        self.max_push_batch = size;
        self
    }

    /// Replaces the core configuration.
    pub fn with_core(mut self, core: CoreConfig) -> Self {
        self.core = core;
        self
    }

    /// Checks the configuration. A missing chunk size is fatal.
    pub fn validate(&self) -> ServerResult<()> {
        self.core.validate()?;
        if self.max_concurrent_sessions == 0 {
            return Err(ServerError::Core(outpost_core::CoreError::configuration(
                "max_concurrent_sessions must be at least 1",
            )));
        }
        if self.max_pull_page == 0 || self.max_push_batch == 0 {
            return Err(ServerError::Core(outpost_core::CoreError::configuration(
                "page and batch limits must be at least 1",
            )));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 16,
            session_lapse_timeout: Duration::from_secs(300),
            lapse_check_interval: Duration::from_secs(60),
            session_timeout: None,
            max_pull_page: 1000,
            max_push_batch: 1000,
            core: CoreConfig::default(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}


