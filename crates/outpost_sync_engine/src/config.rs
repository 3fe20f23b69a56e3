//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use crate::http::DEFAULT_REQUEST_TIMEOUT;
use outpost_core::{CoreConfig, NodeId, RecordType};
use outpost_sync_protocol::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for a replicating node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// This node's identity at the authority.
    pub node_id: NodeId,
    /// Scopes (e.g. facility ids) this node replicates.
    pub scopes: Vec<String>,
    /// Authority URL, read by [`HttpTransport::from_config`](crate::HttpTransport::from_config).
    pub server_url: String,
    /// Protocol version.
    pub protocol_version: u16,
    /// Records per push request.
    pub push_batch_size: u32,
    /// Pull paging.
    pub pull: PullConfig,
    /// Restricts pulls to these types; `None` pulls every type the authority serves.
    pub pull_record_types: Option<Vec<RecordType>>,
    /// How many times a session that lost a race restarts before giving up.
    pub max_conflict_restarts: u32,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Interval for scheduled syncs.
    #[serde(with = "optional_millis", rename = "sync_interval_ms")]
    pub sync_interval: Option<Duration>,
    /// Per-request timeout handed to the HTTP client.
    #[serde(with = "millis", rename = "timeout_ms")]
    pub timeout: Duration,
    /// How long a manual trigger waits before answering "continuing in background".
    #[serde(with = "millis", rename = "manual_trigger_wait_ms")]
    pub manual_trigger_wait: Duration,
    /// Staging and apply settings.
    pub core: CoreConfig,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(node_id: impl Into<NodeId>, server_url: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Loads a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Configuration(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| SyncError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the replicated scopes.
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: u32) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the pull paging configuration.
    pub fn with_pull(mut self, pull: PullConfig) -> Self {
        self.pull = pull;
        self
    }

    /// Restricts pulls to the given types.
    pub fn with_pull_record_types(mut self, types: impl IntoIterator<Item = RecordType>) -> Self {
        self.pull_record_types = Some(types.into_iter().collect());
        self
    }

    /// Sets the conflict restart limit.
    pub fn with_max_conflict_restarts(mut self, restarts: u32) -> Self {
        self.max_conflict_restarts = restarts;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the sync interval for scheduled sync.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the manual trigger wait.
    pub fn with_manual_trigger_wait(mut self, wait: Duration) -> Self {
        self.manual_trigger_wait = wait;
        self
    }

    /// Replaces the core configuration.
    pub fn with_core(mut self, core: CoreConfig) -> Self {
        self.core = core;
        self
    }

    /// Checks the configuration. A missing chunk size is fatal.
    pub fn validate(&self) -> SyncResult<()> {
        self.core.validate()?;
        if self.node_id.as_str().is_empty() {
            return Err(SyncError::Configuration("node_id is required".into()));
        }
        if self.timeout.is_zero() {
            return Err(SyncError::Configuration("timeout must be positive".into()));
        }
        if self.push_batch_size == 0 {
            return Err(SyncError::Configuration("push_batch_size must be at least 1".into()));
        }
        self.pull.validate()?;
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Configuration("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from(""),
            scopes: Vec::new(),
            server_url: String::new(),
            protocol_version: PROTOCOL_VERSION,
            push_batch_size: 100,
            pull: PullConfig::default(),
            pull_record_types: None,
            max_conflict_restarts: 3,
            retry: RetryConfig::default(),
            sync_interval: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            manual_trigger_wait: Duration::from_secs(10),
            core: CoreConfig::default(),
        }
    }
}

/// Pull paging.
///
/// Page size adapts to observed latency: each page is sized so that it
/// should take about `target_page_duration`, moving by at most
/// `max_change_per_page` of the current size and staying within
/// `[min_limit, max_limit]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullConfig {
    /// Size of the first page of each type.
    pub initial_limit: u32,
    /// Smallest page ever requested.
    pub min_limit: u32,
    /// Largest page ever requested.
    pub max_limit: u32,
    /// Wanted duration of one page round trip.
    #[serde(with = "millis", rename = "target_page_duration_ms")]
    pub target_page_duration: Duration,
    /// Largest relative change between consecutive pages.
    pub max_change_per_page: f64,
    /// Record types paged in parallel.
    pub concurrency: usize,
}

impl PullConfig {
    /// A fixed page size, for tests and constrained links.
    pub fn fixed(limit: u32) -> Self {
        Self {
            initial_limit: limit,
            min_limit: limit,
            max_limit: limit,
            ..Self::default()
        }
    }

    /// Sets the number of types paged in parallel.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    fn validate(&self) -> SyncResult<()> {
        if self.min_limit == 0 || self.min_limit > self.max_limit {
            return Err(SyncError::Configuration(format!(
                "pull limits must satisfy 1 <= min_limit ({}) <= max_limit ({})",
                self.min_limit, self.max_limit
            )));
        }
        if !(self.min_limit..=self.max_limit).contains(&self.initial_limit) {
            return Err(SyncError::Configuration(format!(
                "pull.initial_limit {} is outside [{}, {}]",
                self.initial_limit, self.min_limit, self.max_limit
            )));
        }
        if self.concurrency == 0 {
            return Err(SyncError::Configuration("pull.concurrency must be at least 1".into()));
        }
        if self.target_page_duration.is_zero() || self.max_change_per_page.is_nan() || self.max_change_per_page <= 0.0 {
            return Err(SyncError::Configuration(
                "pull.target_page_duration and pull.max_change_per_page must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            initial_limit: 100,
            min_limit: 1,
            max_limit: 500,
            target_page_duration: Duration::from_millis(2000),
            max_change_per_page: 0.3,
            concurrency: 4,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first included.
    pub max_attempts: u32,
    /// Initial delay between retries.
    #[serde(with = "millis", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    #[serde(with = "millis", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before `attempt` (0-indexed; attempt 0 has none).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let mut delay_ms = base.min(self.max_delay.as_millis() as f64);

        if self.add_jitter {
            // Up to 25% extra.
            delay_ms += delay_ms * 0.25 * jitter_fraction();
        }
        Duration::from_millis(delay_ms.round() as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// A fraction in `[0, 1)` taken from the clock's sub-second nanos.
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
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


