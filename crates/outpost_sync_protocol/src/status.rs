//! Node status and manual trigger payloads.

use outpost_core::Tick;
use serde::{Deserialize, Serialize};

/// Sync status of a node, as reported to operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Whether a session is running now.
    pub is_sync_running: bool,
    /// Authority tick pulled up to by the last completed session.
    pub last_completed_tick: Option<Tick>,
    /// Wall-clock completion time of the last session (unix millis).
    pub last_completed_at: Option<u64>,
    /// Duration of the last completed session.
    pub last_completed_duration_ms: Option<u64>,
    /// Elapsed time of the running session.
    pub current_duration_ms: Option<u64>,
}

/// Response to a manual sync trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "TriggerMessage", try_from = "TriggerMessage")]
pub enum TriggerOutcome {
    /// A session was already running; nothing was started.
    AlreadyRunning,
    /// The triggered session finished within the wait window.
    Completed,
    /// The triggered session is still running.
    ContinuingInBackground,
}

impl TriggerOutcome {
    /// Operator-facing message.
    pub fn message(self) -> &'static str {
        match self {
            TriggerOutcome::AlreadyRunning => "already running",
            TriggerOutcome::Completed => "completed",
            TriggerOutcome::ContinuingInBackground => "continuing in background",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TriggerMessage {
    message: String,
}

impl From<TriggerOutcome> for TriggerMessage {
    fn from(outcome: TriggerOutcome) -> Self {
        Self {
            message: outcome.message().to_owned(),
        }
    }
}

impl TryFrom<TriggerMessage> for TriggerOutcome {
    type Error = String;

    fn try_from(value: TriggerMessage) -> Result<Self, Self::Error> {
        match value.message.as_str() {
            "already running" => Ok(TriggerOutcome::AlreadyRunning),
            "completed" => Ok(TriggerOutcome::Completed),
            "continuing in background" => Ok(TriggerOutcome::ContinuingInBackground),
            other => Err(format!("unknown trigger message {other:?}")),
        }
    }
}


