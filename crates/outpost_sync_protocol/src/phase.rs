//! The session state machine shared by node and authority.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of a sync session.
///
/// ```text
/// INIT → PUSHING → PUSH_VALIDATING → PULL_PLANNING → PULLING* → APPLYING → COMMITTING → DONE
///                        │                                          │
///                        └──────────────→ ABORTED → INIT ←──────────┘
/// ```
///
/// Any phase may move to `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    /// No session running.
    Init,
    /// Sending local changes.
    Pushing,
    /// Waiting for the authority to validate and persist the push.
    PushValidating,
    /// Asking the authority to stage the pull snapshot.
    PullPlanning,
    /// Fetching pull pages.
    Pulling,
    /// Applying the staged pull.
    Applying,
    /// Advancing the node's baselines.
    Committing,
    /// Session completed.
    Done,
    /// Session lost a race and will restart.
    Aborted,
    /// Session failed.
    Failed,
}

impl SessionPhase {
    /// Upper-case phase name as used on the wire.
    pub fn name(self) -> &'static str {
        match self {
            SessionPhase::Init => "INIT",
            SessionPhase::Pushing => "PUSHING",
            SessionPhase::PushValidating => "PUSH_VALIDATING",
            SessionPhase::PullPlanning => "PULL_PLANNING",
            SessionPhase::Pulling => "PULLING",
            SessionPhase::Applying => "APPLYING",
            SessionPhase::Committing => "COMMITTING",
            SessionPhase::Done => "DONE",
            SessionPhase::Aborted => "ABORTED",
            SessionPhase::Failed => "FAILED",
        }
    }

    /// Returns true while a session occupies the node.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionPhase::Pushing
                | SessionPhase::PushValidating
                | SessionPhase::PullPlanning
                | SessionPhase::Pulling
                | SessionPhase::Applying
                | SessionPhase::Committing
        )
    }

    /// Returns true if a new session may start from this phase.
    pub fn can_start(self) -> bool {
        matches!(
            self,
            SessionPhase::Init | SessionPhase::Done | SessionPhase::Aborted | SessionPhase::Failed
        )
    }

    /// Returns true if the state machine allows moving to `next`.
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        match (self, next) {
            (Failed, Failed) => false,
            (_, Failed) => true,
            (Init | Done | Aborted | Failed, Init) => true,
            (Init, Pushing) => true,
            (Pushing, PushValidating) => true,
            (PushValidating, PullPlanning | Aborted) => true,
            (PullPlanning, Pulling) => true,
            (Pulling, Pulling | Applying) => true,
            (Applying, Committing | Aborted) => true,
            (Committing, Done) => true,
            _ => false,
        }
    }

    /// Validates and returns `next`.
    pub fn transition(self, next: SessionPhase) -> ProtocolResult<SessionPhase> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ProtocolError::InvalidTransition {
                from: self.name(),
                to: next.name(),
            })
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}


