//! Progress events emitted at every session and sub-problem transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureReason;
use crate::state::SessionId;

/// All progress events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A session was accepted and its driver started.
    SessionStarted {
        session_id: SessionId,
        timestamp: DateTime<Utc>,
    },

    /// The problem was split into a validated sub-problem DAG.
    DecompositionComplete {
        session_id: SessionId,
        sub_problems: usize,
        complexity: f64,
        timestamp: DateTime<Utc>,
    },

    /// The session is waiting for answers to critical questions.
    Paused {
        session_id: SessionId,
        questions: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// Answers were merged and deliberation resumed.
    Resumed {
        session_id: SessionId,
        timestamp: DateTime<Utc>,
    },

    /// A sub-problem entered its round loop.
    SubProblemStarted {
        session_id: SessionId,
        sub_problem: usize,
        /// Started before every prerequisite completed.
        speculative: bool,
        timestamp: DateTime<Utc>,
    },

    /// One round finished and was judged.
    RoundComplete {
        session_id: SessionId,
        sub_problem: usize,
        round: u32,
        exploration: f64,
        convergence: f64,
        focus: f64,
        novelty: f64,
        decision: String,
        timestamp: DateTime<Utc>,
    },

    /// A sub-problem produced its result.
    SubProblemComplete {
        session_id: SessionId,
        sub_problem: usize,
        rounds: u32,
        degraded: bool,
        timestamp: DateTime<Utc>,
    },

    /// A sub-problem ended without a usable synthesis.
    SubProblemFailed {
        session_id: SessionId,
        sub_problem: usize,
        reason: FailureReason,
        timestamp: DateTime<Utc>,
    },

    /// The final report is available.
    Completed {
        session_id: SessionId,
        gaps: usize,
        degraded: bool,
        timestamp: DateTime<Utc>,
    },

    Failed {
        session_id: SessionId,
        reason: FailureReason,
        timestamp: DateTime<Utc>,
    },

    Killed {
        session_id: SessionId,
        timestamp: DateTime<Utc>,
    },

    /// Checkpoint writes failed; waiting for `resume`.
    Suspended {
        session_id: SessionId,
        reason: FailureReason,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ProgressEvent::SessionStarted { timestamp, .. }
            | ProgressEvent::DecompositionComplete { timestamp, .. }
            | ProgressEvent::Paused { timestamp, .. }
            | ProgressEvent::Resumed { timestamp, .. }
            | ProgressEvent::SubProblemStarted { timestamp, .. }
            | ProgressEvent::RoundComplete { timestamp, .. }
            | ProgressEvent::SubProblemComplete { timestamp, .. }
            | ProgressEvent::SubProblemFailed { timestamp, .. }
            | ProgressEvent::Completed { timestamp, .. }
            | ProgressEvent::Failed { timestamp, .. }
            | ProgressEvent::Killed { timestamp, .. }
            | ProgressEvent::Suspended { timestamp, .. } => *timestamp,
        }
    }

    /// Get the session this event belongs to
    pub fn session_id(&self) -> &str {
        match self {
            ProgressEvent::SessionStarted { session_id, .. }
            | ProgressEvent::DecompositionComplete { session_id, .. }
            | ProgressEvent::Paused { session_id, .. }
            | ProgressEvent::Resumed { session_id, .. }
            | ProgressEvent::SubProblemStarted { session_id, .. }
            | ProgressEvent::RoundComplete { session_id, .. }
            | ProgressEvent::SubProblemComplete { session_id, .. }
            | ProgressEvent::SubProblemFailed { session_id, .. }
            | ProgressEvent::Completed { session_id, .. }
            | ProgressEvent::Failed { session_id, .. }
            | ProgressEvent::Killed { session_id, .. }
            | ProgressEvent::Suspended { session_id, .. } => session_id,
        }
    }

    /// Sub-problem the event concerns, for sub-problem level events.
    pub fn sub_problem(&self) -> Option<usize> {
        match self {
            ProgressEvent::SubProblemStarted { sub_problem, .. }
            | ProgressEvent::RoundComplete { sub_problem, .. }
            | ProgressEvent::SubProblemComplete { sub_problem, .. }
            | ProgressEvent::SubProblemFailed { sub_problem, .. } => Some(*sub_problem),
            _ => None,
        }
    }

    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            ProgressEvent::SessionStarted { .. } => "session_started",
            ProgressEvent::DecompositionComplete { .. } => "decomposition_complete",
            ProgressEvent::Paused { .. } => "paused",
            ProgressEvent::Resumed { .. } => "resumed",
            ProgressEvent::SubProblemStarted { .. } => "sub_problem_started",
            ProgressEvent::RoundComplete { .. } => "round_complete",
            ProgressEvent::SubProblemComplete { .. } => "sub_problem_complete",
            ProgressEvent::SubProblemFailed { .. } => "sub_problem_failed",
            ProgressEvent::Completed { .. } => "completed",
            ProgressEvent::Failed { .. } => "failed",
            ProgressEvent::Killed { .. } => "killed",
            ProgressEvent::Suspended { .. } => "suspended",
        }
    }

    /// Whether this event ends the session's activity.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Paused { .. }
                | ProgressEvent::Completed { .. }
                | ProgressEvent::Failed { .. }
                | ProgressEvent::Killed { .. }
                | ProgressEvent::Suspended { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReasonCode;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = ProgressEvent::SubProblemFailed {
            session_id: "s-1".to_string(),
            sub_problem: 2,
            reason: FailureReason::new(ReasonCode::BlockedByDependency, "prerequisite 0 failed"),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"sub_problem_failed\""));
        assert!(json.contains("blocked_by_dependency"));
        assert_eq!(event.event_type(), "sub_problem_failed");
        assert_eq!(event.session_id(), "s-1");
    }

    #[test]
    fn test_final_events() {
        let now = Utc::now();
        assert!(ProgressEvent::Killed {
            session_id: "s".into(),
            timestamp: now
        }
        .is_final());
        assert!(!ProgressEvent::Resumed {
            session_id: "s".into(),
            timestamp: now
        }
        .is_final());
    }
}
