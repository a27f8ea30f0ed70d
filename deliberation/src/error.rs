//! Failure taxonomy and engine-level error types.
//!
//! Every user-visible failure carries a [`FailureReason`]: a stable
//! machine-readable [`ReasonCode`] plus the [`FailureClass`] a caller uses
//! to decide whether to retry, wait, or abandon the session.
//!
//! | Class        | Meaning                                   | Caller action        |
//! |--------------|-------------------------------------------|----------------------|
//! | `transient`  | inference calls exhausted retries         | retry later          |
//! | `structural` | invalid decomposition / panel / output    | rephrase, abandon    |
//! | `budget`     | cost / time / round ceiling reached       | accept partial result|
//! | `dependency` | prerequisite sub-problem failed           | inspect prerequisite |
//! | `checkpoint` | durable store unavailable                 | wait, then resume    |
//! | `killed`     | user-initiated termination                | none                 |

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{SessionId, SessionStatus};

/// Coarse class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Structural,
    Budget,
    Dependency,
    Checkpoint,
    Killed,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Structural => write!(f, "structural"),
            Self::Budget => write!(f, "budget"),
            Self::Dependency => write!(f, "dependency"),
            Self::Checkpoint => write!(f, "checkpoint"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// Stable reason codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// A required inference call failed after retries and circuit breaking.
    TransientCallFailure,
    /// A sub-problem worker ended without reporting a terminal state.
    WorkerAborted,
    /// Decomposition produced an invalid DAG twice.
    DecompositionInvalid,
    /// Not enough experts in the catalog to seat a panel.
    PanelUnavailable,
    /// Synthesis failed; raw votes were kept as a degraded result.
    SynthesisFailed,
    /// No sub-problem produced a usable result.
    NoCompletedSubProblems,
    /// Session cost or wall-clock budget was exhausted.
    BudgetExhausted,
    /// A prerequisite sub-problem failed.
    BlockedByDependency,
    /// The checkpoint store rejected writes after retries.
    CheckpointUnavailable,
    /// The session was terminated by the caller.
    Killed,
}

impl ReasonCode {
    /// The failure class this code belongs to.
    pub fn class(self) -> FailureClass {
        match self {
            Self::TransientCallFailure | Self::WorkerAborted => FailureClass::Transient,
            Self::DecompositionInvalid
            | Self::PanelUnavailable
            | Self::SynthesisFailed
            | Self::NoCompletedSubProblems => FailureClass::Structural,
            Self::BudgetExhausted => FailureClass::Budget,
            Self::BlockedByDependency => FailureClass::Dependency,
            Self::CheckpointUnavailable => FailureClass::Checkpoint,
            Self::Killed => FailureClass::Killed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientCallFailure => "transient_call_failure",
            Self::WorkerAborted => "worker_aborted",
            Self::DecompositionInvalid => "decomposition_invalid",
            Self::PanelUnavailable => "panel_unavailable",
            Self::SynthesisFailed => "synthesis_failed",
            Self::NoCompletedSubProblems => "no_completed_sub_problems",
            Self::BudgetExhausted => "budget_exhausted",
            Self::BlockedByDependency => "blocked_by_dependency",
            Self::CheckpointUnavailable => "checkpoint_unavailable",
            Self::Killed => "killed",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A reason code with its class and a human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub code: ReasonCode,
    pub class: FailureClass,
    pub detail: String,
}

impl FailureReason {
    pub fn new(code: ReasonCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            class: code.class(),
            detail: detail.into(),
        }
    }

    /// Whether a caller can reasonably retry or resume after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class,
            FailureClass::Transient | FailureClass::Checkpoint
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.class, self.detail)
    }
}

/// Errors returned by the session control surface.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Session {id} is {status}, not awaiting clarification")]
    NotAwaitingClarification { id: SessionId, status: SessionStatus },

    #[error("Checkpoint unavailable: {0}")]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session driver stopped unexpectedly: {0}")]
    DriverStopped(SessionId),
}

/// Result type for the session control surface.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_code_classes() {
        assert_eq!(
            ReasonCode::TransientCallFailure.class(),
            FailureClass::Transient
        );
        assert_eq!(
            ReasonCode::DecompositionInvalid.class(),
            FailureClass::Structural
        );
        assert_eq!(ReasonCode::BudgetExhausted.class(), FailureClass::Budget);
        assert_eq!(
            ReasonCode::BlockedByDependency.class(),
            FailureClass::Dependency
        );
        assert_eq!(
            ReasonCode::CheckpointUnavailable.class(),
            FailureClass::Checkpoint
        );
    }

    #[test]
    fn test_reason_code_serializes_snake_case() {
        let reason = FailureReason::new(ReasonCode::BlockedByDependency, "prerequisite 0 failed");
        let json = serde_json::to_string(&reason).unwrap();
        assert!(json.contains("\"blocked_by_dependency\""));
        assert!(json.contains("\"dependency\""));
    }

    #[test]
    fn test_retryable() {
        assert!(FailureReason::new(ReasonCode::CheckpointUnavailable, "").is_retryable());
        assert!(!FailureReason::new(ReasonCode::DecompositionInvalid, "").is_retryable());
    }

    #[test]
    fn test_display() {
        let reason = FailureReason::new(ReasonCode::BudgetExhausted, "cost 12000 > 10000");
        assert_eq!(
            reason.to_string(),
            "budget_exhausted (budget): cost 12000 > 10000"
        );
    }
}
