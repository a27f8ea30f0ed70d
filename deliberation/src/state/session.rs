//! Session state machine: statuses, transitions, per-sub-problem progress.
//!
//! [`SessionState`] is the unit the checkpoint manager persists. It holds
//! everything the engine needs to continue a session after a restart, so
//! no deliberation progress lives only in memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::*;
use crate::debate::StopDecision;
use crate::error::FailureReason;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Decomposing,
    PausedForClarification,
    Deliberating,
    Synthesizing,
    Completed,
    Failed,
    Killed,
    /// Checkpoint store unavailable; waiting for `resume`.
    Suspended,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed)
    }

    /// Terminal, or waiting on something outside the engine.
    pub fn is_at_rest(self) -> bool {
        self.is_terminal() || matches!(self, Self::PausedForClarification | Self::Suspended)
    }

    pub fn valid_transitions(self) -> &'static [SessionStatus] {
        use SessionStatus::*;
        match self {
            Created => &[Decomposing, Failed, Killed, Suspended],
            Decomposing => &[
                PausedForClarification,
                Deliberating,
                Failed,
                Killed,
                Suspended,
            ],
            PausedForClarification => &[Deliberating, Killed, Suspended],
            Deliberating => &[Synthesizing, Failed, Killed, Suspended],
            Synthesizing => &[Completed, Failed, Killed, Suspended],
            Suspended => &[
                Created,
                Decomposing,
                PausedForClarification,
                Deliberating,
                Synthesizing,
                Killed,
            ],
            Completed | Failed | Killed => &[],
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Decomposing => write!(f, "decomposing"),
            Self::PausedForClarification => write!(f, "paused_for_clarification"),
            Self::Deliberating => write!(f, "deliberating"),
            Self::Synthesizing => write!(f, "synthesizing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Killed => write!(f, "killed"),
            Self::Suspended => write!(f, "suspended"),
        }
    }
}

/// A session status transition record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Invalid session transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTransitionError {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

impl std::fmt::Display for SessionTransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid session transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for SessionTransitionError {}

/// Everything recorded while deliberating one sub-problem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubProblemProgress {
    pub panel: Option<ExpertPanel>,
    pub contributions: Vec<Contribution>,
    pub assessments: Vec<RoundAssessment>,
    pub rounds_completed: u32,
    /// Aspects the next round must address explicitly.
    pub follow_up: Vec<Aspect>,
    /// Why the round loop ended, once it has.
    pub stop: Option<StopDecision>,
    pub recommendations: Vec<Recommendation>,
    pub abstentions: Vec<ExpertId>,
    pub cost: u64,
    /// Prerequisites that were still deliberating when this one started.
    pub speculative_inputs: Vec<usize>,
    pub failure: Option<FailureReason>,
    pub result: Option<SubProblemResult>,
}

impl SubProblemProgress {
    /// Contributions of the most recent completed round.
    pub fn last_round_contributions(&self) -> Vec<&Contribution> {
        self.contributions
            .iter()
            .filter(|c| c.round_number == self.rounds_completed)
            .collect()
    }
}

/// Full session state; the checkpoint unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub id: SessionId,
    pub problem: Problem,
    pub status: SessionStatus,
    pub criticality: Criticality,
    /// Completed (or degraded) sub-problem results, in completion order.
    pub sub_problem_results: Vec<SubProblemResult>,
    /// Aligned with `problem.sub_problems`.
    pub progress: Vec<SubProblemProgress>,
    pub cumulative_cost: u64,
    pub cumulative_rounds: u32,
    pub started_at: DateTime<Utc>,
    /// When deliberation (the budgeted phase) began.
    pub deliberation_started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub clarification: Option<ClarificationRequest>,
    /// Fingerprints of question sets already answered.
    pub answered_question_sets: Vec<String>,
    pub report: Option<FinalReport>,
    pub failure: Option<FailureReason>,
    /// Status to return to when resuming from `suspended`.
    pub suspended_from: Option<SessionStatus>,
    pub transitions: Vec<SessionTransition>,
    pub checkpoint_sequence: u64,
}

impl SessionState {
    pub fn new(problem: Problem, criticality: Criticality) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            problem,
            status: SessionStatus::Created,
            criticality,
            sub_problem_results: Vec::new(),
            progress: Vec::new(),
            cumulative_cost: 0,
            cumulative_rounds: 0,
            started_at: now,
            deliberation_started_at: None,
            updated_at: now,
            clarification: None,
            answered_question_sets: Vec::new(),
            report: None,
            failure: None,
            suspended_from: None,
            transitions: Vec::new(),
            checkpoint_sequence: 0,
        }
    }

    /// Transition to a new status with a reason.
    pub fn transition(
        &mut self,
        to: SessionStatus,
        reason: &str,
    ) -> Result<(), SessionTransitionError> {
        if !self.status.valid_transitions().contains(&to) {
            return Err(SessionTransitionError {
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        self.transitions.push(SessionTransition {
            from: self.status,
            to,
            timestamp: now,
            reason: reason.to_string(),
        });
        if to == SessionStatus::Suspended {
            self.suspended_from = Some(self.status);
        } else if self.status == SessionStatus::Suspended {
            self.suspended_from = None;
        }
        if to == SessionStatus::Deliberating && self.deliberation_started_at.is_none() {
            self.deliberation_started_at = Some(now);
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Install a decomposition and allocate progress records for it.
    pub fn install_decomposition(&mut self, problem: Problem) {
        self.progress = vec![SubProblemProgress::default(); problem.sub_problems.len()];
        self.problem = problem;
        self.updated_at = Utc::now();
    }

    /// Fail the session with a reason code.
    pub fn fail(&mut self, reason: FailureReason) -> Result<(), SessionTransitionError> {
        let detail = reason.to_string();
        self.transition(SessionStatus::Failed, &detail)?;
        self.failure = Some(reason);
        Ok(())
    }

    /// Milliseconds spent in the budgeted deliberation phase.
    pub fn deliberation_elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        self.deliberation_started_at
            .map(|t| (now - t).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }

    pub fn sub_problem_status(&self, index: usize) -> Option<SubProblemStatus> {
        self.problem.sub_problem(index).map(|s| s.status)
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        let complete = self
            .problem
            .sub_problems
            .iter()
            .filter(|s| s.status == SubProblemStatus::Complete)
            .count();
        format!(
            "[{}] {}/{} sub-problems complete | rounds={} cost={} | session={}",
            self.status,
            complete,
            self.problem.sub_problems.len(),
            self.cumulative_rounds,
            self.cumulative_cost,
            self.id
        )
    }
}
