//! Session and deliberation state.
//!
//! - `types`: problem, sub-problems, panels, contributions, assessments,
//!   votes and results
//! - `session`: the [`SessionState`] checkpoint unit and its status machine

pub mod session;
pub mod types;

pub use session::{
    SessionState, SessionStatus, SessionTransition, SessionTransitionError, SubProblemProgress,
};
pub use types::{
    fingerprint_questions, Aspect, ClarificationRequest, Contribution, CoverageLevel,
    Criticality, Expert, ExpertId, ExpertPanel, FinalReport, Phase, Problem, Recommendation,
    RecommendedAction, ReportGap, RoundAssessment, RoundBudget, SessionId, SubProblem,
    SubProblemResult, SubProblemStatus, TransitionError,
};
