//! Structured expert debate for one sub-problem.
//!
//! # Sub-problem flow
//!
//! ```text
//! pending ─┬─────────────────────────┐
//!          └→ waiting_on_dependency ─┴→ running ⟲ rounds → voting → synthesizing → complete
//!                                          │                  │           │
//!                                          └──────────────────┴───────────┴→ failed
//! ```
//!
//! Each round fans out one contribution per panel member, is scored by
//! the [`ConvergenceJudge`], and is fed to the [`StoppingPolicy`], which
//! decides whether the panel debates again or moves to voting.

pub mod guardrails;
pub mod judge;
pub mod panel;
pub mod round;
pub mod subproblem;
pub mod synthesis;
pub mod voting;

pub use guardrails::{StopDecision, StoppingPolicy};
pub use judge::{ConvergenceJudge, Judgement};
pub use panel::{ExpertCatalog, PanelSelector};
pub use round::{RoundExecutor, RoundInput, RoundOutcome};
pub use subproblem::{Directive, SubProblemScheduler, SubProblemUpdate, UpdateEnvelope};
pub use synthesis::MetaSynthesizer;
pub use voting::{collect_votes, tally, OptionTally, VoteOutcome};
