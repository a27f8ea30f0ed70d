//! Core deliberation records.
//!
//! These types are owned by the session state and persisted in every
//! checkpoint, so all of them round-trip through serde without loss.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::RoundPolicy;
use crate::error::FailureReason;

/// Unique identifier for deliberation sessions.
pub type SessionId = String;

/// Identifier of an expert persona.
pub type ExpertId = String;

/// The top-level problem and its decomposition.
///
/// Immutable after decomposition, except that clarification answers are
/// appended to `context`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub statement: String,
    pub context: String,
    pub constraints: Vec<String>,
    /// Overall complexity estimate in `[0, 1]` from the decomposer.
    pub complexity: f64,
    pub sub_problems: Vec<SubProblem>,
}

impl Problem {
    /// A problem that has not been decomposed yet.
    pub fn new(statement: &str, context: &str, constraints: Vec<String>) -> Self {
        Self {
            statement: statement.to_string(),
            context: context.to_string(),
            constraints,
            complexity: 0.0,
            sub_problems: Vec::new(),
        }
    }

    pub fn is_decomposed(&self) -> bool {
        !self.sub_problems.is_empty()
    }

    pub fn sub_problem(&self, index: usize) -> Option<&SubProblem> {
        self.sub_problems.get(index)
    }

    /// Whether every sub-problem has reached `complete` or `failed`.
    pub fn all_terminal(&self) -> bool {
        self.sub_problems.iter().all(|s| s.status.is_terminal())
    }
}

/// Lifecycle state of one sub-problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubProblemStatus {
    Pending,
    WaitingOnDependency,
    Running,
    Voting,
    Synthesizing,
    Complete,
    Failed,
}

impl SubProblemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Whether the sub-problem has been started (and not yet finished).
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Voting | Self::Synthesizing)
    }

    /// Whether the sub-problem is still waiting to be scheduled.
    pub fn is_unstarted(self) -> bool {
        matches!(self, Self::Pending | Self::WaitingOnDependency)
    }

    pub fn valid_transitions(self) -> &'static [SubProblemStatus] {
        match self {
            Self::Pending => &[Self::WaitingOnDependency, Self::Running, Self::Failed],
            Self::WaitingOnDependency => &[Self::Running, Self::Failed],
            Self::Running => &[Self::Voting, Self::Failed],
            Self::Voting => &[Self::Synthesizing, Self::Failed],
            Self::Synthesizing => &[Self::Complete, Self::Failed],
            Self::Complete | Self::Failed => &[],
        }
    }
}

impl std::fmt::Display for SubProblemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::WaitingOnDependency => write!(f, "waiting_on_dependency"),
            Self::Running => write!(f, "running"),
            Self::Voting => write!(f, "voting"),
            Self::Synthesizing => write!(f, "synthesizing"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Error for invalid sub-problem status transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: String,
    pub to: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

/// Per-sub-problem round limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundBudget {
    pub min_rounds: u32,
    pub max_rounds: u32,
}

impl RoundBudget {
    /// Derive a budget from a complexity score:
    /// `max = clamp(round(base + slope * c), floor, ceiling)`.
    ///
    /// `min_rounds` never exceeds `max_rounds`.
    pub fn from_complexity(complexity: f64, policy: &RoundPolicy, min_rounds: u32) -> Self {
        let c = if complexity.is_finite() {
            complexity.clamp(0.0, 1.0)
        } else {
            0.5
        };
        let raw = (policy.base + policy.slope * c).round() as i64;
        let max_rounds = raw.clamp(policy.floor as i64, policy.ceiling as i64) as u32;
        Self {
            min_rounds: min_rounds.min(max_rounds),
            max_rounds,
        }
    }

    /// Debate phase for a 1-indexed round number.
    pub fn phase_for(&self, round: u32) -> Phase {
        let max = self.max_rounds.max(1) as f64;
        let exploration_end = ((max * 0.35).ceil() as u32).max(1);
        let challenge_end = ((max * 0.7).ceil() as u32).max(exploration_end);
        if round <= exploration_end {
            Phase::Exploration
        } else if round <= challenge_end {
            Phase::Challenge
        } else {
            Phase::Convergence
        }
    }
}

/// One decomposed facet of the problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubProblem {
    pub index: usize,
    pub goal: String,
    pub dependency_indices: Vec<usize>,
    pub complexity: f64,
    pub round_budget: RoundBudget,
    pub status: SubProblemStatus,
}

impl SubProblem {
    /// Move to a new status, rejecting transitions the lifecycle forbids.
    pub fn transition(&mut self, to: SubProblemStatus) -> Result<(), TransitionError> {
        if !self.status.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn has_dependencies(&self) -> bool {
        !self.dependency_indices.is_empty()
    }
}

/// Debate phase of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Exploration,
    Challenge,
    Convergence,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exploration => write!(f, "exploration"),
            Self::Challenge => write!(f, "challenge"),
            Self::Convergence => write!(f, "convergence"),
        }
    }
}

/// An expert persona (static configuration).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expert {
    pub id: ExpertId,
    pub name: String,
    /// Domain tags; the first one is the expert's primary expertise.
    pub expertise_tags: Vec<String>,
    pub style: String,
}

impl Expert {
    pub fn primary_tag(&self) -> Option<&str> {
        self.expertise_tags.first().map(String::as_str)
    }
}

/// Ordered set of 3-5 experts debating one sub-problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpertPanel {
    experts: Vec<Expert>,
}

impl ExpertPanel {
    pub const MIN_SIZE: usize = 3;
    pub const MAX_SIZE: usize = 5;

    /// Build a panel, enforcing size bounds, unique ids and distinct
    /// primary expertise tags.
    pub fn new(experts: Vec<Expert>) -> Result<Self, String> {
        if experts.len() < Self::MIN_SIZE || experts.len() > Self::MAX_SIZE {
            return Err(format!(
                "panel size {} outside {}..={}",
                experts.len(),
                Self::MIN_SIZE,
                Self::MAX_SIZE
            ));
        }
        let mut ids = std::collections::HashSet::new();
        let mut tags = std::collections::HashSet::new();
        for expert in &experts {
            if !ids.insert(expert.id.as_str()) {
                return Err(format!("duplicate expert '{}'", expert.id));
            }
            if let Some(tag) = expert.primary_tag() {
                if !tags.insert(tag.to_ascii_lowercase()) {
                    return Err(format!("expertise '{}' represented twice", tag));
                }
            }
        }
        Ok(Self { experts })
    }

    pub fn experts(&self) -> &[Expert] {
        &self.experts
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }

    pub fn ids(&self) -> Vec<ExpertId> {
        self.experts.iter().map(|e| e.id.clone()).collect()
    }
}

/// One expert's contribution to one round. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub expert_id: ExpertId,
    pub round_number: u32,
    pub phase: Phase,
    pub content: String,
    pub token_cost: u64,
}

/// Aspects a thorough deliberation must cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aspect {
    ProblemClarity,
    Objectives,
    Options,
    Risks,
    Constraints,
    Stakeholders,
    Dependencies,
}

impl Aspect {
    pub fn all() -> &'static [Aspect] {
        &[
            Aspect::ProblemClarity,
            Aspect::Objectives,
            Aspect::Options,
            Aspect::Risks,
            Aspect::Constraints,
            Aspect::Stakeholders,
            Aspect::Dependencies,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProblemClarity => "problem_clarity",
            Self::Objectives => "objectives",
            Self::Options => "options",
            Self::Risks => "risks",
            Self::Constraints => "constraints",
            Self::Stakeholders => "stakeholders",
            Self::Dependencies => "dependencies",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        Self::all()
            .iter()
            .copied()
            .find(|a| a.as_str() == normalized)
    }
}

impl std::fmt::Display for Aspect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How deeply an aspect has been covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageLevel {
    None,
    Shallow,
    Deep,
}

impl CoverageLevel {
    pub fn score(self) -> f64 {
        match self {
            Self::None => 0.0,
            Self::Shallow => 0.5,
            Self::Deep => 1.0,
        }
    }
}

/// The judge's recommendation for the next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Continue,
    Vote,
    Clarify,
    Moderate,
}

/// Quality assessment of one round, produced after all contributions
/// for that round are collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundAssessment {
    pub round_number: u32,
    pub exploration_score: f64,
    pub convergence_score: f64,
    pub focus_score: f64,
    pub novelty_score: f64,
    pub recommended_action: RecommendedAction,
    pub missing_aspects: Vec<Aspect>,
    pub coverage: BTreeMap<Aspect, CoverageLevel>,
    pub leading_option: Option<String>,
    /// Heuristic fallback used because the judge output was unusable.
    pub degraded: bool,
}

impl RoundAssessment {
    pub fn coverage_of(&self, aspect: Aspect) -> CoverageLevel {
        self.coverage
            .get(&aspect)
            .copied()
            .unwrap_or(CoverageLevel::None)
    }
}

/// One expert's vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub expert_id: ExpertId,
    pub preferred_option: String,
    pub confidence: f64,
    pub rationale: String,
}

/// Final result of one sub-problem. Created once, immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubProblemResult {
    pub sub_problem_index: usize,
    pub synthesis_text: String,
    pub recommendations: Vec<Recommendation>,
    pub abstentions: Vec<ExpertId>,
    pub total_cost: u64,
    pub contribution_count: usize,
    pub round_count: u32,
    /// Raw votes were emitted without prose synthesis.
    pub degraded: bool,
}

/// Questions awaiting an answer. Cleared once the answers are merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub questions: Vec<String>,
}

impl ClarificationRequest {
    pub fn new(questions: Vec<String>) -> Self {
        Self { questions }
    }

    /// Order-insensitive identity of the question set.
    pub fn fingerprint(&self) -> String {
        fingerprint_questions(&self.questions)
    }
}

/// Order- and case-insensitive identity of a set of questions.
pub fn fingerprint_questions(questions: &[String]) -> String {
    let mut normalized: Vec<String> = questions
        .iter()
        .map(|q| q.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase())
        .filter(|q| !q.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized.join("\n")
}

/// Problem criticality tier; selects the readiness target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    #[default]
    Standard,
    High,
}

/// A sub-problem that did not contribute to the final report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportGap {
    pub sub_problem_index: usize,
    pub goal: String,
    pub reason: FailureReason,
}

/// Output of meta-synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub text: String,
    pub gaps: Vec<ReportGap>,
    /// Meta-synthesis call failed; text is a concatenation of sub-results.
    pub degraded: bool,
}
