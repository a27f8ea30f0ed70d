//! Stopping rules evaluated after every debate round.
//!
//! Rule order is fixed:
//!
//! 1. hard cap at `max_rounds` (overrides everything)
//! 2. floor guards: minimum rounds, exploration floor, required aspects
//! 3. deadlock guard: low novelty AND stalled convergence
//! 4. natural stop: composite readiness reaches the tier target
//!
//! Floor guards run before the deadlock guard, so a debate is never
//! force-stopped before it has explored enough.

use serde::{Deserialize, Serialize};

use crate::config::StoppingConfig;
use crate::state::{Aspect, CoverageLevel, Criticality, RoundAssessment, RoundBudget};

/// Float slack for threshold comparisons on judge scores.
const EPSILON: f64 = 1e-9;

/// What happens after a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum StopDecision {
    /// Run another round.
    Continue,
    /// Run another round that explicitly addresses these aspects.
    TargetedFollowUp { missing_aspects: Vec<Aspect> },
    /// Novelty collapsed and convergence stalled.
    DeadlockForceStop { novelty: f64, convergence_delta: f64 },
    /// Readiness reached the target.
    NaturalStop { readiness: f64 },
    /// `max_rounds` reached.
    HardCap { rounds: u32 },
    /// Fewer than two contributions even after a retry.
    InsufficientContributions { contributions: usize },
    /// Session cost or wall-clock budget exhausted.
    BudgetExhausted { limit: String },
}

impl StopDecision {
    /// Whether the sub-problem moves on to voting.
    pub fn moves_to_voting(&self) -> bool {
        !matches!(self, Self::Continue | Self::TargetedFollowUp { .. })
    }

    /// Aspects the next round must name, if any.
    pub fn follow_up_aspects(&self) -> &[Aspect] {
        match self {
            Self::TargetedFollowUp { missing_aspects } => missing_aspects,
            _ => &[],
        }
    }
}

impl std::fmt::Display for StopDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::TargetedFollowUp { missing_aspects } => {
                let names: Vec<&str> = missing_aspects.iter().map(|a| a.as_str()).collect();
                write!(f, "targeted_follow_up [{}]", names.join(", "))
            }
            Self::DeadlockForceStop {
                novelty,
                convergence_delta,
            } => write!(
                f,
                "deadlock_force_stop (novelty {:.2}, convergence delta {:.2})",
                novelty, convergence_delta
            ),
            Self::NaturalStop { readiness } => {
                write!(f, "natural_stop (readiness {:.2})", readiness)
            }
            Self::HardCap { rounds } => write!(f, "hard_cap ({} rounds)", rounds),
            Self::InsufficientContributions { contributions } => {
                write!(f, "insufficient_contributions ({})", contributions)
            }
            Self::BudgetExhausted { limit } => write!(f, "budget_exhausted ({})", limit),
        }
    }
}

/// Evaluates [`StopDecision`]s from round history.
#[derive(Debug, Clone)]
pub struct StoppingPolicy {
    config: StoppingConfig,
    target: f64,
}

impl StoppingPolicy {
    pub fn new(config: StoppingConfig, criticality: Criticality) -> Self {
        let target = config.readiness_targets.for_tier(criticality);
        Self { config, target }
    }

    pub fn config(&self) -> &StoppingConfig {
        &self.config
    }

    /// Readiness target in effect.
    pub fn target(&self) -> f64 {
        self.target
    }

    /// Weighted blend of exploration, convergence, focus and inverse novelty.
    pub fn readiness(&self, assessment: &RoundAssessment) -> f64 {
        let w = &self.config.readiness_weights;
        let total = w.total();
        if total <= 0.0 {
            return 0.0;
        }
        let blended = w.exploration * assessment.exploration_score
            + w.convergence * assessment.convergence_score
            + w.focus * assessment.focus_score
            + w.inverse_novelty * (1.0 - assessment.novelty_score);
        (blended / total).clamp(0.0, 1.0)
    }

    /// Decide what follows `round` given the assessments so far
    /// (`history` ends with this round's assessment).
    pub fn evaluate(
        &self,
        round: u32,
        budget: &RoundBudget,
        history: &[RoundAssessment],
    ) -> StopDecision {
        if round >= budget.max_rounds {
            return StopDecision::HardCap { rounds: round };
        }

        let latest = match history.last() {
            Some(latest) if !latest.degraded => latest,
            _ => return StopDecision::Continue,
        };

        let min_rounds = budget.min_rounds.max(self.config.min_rounds.min(budget.max_rounds));
        let uncovered = self.uncovered_required(latest);
        if round < min_rounds
            || latest.exploration_score + EPSILON < self.config.exploration_floor
            || !uncovered.is_empty()
        {
            let mut missing: Vec<Aspect> = latest.missing_aspects.clone();
            missing.extend(uncovered);
            missing.sort();
            missing.dedup();
            return if missing.is_empty() {
                StopDecision::Continue
            } else {
                StopDecision::TargetedFollowUp {
                    missing_aspects: missing,
                }
            };
        }

        if let Some(decision) = self.deadlock(history) {
            return decision;
        }

        let readiness = self.readiness(latest);
        if readiness + EPSILON >= self.target {
            return StopDecision::NaturalStop { readiness };
        }

        StopDecision::Continue
    }

    fn uncovered_required(&self, latest: &RoundAssessment) -> Vec<Aspect> {
        self.config
            .required_aspects
            .iter()
            .copied()
            .filter(|a| latest.coverage_of(*a) == CoverageLevel::None)
            .collect()
    }

    /// Both signals must hold: novelty at or under the repetition floor and
    /// convergence gain within the stall delta over the trailing window.
    fn deadlock(&self, history: &[RoundAssessment]) -> Option<StopDecision> {
        if history.len() < 2 {
            return None;
        }
        let latest = history.last()?;
        let novelty_floor = 1.0 - self.config.repetition_floor;
        if latest.novelty_score > novelty_floor + EPSILON {
            return None;
        }
        let window = (self.config.stall_window as usize).min(history.len() - 1);
        let baseline = &history[history.len() - 1 - window];
        let delta = latest.convergence_score - baseline.convergence_score;
        if delta > self.config.stall_delta + EPSILON {
            return None;
        }
        Some(StopDecision::DeadlockForceStop {
            novelty: latest.novelty_score,
            convergence_delta: delta,
        })
    }
}
