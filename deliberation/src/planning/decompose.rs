//! Decomposer: problem statement to a validated sub-problem DAG.

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use super::dag::validate_decomposition;
use crate::config::EngineConfig;
use crate::inference::{CallError, Role, SessionCaller};
use crate::prompts::{self, parse_json_reply};
use crate::state::{Problem, RoundBudget, SubProblem, SubProblemStatus};

/// Complexity assumed when the planner omits one.
const DEFAULT_COMPLEXITY: f64 = 0.5;

#[derive(Debug, Error)]
pub enum DecompositionError {
    #[error("decomposition call failed: {0}")]
    Call(#[from] CallError),

    #[error("decomposition invalid after {attempts} attempts: {last}")]
    Invalid { attempts: u32, last: String },
}

#[derive(Debug, Deserialize)]
struct DecompositionReply {
    #[serde(default)]
    complexity: Option<f64>,
    sub_problems: Vec<SubProblemDraft>,
}

#[derive(Debug, Deserialize)]
struct SubProblemDraft {
    goal: String,
    #[serde(default, alias = "dependencies", alias = "dependency_indices")]
    depends_on: Vec<usize>,
    #[serde(default)]
    complexity: Option<f64>,
}

/// A validated decomposition and what it cost to produce.
#[derive(Debug, Clone)]
pub struct Decomposition {
    pub problem: Problem,
    pub cost: u64,
}

pub struct Decomposer<'a> {
    caller: &'a SessionCaller,
    config: &'a EngineConfig,
}

impl<'a> Decomposer<'a> {
    pub fn new(caller: &'a SessionCaller, config: &'a EngineConfig) -> Self {
        Self { caller, config }
    }

    /// Decompose, retrying once with a corrective instruction when the
    /// reply is malformed or its DAG is invalid.
    pub async fn decompose(&self, problem: &Problem) -> Result<Decomposition, DecompositionError> {
        let attempts = self.config.decomposition.max_attempts.max(1);
        let mut cost = 0;
        let mut last_error: Option<String> = None;

        for attempt in 1..=attempts {
            let mut prompt =
                prompts::decomposition(problem, self.config.decomposition.max_sub_problems);
            if let Some(problem) = &last_error {
                prompt = prompt.with_correction(problem);
            }
            let request = prompt.into_request(
                Role::Planner,
                self.config.caller.max_tokens.planning,
                self.config.caller.planning_timeout(),
            );
            let response = self.caller.call(&request).await?;
            cost += response.token_cost;

            match self.build(problem, &response.content) {
                Ok(decomposed) => {
                    info!(
                        sub_problems = decomposed.sub_problems.len(),
                        complexity = decomposed.complexity,
                        attempt,
                        "Decomposition accepted"
                    );
                    return Ok(Decomposition {
                        problem: decomposed,
                        cost,
                    });
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Decomposition rejected");
                    last_error = Some(e);
                }
            }
        }

        Err(DecompositionError::Invalid {
            attempts,
            last: last_error.unwrap_or_default(),
        })
    }

    fn build(&self, problem: &Problem, reply: &str) -> Result<Problem, String> {
        let reply: DecompositionReply = parse_json_reply(reply)?;
        let overall = normalize_complexity(reply.complexity.unwrap_or(DEFAULT_COMPLEXITY));

        let sub_problems: Vec<SubProblem> = reply
            .sub_problems
            .into_iter()
            .enumerate()
            .map(|(index, draft)| {
                let complexity = normalize_complexity(draft.complexity.unwrap_or(overall));
                let mut deps = draft.depends_on;
                deps.sort_unstable();
                deps.dedup();
                let status = if deps.is_empty() {
                    SubProblemStatus::Pending
                } else {
                    SubProblemStatus::WaitingOnDependency
                };
                SubProblem {
                    index,
                    goal: draft.goal.trim().to_string(),
                    round_budget: RoundBudget::from_complexity(
                        complexity,
                        &self.config.rounds,
                        self.config.stopping.min_rounds,
                    ),
                    dependency_indices: deps,
                    complexity,
                    status,
                }
            })
            .collect();

        if let Some(empty) = sub_problems.iter().find(|s| s.goal.is_empty()) {
            return Err(format!("sub-problem {} has an empty goal", empty.index));
        }
        validate_decomposition(&sub_problems, self.config.decomposition.max_sub_problems)
            .map_err(|e| e.to_string())?;

        Ok(Problem {
            statement: problem.statement.clone(),
            context: problem.context.clone(),
            constraints: problem.constraints.clone(),
            complexity: overall,
            sub_problems,
        })
    }
}

fn normalize_complexity(c: f64) -> f64 {
    if c.is_finite() {
        c.clamp(0.0, 1.0)
    } else {
        DEFAULT_COMPLEXITY
    }
}
