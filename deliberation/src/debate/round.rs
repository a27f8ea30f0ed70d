//! One debate round: parallel contributions, judge, stopping decision.

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::debate::guardrails::{StopDecision, StoppingPolicy};
use crate::debate::judge::ConvergenceJudge;
use crate::inference::{CallError, InferenceRequest, InferenceResponse, Role, SessionCaller};
use crate::prompts::{self, ContributionInput, UpstreamContext};
use crate::state::{Aspect, Contribution, ExpertPanel, Problem, RoundAssessment, SubProblem};

/// Contributions a round needs before it can be judged.
pub const MIN_CONTRIBUTIONS: usize = 2;

/// Everything a round needs to know about the debate so far.
pub struct RoundInput<'a> {
    pub problem: &'a Problem,
    pub sub_problem: &'a SubProblem,
    pub panel: &'a ExpertPanel,
    /// 1-indexed.
    pub round: u32,
    pub history: &'a [Contribution],
    pub assessments: &'a [RoundAssessment],
    pub follow_up: &'a [Aspect],
    pub upstream: &'a [UpstreamContext],
}

/// Result of one round.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub round: u32,
    /// In panel order.
    pub contributions: Vec<Contribution>,
    /// `None` when the round had too few contributions to judge.
    pub assessment: Option<RoundAssessment>,
    pub decision: StopDecision,
    pub cost: u64,
}

pub struct RoundExecutor<'a> {
    caller: &'a SessionCaller,
    config: &'a EngineConfig,
    policy: &'a StoppingPolicy,
}

impl<'a> RoundExecutor<'a> {
    pub fn new(
        caller: &'a SessionCaller,
        config: &'a EngineConfig,
        policy: &'a StoppingPolicy,
    ) -> Self {
        Self {
            caller,
            config,
            policy,
        }
    }

    pub async fn execute(&self, input: &RoundInput<'_>) -> RoundOutcome {
        let sub_problem = input.sub_problem;
        let round = input.round;
        let phase = sub_problem.round_budget.phase_for(round);
        let experts = input.panel.experts();

        let requests: Vec<(usize, InferenceRequest)> = experts
            .iter()
            .enumerate()
            .map(|(i, expert)| {
                let prompt = prompts::contribution(&ContributionInput {
                    problem: input.problem,
                    sub_problem,
                    expert,
                    round,
                    phase,
                    history: input.history,
                    follow_up: input.follow_up,
                    upstream: input.upstream,
                });
                (
                    i,
                    prompt.into_request(
                        Role::Expert,
                        self.config.caller.max_tokens.contribution,
                        self.config.caller.contribution_timeout(),
                    ),
                )
            })
            .collect();

        let mut cost = 0;
        let mut collected: Vec<(usize, InferenceResponse)> = Vec::new();
        let mut missing = self.fan_out(requests.clone(), &mut collected).await;

        if collected.len() < MIN_CONTRIBUTIONS && !missing.is_empty() {
            info!(
                sub_problem = sub_problem.index,
                round,
                contributions = collected.len(),
                "Too few contributions, retrying missing panel members"
            );
            let retry: Vec<(usize, InferenceRequest)> = requests
                .into_iter()
                .filter(|(i, _)| missing.contains(i))
                .collect();
            missing = self.fan_out(retry, &mut collected).await;
        }
        if !missing.is_empty() {
            let skipped: Vec<&str> = missing.iter().map(|&i| experts[i].id.as_str()).collect();
            warn!(
                sub_problem = sub_problem.index,
                round,
                skipped = ?skipped,
                "Panel members skipped this round"
            );
        }

        collected.sort_by_key(|(i, _)| *i);
        let contributions: Vec<Contribution> = collected
            .into_iter()
            .map(|(i, response)| {
                cost += response.token_cost;
                Contribution {
                    expert_id: experts[i].id.clone(),
                    round_number: round,
                    phase,
                    content: response.content,
                    token_cost: response.token_cost,
                }
            })
            .collect();

        if contributions.len() < MIN_CONTRIBUTIONS {
            warn!(
                sub_problem = sub_problem.index,
                round,
                contributions = contributions.len(),
                "Round failed to gather enough contributions, routing to voting"
            );
            return RoundOutcome {
                round,
                decision: StopDecision::InsufficientContributions {
                    contributions: contributions.len(),
                },
                contributions,
                assessment: None,
                cost,
            };
        }

        let mut full_history = input.history.to_vec();
        full_history.extend(contributions.iter().cloned());
        let judgement = ConvergenceJudge::new(self.caller, self.config)
            .assess(
                sub_problem,
                input.panel,
                round,
                &full_history,
                input.assessments.last(),
            )
            .await;
        cost += judgement.cost;

        let mut assessments = input.assessments.to_vec();
        assessments.push(judgement.assessment.clone());
        let decision = self
            .policy
            .evaluate(round, &sub_problem.round_budget, &assessments);

        debug!(
            sub_problem = sub_problem.index,
            round,
            readiness = self.policy.readiness(&judgement.assessment),
            decision = %decision,
            "Round evaluated"
        );

        RoundOutcome {
            round,
            contributions,
            assessment: Some(judgement.assessment),
            decision,
            cost,
        }
    }

    /// Run `requests` with bounded parallelism, pushing successes into
    /// `collected`. Returns the indices that failed.
    async fn fan_out(
        &self,
        requests: Vec<(usize, InferenceRequest)>,
        collected: &mut Vec<(usize, InferenceResponse)>,
    ) -> Vec<usize> {
        let caller = self.caller;
        let results: Vec<(usize, Result<InferenceResponse, CallError>)> = stream::iter(requests)
            .map(|(i, request)| async move { (i, caller.call(&request).await) })
            .buffer_unordered(self.config.caller.round_concurrency.max(1))
            .collect()
            .await;

        let mut failed = Vec::new();
        for (i, result) in results {
            match result {
                Ok(response) => collected.push((i, response)),
                Err(e) => {
                    debug!(member = i, error = %e, "Contribution call failed");
                    failed.push(i);
                }
            }
        }
        failed.sort_unstable();
        failed
    }
}
