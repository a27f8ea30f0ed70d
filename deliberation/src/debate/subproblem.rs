//! Per-sub-problem worker: panel, round loop, voting, synthesis.
//!
//! The worker never touches session state. It reports every transition
//! as a [`SubProblemUpdate`] and waits for the orchestrator's [`Directive`]
//! before going on, so the orchestrator can checkpoint, apply the budget
//! and deliver a kill at each boundary. A worker started from a checkpoint
//! resumes at the step its sub-problem status names.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::debate::guardrails::{StopDecision, StoppingPolicy};
use crate::debate::panel::{ExpertCatalog, PanelSelector};
use crate::debate::round::{RoundExecutor, RoundInput, RoundOutcome};
use crate::debate::synthesis;
use crate::debate::voting::{collect_votes, VoteOutcome};
use crate::error::{FailureReason, ReasonCode};
use crate::inference::SessionCaller;
use crate::prompts::{self, UpstreamContext};
use crate::state::{
    ExpertPanel, Problem, SubProblem, SubProblemProgress, SubProblemResult, SubProblemStatus,
};

/// Orchestrator reply to an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Continue,
    /// Session budget exhausted: stop debating and vote now.
    ForceVote { limit: String },
    /// Stop without reporting anything further.
    Stop,
}

/// A transition in one sub-problem's lifecycle.
#[derive(Debug, Clone)]
pub enum SubProblemUpdate {
    Started { panel: ExpertPanel },
    RoundCompleted { outcome: RoundOutcome },
    VotingStarted,
    VotesCollected { outcome: VoteOutcome },
    Completed { result: SubProblemResult },
    Failed {
        reason: FailureReason,
        /// Degraded result kept when only synthesis failed.
        partial: Option<SubProblemResult>,
    },
}

impl SubProblemUpdate {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::RoundCompleted { .. } => "round_completed",
            Self::VotingStarted => "voting_started",
            Self::VotesCollected { .. } => "votes_collected",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// An update plus the channel the orchestrator answers on.
#[derive(Debug)]
pub struct UpdateEnvelope {
    pub index: usize,
    pub update: SubProblemUpdate,
    pub ack: oneshot::Sender<Directive>,
}

/// Everything one worker needs, owned so it can run on its own task.
pub struct SubProblemScheduler {
    pub problem: Problem,
    pub sub_problem: SubProblem,
    /// Progress recorded so far (empty for a fresh start).
    pub progress: SubProblemProgress,
    pub upstream: Vec<UpstreamContext>,
    pub catalog: Arc<ExpertCatalog>,
    pub config: Arc<EngineConfig>,
    pub caller: SessionCaller,
    pub policy: StoppingPolicy,
    pub updates: mpsc::Sender<UpdateEnvelope>,
}

impl SubProblemScheduler {
    async fn report(&self, update: SubProblemUpdate) -> Directive {
        let kind = update.kind();
        let (ack, reply) = oneshot::channel();
        let envelope = UpdateEnvelope {
            index: self.sub_problem.index,
            update,
            ack,
        };
        if self.updates.send(envelope).await.is_err() {
            debug!(sub_problem = self.sub_problem.index, kind, "Orchestrator gone");
            return Directive::Stop;
        }
        reply.await.unwrap_or(Directive::Stop)
    }

    /// Drive the sub-problem to a terminal state or until told to stop.
    pub async fn run(self) {
        let index = self.sub_problem.index;

        let panel = match &self.progress.panel {
            Some(panel) => panel.clone(),
            None => {
                let selected = PanelSelector::new(&self.catalog, self.config.panel.size)
                    .select(&self.sub_problem.goal);
                match selected {
                    Ok(panel) => {
                        info!(sub_problem = index, panel = ?panel.ids(), "Panel seated");
                        if self
                            .report(SubProblemUpdate::Started {
                                panel: panel.clone(),
                            })
                            .await
                            == Directive::Stop
                        {
                            return;
                        }
                        panel
                    }
                    Err(detail) => {
                        warn!(sub_problem = index, error = %detail, "No panel available");
                        self.report(SubProblemUpdate::Failed {
                            reason: FailureReason::new(ReasonCode::PanelUnavailable, detail),
                            partial: None,
                        })
                        .await;
                        return;
                    }
                }
            }
        };

        let mut contributions = self.progress.contributions.clone();
        let mut recommendations = self.progress.recommendations.clone();
        let mut abstentions = self.progress.abstentions.clone();
        let mut cost = self.progress.cost;
        let mut rounds = self.progress.rounds_completed;

        let status = self.sub_problem.status;
        if status.is_unstarted() || status == SubProblemStatus::Running {
            let mut assessments = self.progress.assessments.clone();
            let mut follow_up = self.progress.follow_up.clone();
            let mut stopped = self
                .progress
                .stop
                .as_ref()
                .map(StopDecision::moves_to_voting)
                .unwrap_or(false);
            let executor = RoundExecutor::new(&self.caller, &self.config, &self.policy);

            while !stopped && rounds < self.sub_problem.round_budget.max_rounds {
                let round = rounds + 1;
                let outcome = executor
                    .execute(&RoundInput {
                        problem: &self.problem,
                        sub_problem: &self.sub_problem,
                        panel: &panel,
                        round,
                        history: &contributions,
                        assessments: &assessments,
                        follow_up: &follow_up,
                        upstream: &self.upstream,
                    })
                    .await;

                rounds = round;
                cost += outcome.cost;
                contributions.extend(outcome.contributions.iter().cloned());
                if let Some(assessment) = &outcome.assessment {
                    assessments.push(assessment.clone());
                }
                follow_up = outcome.decision.follow_up_aspects().to_vec();
                stopped = outcome.decision.moves_to_voting();

                match self
                    .report(SubProblemUpdate::RoundCompleted { outcome })
                    .await
                {
                    Directive::Stop => return,
                    Directive::ForceVote { limit } => {
                        info!(sub_problem = index, round, %limit, "Budget exhausted, forcing vote");
                        stopped = true;
                    }
                    Directive::Continue => {}
                }
            }

            if self.report(SubProblemUpdate::VotingStarted).await == Directive::Stop {
                return;
            }
        }

        if status != SubProblemStatus::Synthesizing {
            let outcome = collect_votes(
                &self.caller,
                &self.config,
                &self.sub_problem,
                &panel,
                &contributions,
            )
            .await;
            cost += outcome.cost;
            recommendations = outcome.recommendations.clone();
            abstentions = outcome.abstentions.clone();
            if self
                .report(SubProblemUpdate::VotesCollected { outcome })
                .await
                == Directive::Stop
            {
                return;
            }
        }

        let synthesized = synthesis::synthesize(
            &self.caller,
            &self.config,
            &self.sub_problem,
            &contributions,
            &recommendations,
            &self.upstream,
        )
        .await;

        let mut result = SubProblemResult {
            sub_problem_index: index,
            synthesis_text: String::new(),
            recommendations,
            abstentions,
            total_cost: cost,
            contribution_count: contributions.len(),
            round_count: rounds,
            degraded: false,
        };

        let update = match synthesized {
            Ok((text, synthesis_cost)) => {
                result.synthesis_text = text;
                result.total_cost += synthesis_cost;
                info!(sub_problem = index, rounds, cost = result.total_cost, "Sub-problem complete");
                SubProblemUpdate::Completed { result }
            }
            Err(e) => {
                warn!(sub_problem = index, error = %e, "Synthesis failed, keeping raw votes");
                result.synthesis_text =
                    prompts::raw_votes_text(&self.sub_problem, &result.recommendations);
                result.degraded = true;
                SubProblemUpdate::Failed {
                    reason: FailureReason::new(ReasonCode::SynthesisFailed, e.to_string()),
                    partial: Some(result),
                }
            }
        };
        self.report(update).await;
    }
}
