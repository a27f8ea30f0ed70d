//! Per-session driver: the only writer of a session's state.
//!
//! The driver walks the session status machine. Every transition is
//! applied to the in-memory state, checkpointed, announced on the event
//! bus, and then published to watchers. A checkpoint that cannot be
//! written suspends the session instead of letting it run ahead of its
//! last durable state.
//!
//! A speculatively started sub-problem that finishes before its
//! prerequisites is held in `synthesizing`: its worker waits on the ack
//! until every prerequisite is complete, or is stopped and its result
//! dropped once one of them fails.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::budget::SessionBudget;
use crate::checkpoint::{CheckpointError, CheckpointManager};
use crate::config::EngineConfig;
use crate::debate::{
    Directive, ExpertCatalog, MetaSynthesizer, StopDecision, StoppingPolicy, SubProblemScheduler,
    SubProblemUpdate, UpdateEnvelope,
};
use crate::error::{FailureReason, ReasonCode};
use crate::events::{ProgressEvent, SharedEventBus};
use crate::inference::SessionCaller;
use crate::planning::{
    ClarificationGate, DecompositionError, Decomposer, DependencyScheduler, Launch,
};
use crate::prompts::UpstreamContext;
use crate::state::{
    ClarificationRequest, ReportGap, SessionState, SessionStatus, SubProblemProgress,
    SubProblemStatus,
};

/// Pending worker updates before workers wait on send.
const UPDATE_CHANNEL_CAPACITY: usize = 32;

/// Characters of each recent contribution quoted in a provisional summary.
const PROVISIONAL_EXCERPT_CHARS: usize = 400;

pub(crate) struct SessionDriver {
    pub state: SessionState,
    pub config: Arc<EngineConfig>,
    pub caller: SessionCaller,
    pub checkpoints: Arc<CheckpointManager>,
    pub events: SharedEventBus,
    pub catalog: Arc<ExpertCatalog>,
    pub snapshot: watch::Sender<SessionState>,
    pub cancel: CancellationToken,
}

impl SessionDriver {
    /// Run until the session is terminal or at rest.
    pub async fn run(mut self) -> SessionState {
        info!(session_id = %self.state.id, status = %self.state.status, "Session driver started");
        loop {
            if self.cancel.is_cancelled() && !self.state.status.is_terminal() {
                self.kill().await;
                break;
            }
            let before = self.state.status;
            match before {
                SessionStatus::Created => {
                    self.advance(SessionStatus::Decomposing, "session started", Vec::new())
                        .await;
                }
                SessionStatus::Decomposing => self.plan().await,
                SessionStatus::Deliberating => self.deliberate().await,
                SessionStatus::Synthesizing => self.synthesize().await,
                SessionStatus::PausedForClarification
                | SessionStatus::Suspended
                | SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::Killed => break,
            }
            if self.state.status == before && !self.cancel.is_cancelled() {
                error!(session_id = %self.state.id, status = %before, "Session made no progress, stopping driver");
                break;
            }
        }
        if self.cancel.is_cancelled() && !self.state.status.is_terminal() {
            self.kill().await;
        }
        self.publish_snapshot();
        info!(session_id = %self.state.id, status = %self.state.status, "Session driver stopped");
        self.state
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(self.state.clone());
    }

    fn event_base(&self) -> (String, chrono::DateTime<Utc>) {
        (self.state.id.clone(), Utc::now())
    }

    /// Checkpoint the current state, then publish `events`.
    ///
    /// Returns false when the store is unavailable; the session is
    /// suspended in that case.
    async fn commit(&mut self, reason: &str, events: Vec<ProgressEvent>) -> bool {
        match self.checkpoints.save(&mut self.state, reason).await {
            Ok(sequence) => {
                debug!(session_id = %self.state.id, sequence, reason, "Transition committed");
                for event in events {
                    self.events.publish(event);
                }
                self.publish_snapshot();
                true
            }
            Err(e) => {
                self.suspend(e);
                false
            }
        }
    }

    fn suspend(&mut self, error: CheckpointError) {
        let reason = FailureReason::new(ReasonCode::CheckpointUnavailable, error.to_string());
        if self.state.status.is_terminal() {
            error!(session_id = %self.state.id, status = %self.state.status, error = %error, "Terminal state could not be checkpointed");
            self.publish_snapshot();
            return;
        }
        if let Err(e) = self
            .state
            .transition(SessionStatus::Suspended, &reason.to_string())
        {
            error!(session_id = %self.state.id, error = %e, "Cannot suspend session");
            return;
        }
        warn!(session_id = %self.state.id, error = %error, "Session suspended until checkpoints succeed");
        let (session_id, timestamp) = self.event_base();
        self.events.publish(ProgressEvent::Suspended {
            session_id,
            reason,
            timestamp,
        });
        self.publish_snapshot();
    }

    async fn advance(&mut self, to: SessionStatus, reason: &str, events: Vec<ProgressEvent>) -> bool {
        if let Err(e) = self.state.transition(to, reason) {
            error!(session_id = %self.state.id, error = %e, "Rejected session transition");
            return false;
        }
        info!(session_id = %self.state.id, status = %to, reason, "Session transition");
        self.commit(reason, events).await
    }

    async fn fail(&mut self, reason: FailureReason) {
        warn!(session_id = %self.state.id, reason = %reason, "Session failed");
        if let Err(e) = self.state.fail(reason.clone()) {
            error!(session_id = %self.state.id, error = %e, "Rejected session failure");
            return;
        }
        let (session_id, timestamp) = self.event_base();
        let detail = reason.to_string();
        self.commit(
            &detail,
            vec![ProgressEvent::Failed {
                session_id,
                reason,
                timestamp,
            }],
        )
        .await;
    }

    async fn kill(&mut self) {
        if let Err(e) = self.state.transition(SessionStatus::Killed, "terminated by caller") {
            error!(session_id = %self.state.id, error = %e, "Cannot kill session");
            return;
        }
        self.state.failure = Some(FailureReason::new(ReasonCode::Killed, "terminated by caller"));
        info!(session_id = %self.state.id, "Session killed");
        let (session_id, timestamp) = self.event_base();
        self.commit(
            "killed",
            vec![ProgressEvent::Killed {
                session_id,
                timestamp,
            }],
        )
        .await;
    }

    /// Decompose (unless a committed decomposition exists), then run the
    /// clarification gate.
    async fn plan(&mut self) {
        if !self.state.problem.is_decomposed() {
            let outcome = Decomposer::new(&self.caller, &self.config)
                .decompose(&self.state.problem)
                .await;
            match outcome {
                Ok(decomposition) => {
                    self.state.cumulative_cost += decomposition.cost;
                    let sub_problems = decomposition.problem.sub_problems.len();
                    let complexity = decomposition.problem.complexity;
                    self.state.install_decomposition(decomposition.problem);
                    let (session_id, timestamp) = self.event_base();
                    let event = ProgressEvent::DecompositionComplete {
                        session_id,
                        sub_problems,
                        complexity,
                        timestamp,
                    };
                    if !self.commit("decomposed", vec![event]).await {
                        return;
                    }
                }
                Err(e) => {
                    let code = match e {
                        DecompositionError::Call(_) => ReasonCode::TransientCallFailure,
                        DecompositionError::Invalid { .. } => ReasonCode::DecompositionInvalid,
                    };
                    self.fail(FailureReason::new(code, e.to_string())).await;
                    return;
                }
            }
        }
        if self.cancel.is_cancelled() {
            return;
        }

        let gate = ClarificationGate::new(&self.caller, &self.config)
            .check(&self.state.problem, &self.state.answered_question_sets)
            .await;
        self.state.cumulative_cost += gate.cost;
        if self.cancel.is_cancelled() {
            return;
        }

        if gate.should_pause() {
            self.state.clarification = Some(ClarificationRequest::new(gate.questions.clone()));
            let (session_id, timestamp) = self.event_base();
            self.advance(
                SessionStatus::PausedForClarification,
                "critical information missing",
                vec![ProgressEvent::Paused {
                    session_id,
                    questions: gate.questions,
                    timestamp,
                }],
            )
            .await;
        } else {
            self.advance(SessionStatus::Deliberating, "no critical questions", Vec::new())
                .await;
        }
    }

    fn halting(&self) -> bool {
        self.cancel.is_cancelled() || self.state.status != SessionStatus::Deliberating
    }

    /// Schedule and supervise sub-problem workers until every sub-problem
    /// is terminal, then move to synthesis.
    async fn deliberate(&mut self) {
        let scheduler = match DependencyScheduler::new(
            &self.state.problem.sub_problems,
            &self.config.scheduler,
        ) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                self.fail(FailureReason::new(ReasonCode::DecompositionInvalid, e.to_string()))
                    .await;
                return;
            }
        };
        let policy = StoppingPolicy::new(self.config.stopping.clone(), self.state.criticality);
        let budget = SessionBudget::from_config(&self.config.budget);
        let (tx, mut rx) = mpsc::channel::<UpdateEnvelope>(UPDATE_CHANNEL_CAPACITY);
        let mut workers: JoinSet<(usize, bool)> = JoinSet::new();
        let mut running: HashSet<usize> = HashSet::new();
        let mut held: HashMap<usize, UpdateEnvelope> = HashMap::new();

        // Sub-problems in flight at the last checkpoint pick up where they were.
        let in_flight: Vec<Launch> = self
            .state
            .problem
            .sub_problems
            .iter()
            .filter(|s| s.status.is_active())
            .map(|s| Launch {
                index: s.index,
                speculative_inputs: self.state.progress[s.index].speculative_inputs.clone(),
            })
            .collect();
        for launch in in_flight {
            info!(session_id = %self.state.id, sub_problem = launch.index, "Resuming sub-problem");
            running.insert(launch.index);
            self.spawn_worker(&mut workers, &tx, &policy, launch);
        }

        info!(
            session_id = %self.state.id,
            mode = ?scheduler.mode(),
            sub_problems = self.state.problem.sub_problems.len(),
            "Deliberation started"
        );

        loop {
            if !self.halting() {
                if !self.settle_blocked(&scheduler, &budget, &running, &mut held).await {
                    continue;
                }
                self.release_held(&scheduler, &budget, &mut held).await;
            }
            if self.halting() {
                for (_, envelope) in held.drain() {
                    let _ = envelope.ack.send(Directive::Stop);
                }
            } else {
                let running_now: Vec<usize> = running.iter().copied().collect();
                let launches = scheduler.ready(
                    &self.state.problem.sub_problems,
                    &self.state.progress,
                    &running_now,
                );
                for launch in launches {
                    info!(
                        session_id = %self.state.id,
                        sub_problem = launch.index,
                        speculative_inputs = ?launch.speculative_inputs,
                        "Launching sub-problem"
                    );
                    self.state.progress[launch.index].speculative_inputs =
                        launch.speculative_inputs.clone();
                    running.insert(launch.index);
                    self.spawn_worker(&mut workers, &tx, &policy, launch);
                }
            }
            if workers.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                Some(envelope) = rx.recv() => {
                    if self.halting() {
                        let _ = envelope.ack.send(Directive::Stop);
                    } else if self.must_hold(&scheduler, &envelope) {
                        info!(session_id = %self.state.id, sub_problem = envelope.index, "Result held until prerequisites complete");
                        held.insert(envelope.index, envelope);
                    } else {
                        let directive = self.apply(envelope.index, envelope.update, &budget).await;
                        let _ = envelope.ack.send(directive);
                    }
                }
                Some(joined) = workers.join_next() => match joined {
                    Ok((index, finished)) => {
                        running.remove(&index);
                        if !self.halting() {
                            self.reap(index, finished).await;
                        }
                    }
                    Err(e) => error!(session_id = %self.state.id, error = %e, "Sub-problem worker lost"),
                },
            }
        }

        if self.halting() {
            return;
        }

        let leftovers: Vec<usize> = self
            .state
            .problem
            .sub_problems
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.index)
            .collect();
        for index in leftovers {
            error!(session_id = %self.state.id, sub_problem = index, "Sub-problem never reached a terminal state");
            let reason = FailureReason::new(ReasonCode::WorkerAborted, "never reached a terminal state");
            if !self.fail_sub_problem(index, reason).await {
                return;
            }
        }

        self.advance(
            SessionStatus::Synthesizing,
            "all sub-problems terminal",
            Vec::new(),
        )
        .await;
    }

    /// A completion from a sub-problem whose prerequisites are not all
    /// complete yet.
    fn must_hold(&self, scheduler: &DependencyScheduler, envelope: &UpdateEnvelope) -> bool {
        matches!(envelope.update, SubProblemUpdate::Completed { .. })
            && self
                .state
                .sub_problem_status(envelope.index)
                .is_some_and(|status| !status.is_terminal())
            && !scheduler.prerequisites_complete(&self.state.problem.sub_problems, envelope.index)
    }

    /// Apply held completions whose prerequisites have all completed.
    async fn release_held(
        &mut self,
        scheduler: &DependencyScheduler,
        budget: &SessionBudget,
        held: &mut HashMap<usize, UpdateEnvelope>,
    ) {
        let mut ready: Vec<usize> = held
            .keys()
            .copied()
            .filter(|&i| scheduler.prerequisites_complete(&self.state.problem.sub_problems, i))
            .collect();
        ready.sort_unstable();
        for index in ready {
            if self.halting() {
                return;
            }
            if let Some(envelope) = held.remove(&index) {
                info!(session_id = %self.state.id, sub_problem = index, "Releasing held result");
                let directive = self.apply(index, envelope.update, budget).await;
                let _ = envelope.ack.send(directive);
            }
        }
    }

    /// Fail sub-problems that must not finish: those behind a failed
    /// prerequisite, started or not, and every unstarted one once the
    /// budget is spent. A held result of a blocked sub-problem is dropped.
    async fn settle_blocked(
        &mut self,
        scheduler: &DependencyScheduler,
        budget: &SessionBudget,
        running: &HashSet<usize>,
        held: &mut HashMap<usize, UpdateEnvelope>,
    ) -> bool {
        let mut settled: Vec<(usize, FailureReason)> = scheduler
            .blocked(&self.state.problem.sub_problems)
            .into_iter()
            .map(|(index, prerequisite)| {
                (
                    index,
                    FailureReason::new(
                        ReasonCode::BlockedByDependency,
                        format!("prerequisite sub-problem {} failed", prerequisite),
                    ),
                )
            })
            .collect();

        if let Some(limit) = budget.exhausted(&self.state, Utc::now()) {
            for sub in &self.state.problem.sub_problems {
                if sub.status.is_unstarted()
                    && !running.contains(&sub.index)
                    && !settled.iter().any(|(i, _)| *i == sub.index)
                {
                    settled.push((
                        sub.index,
                        FailureReason::new(ReasonCode::BudgetExhausted, limit.clone()),
                    ));
                }
            }
        }

        if settled.is_empty() {
            return true;
        }
        let mut events = Vec::with_capacity(settled.len());
        for (index, reason) in settled {
            warn!(session_id = %self.state.id, sub_problem = index, reason = %reason, "Sub-problem will not finish");
            if let Err(e) = self.state.problem.sub_problems[index].transition(SubProblemStatus::Failed) {
                error!(session_id = %self.state.id, sub_problem = index, error = %e, "Rejected sub-problem transition");
                continue;
            }
            if let Some(envelope) = held.remove(&index) {
                if let SubProblemUpdate::Completed { result } = &envelope.update {
                    self.discard_result(index, result);
                }
                let _ = envelope.ack.send(Directive::Stop);
            }
            self.state.progress[index].failure = Some(reason.clone());
            let (session_id, timestamp) = self.event_base();
            events.push(ProgressEvent::SubProblemFailed {
                session_id,
                sub_problem: index,
                reason,
                timestamp,
            });
        }
        self.commit("blocked sub-problems settled", events).await
    }

    /// Book the spend of a result that will not be kept.
    fn discard_result(&mut self, index: usize, result: &crate::state::SubProblemResult) {
        let progress = &mut self.state.progress[index];
        let delta = result.total_cost.saturating_sub(progress.cost);
        progress.cost += delta;
        self.state.cumulative_cost += delta;
        debug!(session_id = %self.state.id, sub_problem = index, "Dropped result of blocked sub-problem");
    }

    async fn fail_sub_problem(&mut self, index: usize, reason: FailureReason) -> bool {
        if let Err(e) = self.state.problem.sub_problems[index].transition(SubProblemStatus::Failed) {
            error!(session_id = %self.state.id, sub_problem = index, error = %e, "Rejected sub-problem transition");
            return true;
        }
        self.state.progress[index].failure = Some(reason.clone());
        let (session_id, timestamp) = self.event_base();
        self.commit(
            "sub-problem failed",
            vec![ProgressEvent::SubProblemFailed {
                session_id,
                sub_problem: index,
                reason,
                timestamp,
            }],
        )
        .await
    }

    /// A worker exited; fail its sub-problem if it did not finish it.
    async fn reap(&mut self, index: usize, finished: bool) {
        let status = match self.state.sub_problem_status(index) {
            Some(status) => status,
            None => return,
        };
        if status.is_terminal() {
            return;
        }
        let detail = if finished {
            "worker exited before a terminal state"
        } else {
            "worker panicked"
        };
        error!(session_id = %self.state.id, sub_problem = index, detail, "Sub-problem worker aborted");
        self.fail_sub_problem(index, FailureReason::new(ReasonCode::WorkerAborted, detail))
            .await;
    }

    fn upstream_for(&self, index: usize) -> Vec<UpstreamContext> {
        let sub_problems = &self.state.problem.sub_problems;
        sub_problems[index]
            .dependency_indices
            .iter()
            .filter_map(|&d| {
                let dependency = sub_problems.get(d)?;
                let progress = self.state.progress.get(d)?;
                let context = match &progress.result {
                    Some(result) if dependency.status == SubProblemStatus::Complete => {
                        UpstreamContext {
                            index: d,
                            goal: dependency.goal.clone(),
                            provisional: false,
                            summary: result.synthesis_text.clone(),
                        }
                    }
                    _ => UpstreamContext {
                        index: d,
                        goal: dependency.goal.clone(),
                        provisional: true,
                        summary: provisional_summary(progress),
                    },
                };
                Some(context)
            })
            .collect()
    }

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<(usize, bool)>,
        updates: &mpsc::Sender<UpdateEnvelope>,
        policy: &StoppingPolicy,
        launch: Launch,
    ) {
        let index = launch.index;
        let worker = SubProblemScheduler {
            problem: self.state.problem.clone(),
            sub_problem: self.state.problem.sub_problems[index].clone(),
            progress: self.state.progress[index].clone(),
            upstream: self.upstream_for(index),
            catalog: Arc::clone(&self.catalog),
            config: Arc::clone(&self.config),
            caller: self.caller.clone(),
            policy: policy.clone(),
            updates: updates.clone(),
        };
        workers.spawn(async move {
            let finished = AssertUnwindSafe(worker.run()).catch_unwind().await.is_ok();
            (index, finished)
        });
    }

    /// Apply one worker update, checkpoint it, and answer the worker.
    async fn apply(
        &mut self,
        index: usize,
        update: SubProblemUpdate,
        budget: &SessionBudget,
    ) -> Directive {
        if index >= self.state.problem.sub_problems.len() {
            error!(session_id = %self.state.id, sub_problem = index, "Update for unknown sub-problem");
            return Directive::Stop;
        }
        if self.state.problem.sub_problems[index].status.is_terminal() {
            debug!(session_id = %self.state.id, sub_problem = index, kind = update.kind(), "Update for settled sub-problem dropped");
            return Directive::Stop;
        }
        let session_id = self.state.id.clone();
        let timestamp = Utc::now();
        let mut directive = Directive::Continue;
        let mut events = Vec::new();

        let next_status = match &update {
            SubProblemUpdate::Started { .. } => Some(SubProblemStatus::Running),
            SubProblemUpdate::RoundCompleted { .. } => None,
            SubProblemUpdate::VotingStarted => Some(SubProblemStatus::Voting),
            SubProblemUpdate::VotesCollected { .. } => Some(SubProblemStatus::Synthesizing),
            SubProblemUpdate::Completed { .. } => Some(SubProblemStatus::Complete),
            SubProblemUpdate::Failed { .. } => Some(SubProblemStatus::Failed),
        };
        if let Some(to) = next_status {
            if let Err(e) = self.state.problem.sub_problems[index].transition(to) {
                error!(session_id = %session_id, sub_problem = index, error = %e, "Rejected sub-problem transition");
                return Directive::Stop;
            }
        }
        let reason = format!("sub-problem {} {}", index, update.kind());

        match update {
            SubProblemUpdate::Started { panel } => {
                let progress = &mut self.state.progress[index];
                progress.panel = Some(panel);
                events.push(ProgressEvent::SubProblemStarted {
                    session_id,
                    sub_problem: index,
                    speculative: !progress.speculative_inputs.is_empty(),
                    timestamp,
                });
            }
            SubProblemUpdate::RoundCompleted { outcome } => {
                {
                    let progress = &mut self.state.progress[index];
                    progress.contributions.extend(outcome.contributions);
                    if let Some(assessment) = &outcome.assessment {
                        progress.assessments.push(assessment.clone());
                    }
                    progress.rounds_completed = outcome.round;
                    progress.cost += outcome.cost;
                }
                self.state.cumulative_cost += outcome.cost;
                self.state.cumulative_rounds += 1;

                let mut decision = outcome.decision;
                if !decision.moves_to_voting() {
                    if let Some(limit) = budget.exhausted(&self.state, timestamp) {
                        decision = StopDecision::BudgetExhausted {
                            limit: limit.clone(),
                        };
                        directive = Directive::ForceVote { limit };
                    }
                }

                let progress = &mut self.state.progress[index];
                progress.follow_up = decision.follow_up_aspects().to_vec();
                if decision.moves_to_voting() {
                    progress.stop = Some(decision.clone());
                }
                let (exploration, convergence, focus, novelty) = outcome
                    .assessment
                    .as_ref()
                    .map(|a| {
                        (
                            a.exploration_score,
                            a.convergence_score,
                            a.focus_score,
                            a.novelty_score,
                        )
                    })
                    .unwrap_or_default();
                info!(
                    session_id = %session_id,
                    sub_problem = index,
                    round = outcome.round,
                    exploration,
                    convergence,
                    focus,
                    novelty,
                    decision = %decision,
                    "Round complete"
                );
                events.push(ProgressEvent::RoundComplete {
                    session_id,
                    sub_problem: index,
                    round: outcome.round,
                    exploration,
                    convergence,
                    focus,
                    novelty,
                    decision: decision.to_string(),
                    timestamp,
                });
            }
            SubProblemUpdate::VotingStarted => {}
            SubProblemUpdate::VotesCollected { outcome } => {
                let progress = &mut self.state.progress[index];
                progress.recommendations = outcome.recommendations;
                progress.abstentions = outcome.abstentions;
                progress.cost += outcome.cost;
                self.state.cumulative_cost += outcome.cost;
            }
            SubProblemUpdate::Completed { result } => {
                let rounds = result.round_count;
                let degraded = result.degraded;
                self.record_result(index, result);
                events.push(ProgressEvent::SubProblemComplete {
                    session_id,
                    sub_problem: index,
                    rounds,
                    degraded,
                    timestamp,
                });
            }
            SubProblemUpdate::Failed { reason, partial } => {
                warn!(session_id = %session_id, sub_problem = index, reason = %reason, "Sub-problem failed");
                if let Some(partial) = partial {
                    self.record_result(index, partial);
                }
                self.state.progress[index].failure = Some(reason.clone());
                events.push(ProgressEvent::SubProblemFailed {
                    session_id,
                    sub_problem: index,
                    reason,
                    timestamp,
                });
            }
        }

        if !self.commit(&reason, events).await || self.cancel.is_cancelled() {
            return Directive::Stop;
        }
        directive
    }

    fn record_result(&mut self, index: usize, result: crate::state::SubProblemResult) {
        let progress = &mut self.state.progress[index];
        let delta = result.total_cost.saturating_sub(progress.cost);
        progress.cost = result.total_cost;
        progress.result = Some(result.clone());
        self.state.cumulative_cost += delta;
        self.state.sub_problem_results.push(result);
    }

    async fn synthesize(&mut self) {
        let mut results = self.state.sub_problem_results.clone();
        results.sort_by_key(|r| r.sub_problem_index);
        let gaps: Vec<ReportGap> = self
            .state
            .problem
            .sub_problems
            .iter()
            .filter(|s| s.status == SubProblemStatus::Failed)
            .map(|s| ReportGap {
                sub_problem_index: s.index,
                goal: s.goal.clone(),
                reason: self.state.progress[s.index]
                    .failure
                    .clone()
                    .unwrap_or_else(|| {
                        FailureReason::new(ReasonCode::WorkerAborted, "no failure recorded")
                    }),
            })
            .collect();

        if results.is_empty() {
            self.fail(FailureReason::new(
                ReasonCode::NoCompletedSubProblems,
                format!("all {} sub-problems failed", gaps.len()),
            ))
            .await;
            return;
        }

        let (report, cost) = MetaSynthesizer::new(&self.caller, &self.config)
            .synthesize(&self.state.problem, &results, gaps)
            .await;
        if self.cancel.is_cancelled() {
            return;
        }
        self.state.cumulative_cost += cost;
        let degraded = report.degraded || results.iter().any(|r| r.degraded);
        let gap_count = report.gaps.len();
        self.state.report = Some(report);
        let (session_id, timestamp) = self.event_base();
        self.advance(
            SessionStatus::Completed,
            "final report ready",
            vec![ProgressEvent::Completed {
                session_id,
                gaps: gap_count,
                degraded,
                timestamp,
            }],
        )
        .await;
    }
}

/// What a dependent sees of a prerequisite that is still deliberating.
fn provisional_summary(progress: &SubProblemProgress) -> String {
    let mut out = String::new();
    if let Some(leading) = progress
        .assessments
        .last()
        .and_then(|a| a.leading_option.as_deref())
    {
        out.push_str(&format!(
            "After {} rounds the panel leans towards: {}.\n",
            progress.rounds_completed, leading
        ));
    }
    for c in progress.last_round_contributions() {
        let excerpt: String = c.content.chars().take(PROVISIONAL_EXCERPT_CHARS).collect();
        out.push_str(&format!("- {}: {}\n", c.expert_id, excerpt));
    }
    if out.is_empty() {
        out.push_str("No findings yet.");
    }
    out
}
