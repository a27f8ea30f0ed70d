//! Session orchestration and the control surface.
//!
//! [`DeliberationEngine`] owns the registry of live sessions. Each session
//! is driven by its own task (see `driver`), which exclusively owns and
//! mutates that session's [`SessionState`]; callers only ever see
//! snapshots published through a watch channel.
//!
//! ```text
//! created → decomposing ─┬→ paused_for_clarification ─(answers)─┐
//!                        └→ deliberating ←─────────────────────┘
//!                              → synthesizing → completed | failed
//! any non-terminal ──terminate──→ killed
//! any non-terminal ──checkpoint store down──→ suspended ──resume──→ (previous)
//! ```

mod budget;
mod driver;

pub use budget::SessionBudget;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointError, CheckpointManager, SharedCheckpointStore};
use crate::config::EngineConfig;
use crate::debate::ExpertCatalog;
use crate::error::{EngineError, EngineResult, FailureReason, ReasonCode};
use crate::events::{EventBus, ProgressEvent, SharedEventBus};
use crate::inference::{ExpertCaller, SessionCaller, SharedInference};
use crate::state::{Criticality, Problem, SessionId, SessionState, SessionStatus};
use driver::SessionDriver;

struct SessionHandle {
    /// Closed once the driver exits.
    snapshot: watch::Receiver<SessionState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<SessionState>>,
}

impl SessionHandle {
    fn state(&self) -> SessionState {
        self.snapshot.borrow().clone()
    }

    fn driver_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// A driver that published an at-rest state is about to exit; let it.
    async fn settle(&mut self) {
        if !self.state().status.is_at_rest() {
            return;
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Session driver ended abnormally");
            }
        }
    }
}

/// Runs deliberation sessions.
pub struct DeliberationEngine {
    config: Arc<EngineConfig>,
    caller: Arc<ExpertCaller>,
    checkpoints: Arc<CheckpointManager>,
    events: SharedEventBus,
    catalog: Arc<ExpertCatalog>,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl DeliberationEngine {
    pub fn new(
        config: EngineConfig,
        providers: Vec<SharedInference>,
        store: SharedCheckpointStore,
    ) -> Self {
        let caller = ExpertCaller::new(providers, &config.caller).shared();
        let checkpoints = Arc::new(CheckpointManager::new(store, config.checkpoint.clone()));
        let catalog = Arc::new(ExpertCatalog::from_experts(&config.experts));
        Self {
            config: Arc::new(config),
            caller,
            checkpoints,
            events: EventBus::new().shared(),
            catalog,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Progress events for every session.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Start a standard-criticality session.
    pub async fn start(
        &self,
        statement: &str,
        context: &str,
        constraints: Vec<String>,
    ) -> EngineResult<SessionId> {
        self.start_with(
            Problem::new(statement, context, constraints),
            Criticality::Standard,
        )
        .await
    }

    pub async fn start_with(
        &self,
        problem: Problem,
        criticality: Criticality,
    ) -> EngineResult<SessionId> {
        if problem.statement.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "problem statement is empty".into(),
            ));
        }
        let problem = Problem::new(problem.statement.trim(), &problem.context, problem.constraints);
        let state = SessionState::new(problem, criticality);
        let id = state.id.clone();
        info!(session_id = %id, ?criticality, "Session accepted");
        self.events.publish(ProgressEvent::SessionStarted {
            session_id: id.clone(),
            timestamp: Utc::now(),
        });

        let mut sessions = self.sessions.lock().await;
        let handle = self.spawn_driver(state);
        sessions.insert(id.clone(), handle);
        Ok(id)
    }

    fn spawn_driver(&self, state: SessionState) -> SessionHandle {
        let (snapshot, receiver) = watch::channel(state.clone());
        let cancel = CancellationToken::new();
        let driver = SessionDriver {
            state,
            config: Arc::clone(&self.config),
            caller: SessionCaller::new(
                Arc::clone(&self.caller),
                self.config.caller.session_concurrency,
            ),
            checkpoints: Arc::clone(&self.checkpoints),
            events: Arc::clone(&self.events),
            catalog: Arc::clone(&self.catalog),
            snapshot,
            cancel: cancel.clone(),
        };
        SessionHandle {
            snapshot: receiver,
            cancel,
            task: Some(tokio::spawn(driver.run())),
        }
    }

    /// A handle with no driver, for sessions at rest.
    fn idle_handle(state: SessionState) -> SessionHandle {
        let (_, snapshot) = watch::channel(state);
        SessionHandle {
            snapshot,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Current state from the registry, or the checkpoint store.
    async fn locate(
        &self,
        sessions: &HashMap<SessionId, SessionHandle>,
        session_id: &str,
    ) -> EngineResult<SessionState> {
        if let Some(handle) = sessions.get(session_id) {
            return Ok(handle.state());
        }
        match self.checkpoints.load(session_id).await {
            Ok(state) => Ok(state),
            Err(CheckpointError::NotFound(_)) | Err(CheckpointError::InvalidKey(_)) => {
                Err(EngineError::SessionNotFound(session_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Merge clarification answers and resume deliberation after the gate.
    ///
    /// Answers for a question set that was already answered are a no-op
    /// returning the current state.
    pub async fn submit_clarification(
        &self,
        session_id: &str,
        answers: BTreeMap<String, String>,
    ) -> EngineResult<SessionState> {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get_mut(session_id) {
            handle.settle().await;
        }
        let mut state = self.locate(&sessions, session_id).await?;

        if state.status != SessionStatus::PausedForClarification {
            if state.clarification.is_none() && !state.answered_question_sets.is_empty() {
                info!(session_id, status = %state.status, "Clarification already applied");
                return Ok(state);
            }
            return Err(EngineError::NotAwaitingClarification {
                id: session_id.to_string(),
                status: state.status,
            });
        }
        if answers.values().all(|a| a.trim().is_empty()) {
            return Err(EngineError::InvalidRequest("no answers given".into()));
        }

        let request = match state.clarification.as_ref() {
            Some(request) => request,
            None => {
                return Err(EngineError::InvalidRequest(
                    "paused session has no questions".into(),
                ))
            }
        };
        let mut merged = String::from("Clarifications:");
        for question in &request.questions {
            let answer = answers
                .get(question)
                .map(|a| a.trim())
                .filter(|a| !a.is_empty())
                .unwrap_or("(no answer)");
            merged.push_str(&format!("\n- Q: {}\n  A: {}", question, answer));
        }
        for (question, answer) in &answers {
            if !request.questions.contains(question) && !answer.trim().is_empty() {
                merged.push_str(&format!("\n- {}: {}", question, answer.trim()));
            }
        }
        let fingerprint = request.fingerprint();
        state.clarification = None;

        if state.problem.context.trim().is_empty() {
            state.problem.context = merged;
        } else {
            state.problem.context = format!("{}\n\n{}", state.problem.context.trim_end(), merged);
        }
        state.answered_question_sets.push(fingerprint);
        state
            .transition(SessionStatus::Deliberating, "clarification answered")
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        self.checkpoints
            .save(&mut state, "clarification answered")
            .await?;

        info!(session_id, "Clarification merged, resuming deliberation");
        self.events.publish(ProgressEvent::Resumed {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
        });
        let handle = self.spawn_driver(state.clone());
        sessions.insert(session_id.to_string(), handle);
        Ok(state)
    }

    /// Request cooperative termination.
    ///
    /// A running session stops at its next transition boundary; a session
    /// at rest is killed immediately. Terminal sessions are left as they are.
    pub async fn terminate(&self, session_id: &str) -> EngineResult<()> {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get_mut(session_id) {
            handle.settle().await;
            if handle.driver_running() {
                info!(session_id, "Termination requested");
                handle.cancel.cancel();
                return Ok(());
            }
        }

        let mut state = self.locate(&sessions, session_id).await?;
        if state.status.is_terminal() {
            return Ok(());
        }
        state
            .transition(SessionStatus::Killed, "terminated by caller")
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        state.failure = Some(FailureReason::new(ReasonCode::Killed, "terminated by caller"));
        if let Err(e) = self.checkpoints.save(&mut state, "killed").await {
            warn!(session_id, error = %e, "Kill could not be checkpointed");
        }
        info!(session_id, "Session killed");
        self.events.publish(ProgressEvent::Killed {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
        });
        sessions.insert(session_id.to_string(), Self::idle_handle(state));
        Ok(())
    }

    pub async fn get_state(&self, session_id: &str) -> EngineResult<SessionState> {
        let sessions = self.sessions.lock().await;
        self.locate(&sessions, session_id).await
    }

    /// Continue a session from its last state: a suspended session in this
    /// process, or any checkpointed session after a restart.
    ///
    /// Sessions that are running, paused or terminal are returned as is.
    pub async fn resume(&self, session_id: &str) -> EngineResult<SessionState> {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get_mut(session_id) {
            handle.settle().await;
            if handle.driver_running() {
                return Ok(handle.state());
            }
        }
        let mut state = self.locate(&sessions, session_id).await?;

        if state.status == SessionStatus::Suspended {
            let previous = state.suspended_from.unwrap_or(SessionStatus::Created);
            state
                .transition(previous, "resumed after suspension")
                .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        } else if state.status.is_at_rest() {
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Self::idle_handle(state.clone()));
            return Ok(state);
        }

        info!(session_id, status = %state.status, "Resuming session");
        self.events.publish(ProgressEvent::Resumed {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
        });
        let handle = self.spawn_driver(state.clone());
        sessions.insert(session_id.to_string(), handle);
        Ok(state)
    }

    /// Wait until the session is terminal, paused or suspended.
    pub async fn wait(&self, session_id: &str) -> EngineResult<SessionState> {
        let mut receiver = {
            let sessions = self.sessions.lock().await;
            match sessions.get(session_id) {
                Some(handle) => handle.snapshot.clone(),
                None => return self.locate(&sessions, session_id).await,
            }
        };
        let waited = receiver
            .wait_for(|s| s.status.is_at_rest())
            .await
            .map(|state| state.clone());
        let state = match waited {
            Ok(state) => state,
            // Driver gone; its last published snapshot is final.
            Err(_) => receiver.borrow().clone(),
        };
        Ok(state)
    }

    /// Ids and statuses of sessions known to this process.
    pub async fn list_sessions(&self) -> Vec<(SessionId, SessionStatus)> {
        let sessions = self.sessions.lock().await;
        let mut out: Vec<(SessionId, SessionStatus)> = sessions
            .iter()
            .map(|(id, handle)| (id.clone(), handle.snapshot.borrow().status))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
