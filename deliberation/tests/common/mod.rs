//! Shared fixtures for engine integration tests: scripted inference,
//! a checkpoint store that can be made to fail, and canned replies.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use deliberation::checkpoint::{
    CheckpointError, CheckpointStore, MemoryCheckpointStore, SharedCheckpointStore,
};
use deliberation::inference::{
    InferenceError, InferenceRequest, InferenceResponse, InferenceService, Role, SharedInference,
};
use deliberation::{DeliberationEngine, EngineConfig};

/// Token cost reported for every scripted call.
pub const CALL_COST: u64 = 10;

type Responder = Arc<dyn Fn(&InferenceRequest, u32) -> Result<String, InferenceError> + Send + Sync>;

/// Replies per role from closures, with an optional delay on every call.
#[derive(Default)]
pub struct ScriptedInference {
    responders: Mutex<HashMap<Role, Responder>>,
    calls: Mutex<HashMap<Role, u32>>,
    delay: Option<Duration>,
}

impl ScriptedInference {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(self, role: Role, f: F) -> Self
    where
        F: Fn(&InferenceRequest, u32) -> Result<String, InferenceError> + Send + Sync + 'static,
    {
        self.responders.lock().unwrap().insert(role, Arc::new(f));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self, role: Role) -> u32 {
        self.calls.lock().unwrap().get(&role).copied().unwrap_or(0)
    }
}

#[async_trait]
impl InferenceService for ScriptedInference {
    fn provider(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let entry = calls.entry(request.role).or_insert(0);
            *entry += 1;
            *entry - 1
        };
        let responder = self
            .responders
            .lock()
            .unwrap()
            .get(&request.role)
            .cloned()
            .ok_or_else(|| InferenceError::Http {
                status: 400,
                body: format!("no script for {}", request.role),
            })?;
        let content = responder(request, n)?;
        Ok(InferenceResponse {
            content,
            token_cost: CALL_COST,
        })
    }
}

/// In-memory store whose writes start failing after `allowed` successes
/// until healed.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryCheckpointStore,
    remaining: AtomicUsize,
    limited: AtomicBool,
}

impl FlakyStore {
    pub fn failing_after(allowed: usize) -> Self {
        Self {
            inner: MemoryCheckpointStore::new(),
            remaining: AtomicUsize::new(allowed),
            limited: AtomicBool::new(true),
        }
    }

    pub fn heal(&self) {
        self.limited.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for FlakyStore {
    async fn put(&self, session_id: &str, serialized: String) -> Result<(), CheckpointError> {
        if self.limited.load(Ordering::SeqCst) {
            let granted = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !granted {
                return Err(CheckpointError::Store("disk full".into()));
            }
        }
        self.inner.put(session_id, serialized).await
    }

    async fn get(&self, session_id: &str) -> Result<Option<String>, CheckpointError> {
        self.inner.get(session_id).await
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        self.inner.list().await
    }
}

/// Defaults with millisecond retries and checkpoint backoff.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.caller.retry.initial_backoff_ms = 1;
    config.caller.retry.max_backoff_ms = 2;
    config.checkpoint.backoff_ms = 1;
    config
}

pub fn engine(
    config: EngineConfig,
    inference: Arc<ScriptedInference>,
    store: SharedCheckpointStore,
) -> DeliberationEngine {
    let provider: SharedInference = inference;
    DeliberationEngine::new(config, vec![provider], store)
}

pub fn memory_store() -> SharedCheckpointStore {
    Arc::new(MemoryCheckpointStore::new())
}

/// Two sub-problems; the second builds on the first.
pub const CHAIN_DECOMPOSITION: &str = r#"{"complexity": 0.5, "sub_problems": [
    {"goal": "Estimate migration cost and budget risk", "depends_on": [], "complexity": 0.5},
    {"goal": "Plan the engineering rollout and operations handover", "depends_on": [0], "complexity": 0.5}
]}"#;

/// Panel ids listed in a judge prompt.
pub fn panel_ids(prompt: &str) -> Vec<String> {
    prompt
        .split("## Panel\n\n")
        .nth(1)
        .and_then(|rest| rest.lines().next())
        .map(|line| line.split(", ").map(str::to_string).collect())
        .unwrap_or_default()
}

/// A judge reply with full coverage where every panel member backs
/// `option`; readiness clears the standard target once the minimum
/// rounds are in.
pub fn converged_judge(prompt: &str, option: &str) -> String {
    let positions: Vec<String> = panel_ids(prompt)
        .iter()
        .map(|id| format!(r#"{{"expert_id": "{id}", "option": "{option}", "confidence": 0.9}}"#))
        .collect();
    format!(
        r#"{{"coverage": {{"problem_clarity": "deep", "objectives": "deep", "options": "deep",
            "risks": "deep", "constraints": "deep", "stakeholders": "deep", "dependencies": "deep"}},
            "positions": [{}], "on_topic_fraction": 0.9, "novel_fraction": 0.5,
            "missing_aspects": [], "recommended_action": "vote"}}"#,
        positions.join(", ")
    )
}

/// A judge reply that never lets the debate settle: the risks aspect is
/// never covered.
pub const OPEN_JUDGE: &str = r#"{"coverage": {"problem_clarity": "deep", "objectives": "deep",
    "options": "shallow", "risks": "none"}, "positions": [], "on_topic_fraction": 0.8,
    "novel_fraction": 0.9, "missing_aspects": ["risks"], "recommended_action": "continue"}"#;

pub const VOTE: &str = r#"{"preferred_option": "phased migration", "confidence": 0.8, "rationale": "limits risk"}"#;

/// Every role answered; no clarification questions.
pub fn happy_script(decomposition: &'static str) -> ScriptedInference {
    ScriptedInference::new()
        .on(Role::Planner, move |_, _| Ok(decomposition.to_string()))
        .on(Role::Clarifier, |_, _| Ok(r#"{"questions": []}"#.into()))
        .on(Role::Expert, |req, n| {
            Ok(format!("Point {n}: {}", req.system.split('.').next().unwrap_or("")))
        })
        .on(Role::Judge, |req, _| Ok(converged_judge(&req.prompt, "phased migration")))
        .on(Role::Voter, |_, _| Ok(VOTE.into()))
        .on(Role::Synthesizer, |req, _| {
            Ok(format!("Synthesis of: {}", req.prompt.lines().nth(2).unwrap_or("")))
        })
        .on(Role::MetaSynthesizer, |_, _| Ok("Adopt a phased migration.".into()))
}
