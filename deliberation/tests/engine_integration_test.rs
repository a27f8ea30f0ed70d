//! End-to-end engine tests with scripted inference (no network).
//!
//! Covers the session lifecycle through the public control surface:
//! decomposition ↔ clarification ↔ scheduling ↔ rounds ↔ voting ↔
//! synthesis ↔ checkpoints.

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{
    converged_judge, engine, fast_config, happy_script, memory_store, FlakyStore,
    ScriptedInference, CHAIN_DECOMPOSITION, OPEN_JUDGE,
};
use deliberation::checkpoint::{
    validate_checkpoint, CheckpointManager, CheckpointStore, FileCheckpointStore, IntegrityStatus,
    MemoryCheckpointStore, SessionCheckpoint,
};
use deliberation::config::{CheckpointConfig, SchedulingMode};
use deliberation::debate::StopDecision;
use deliberation::inference::{InferenceError, Role};
use deliberation::state::SubProblemStatus;
use deliberation::{EngineConfig, EngineError, ProgressEvent, ReasonCode, SessionStatus};

fn drain(rx: &mut tokio::sync::broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn questions_script() -> ScriptedInference {
    happy_script(CHAIN_DECOMPOSITION).on(Role::Clarifier, |_, _| {
        Ok(r#"{"questions": ["Which region hosts the data?", "What is the budget ceiling?"]}"#.into())
    })
}

// ── Happy path ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_session_completes_with_report() {
    let inference = Arc::new(happy_script(CHAIN_DECOMPOSITION));
    let engine = engine(fast_config(), inference.clone(), memory_store());
    let mut events = engine.subscribe();

    let id = engine
        .start("Should we migrate billing to Postgres?", "", vec!["no downtime".into()])
        .await
        .unwrap();
    let state = engine.wait(&id).await.unwrap();

    assert_eq!(state.status, SessionStatus::Completed);
    let report = state.report.as_ref().unwrap();
    assert_eq!(report.text, "Adopt a phased migration.");
    assert!(report.gaps.is_empty());
    assert!(!report.degraded);

    assert_eq!(state.sub_problem_results.len(), 2);
    assert!(state
        .problem
        .sub_problems
        .iter()
        .all(|s| s.status == SubProblemStatus::Complete));
    for progress in &state.progress {
        assert_eq!(progress.rounds_completed, 3);
        assert!(matches!(progress.stop, Some(StopDecision::NaturalStop { .. })));
        assert_eq!(progress.recommendations.len(), 4);
    }
    // Sequential mode: the dependent saw the final synthesis, not a draft.
    assert!(state.progress[1].speculative_inputs.is_empty());
    assert_eq!(inference.calls(Role::Planner), 1);
    assert_eq!(inference.calls(Role::MetaSynthesizer), 1);

    let total: u64 = state.sub_problem_results.iter().map(|r| r.total_cost).sum();
    assert!(state.cumulative_cost > total);
    assert_eq!(state.cumulative_rounds, 6);

    let kinds: Vec<&str> = drain(&mut events).iter().map(|e| e.event_type()).collect();
    assert_eq!(kinds.first(), Some(&"session_started"));
    assert_eq!(kinds.last(), Some(&"completed"));
    assert_eq!(kinds.iter().filter(|k| **k == "round_complete").count(), 6);
    assert_eq!(kinds.iter().filter(|k| **k == "sub_problem_complete").count(), 2);
}

#[tokio::test]
async fn test_empty_problem_rejected() {
    let engine = engine(
        fast_config(),
        Arc::new(happy_script(CHAIN_DECOMPOSITION)),
        memory_store(),
    );
    let err = engine.start("   ", "", vec![]).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_unknown_session_not_found() {
    let engine = engine(
        fast_config(),
        Arc::new(happy_script(CHAIN_DECOMPOSITION)),
        memory_store(),
    );
    let err = engine.get_state("no-such-session").await.unwrap_err();
    assert!(matches!(err, EngineError::SessionNotFound(_)));
}

#[tokio::test]
async fn test_invalid_decomposition_fails_session() {
    let inference = Arc::new(
        happy_script(CHAIN_DECOMPOSITION)
            .on(Role::Planner, |_, _| Ok(r#"{"sub_problems": [{"goal": "a", "depends_on": [0]}]}"#.into())),
    );
    let engine = engine(fast_config(), inference.clone(), memory_store());
    let id = engine.start("Pick a vendor", "", vec![]).await.unwrap();
    let state = engine.wait(&id).await.unwrap();

    assert_eq!(state.status, SessionStatus::Failed);
    assert_eq!(
        state.failure.as_ref().map(|f| f.code),
        Some(ReasonCode::DecompositionInvalid)
    );
    assert_eq!(inference.calls(Role::Planner), 2);
    assert_eq!(inference.calls(Role::Expert), 0);
}

// ── Clarification ──────────────────────────────────────────────────

#[tokio::test]
async fn test_pause_and_resume_without_redecomposition() {
    let inference = Arc::new(questions_script());
    let store = memory_store();
    let engine = engine(fast_config(), inference.clone(), store.clone());

    let id = engine.start("Should we migrate billing?", "", vec![]).await.unwrap();
    let paused = engine.wait(&id).await.unwrap();
    assert_eq!(paused.status, SessionStatus::PausedForClarification);
    assert_eq!(paused.clarification.as_ref().unwrap().questions.len(), 2);
    assert_eq!(inference.calls(Role::Expert), 0);

    let mut answers = BTreeMap::new();
    answers.insert("Which region hosts the data?".to_string(), "EU only".to_string());
    answers.insert("What is the budget ceiling?".to_string(), "200k".to_string());
    let resumed = engine.submit_clarification(&id, answers.clone()).await.unwrap();
    assert_eq!(resumed.status, SessionStatus::Deliberating);
    assert!(resumed.problem.context.contains("Clarifications:"));
    assert!(resumed.problem.context.contains("EU only"));
    assert!(resumed.clarification.is_none());

    let done = engine.wait(&id).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(inference.calls(Role::Planner), 1);
    assert_eq!(inference.calls(Role::Clarifier), 1);
    assert_eq!(done.answered_question_sets.len(), 1);

    // The answered request leaves no trace for restore to complain about.
    let raw = store.get(&id).await.unwrap().unwrap();
    let checkpoint = SessionCheckpoint::from_json(&raw).unwrap();
    assert_eq!(validate_checkpoint(&checkpoint), IntegrityStatus::Valid);

    // A second submission of the same answers changes nothing.
    let again = engine.submit_clarification(&id, answers).await.unwrap();
    assert_eq!(again.status, SessionStatus::Completed);
    assert_eq!(again.answered_question_sets.len(), 1);
}

#[tokio::test]
async fn test_clarification_rejected_when_not_paused() {
    let engine = engine(
        fast_config(),
        Arc::new(happy_script(CHAIN_DECOMPOSITION)),
        memory_store(),
    );
    let id = engine.start("Should we migrate billing?", "", vec![]).await.unwrap();
    engine.wait(&id).await.unwrap();

    let mut answers = BTreeMap::new();
    answers.insert("anything".to_string(), "yes".to_string());
    let err = engine.submit_clarification(&id, answers).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::NotAwaitingClarification {
            status: SessionStatus::Completed,
            ..
        }
    ));
}

// ── Failures and gaps ──────────────────────────────────────────────

#[tokio::test]
async fn test_failed_prerequisite_blocks_dependent() {
    let inference = Arc::new(happy_script(CHAIN_DECOMPOSITION).on(Role::Synthesizer, |req, _| {
        if req.prompt.contains("Estimate migration cost") {
            Err(InferenceError::Http {
                status: 400,
                body: "context too long".into(),
            })
        } else {
            Ok("fine".into())
        }
    }));
    let engine = engine(fast_config(), inference, memory_store());
    let id = engine.start("Should we migrate billing?", "", vec![]).await.unwrap();
    let state = engine.wait(&id).await.unwrap();

    assert_eq!(state.status, SessionStatus::Completed);
    assert_eq!(state.sub_problem_status(0), Some(SubProblemStatus::Failed));
    assert_eq!(state.sub_problem_status(1), Some(SubProblemStatus::Failed));
    assert_eq!(state.progress[1].rounds_completed, 0);

    // The raw-vote result of the first is kept, marked degraded.
    assert_eq!(state.sub_problem_results.len(), 1);
    assert!(state.sub_problem_results[0].degraded);

    let gaps = &state.report.as_ref().unwrap().gaps;
    let codes: Vec<(usize, ReasonCode)> =
        gaps.iter().map(|g| (g.sub_problem_index, g.reason.code)).collect();
    assert_eq!(
        codes,
        vec![
            (0, ReasonCode::SynthesisFailed),
            (1, ReasonCode::BlockedByDependency)
        ]
    );
}

#[tokio::test]
async fn test_budget_exhaustion_forces_vote() {
    let mut config = fast_config();
    // planning 20 + two rounds of 4 experts and a judge (100) crosses 100
    config.budget.max_cost_tokens = 100;
    let inference = Arc::new(happy_script(CHAIN_DECOMPOSITION));
    let engine = engine(config, inference, memory_store());

    let id = engine.start("Should we migrate billing?", "", vec![]).await.unwrap();
    let state = engine.wait(&id).await.unwrap();

    assert_eq!(state.status, SessionStatus::Completed);
    assert_eq!(state.progress[0].rounds_completed, 2);
    assert!(matches!(
        state.progress[0].stop,
        Some(StopDecision::BudgetExhausted { .. })
    ));
    assert_eq!(state.sub_problem_status(0), Some(SubProblemStatus::Complete));
    assert_eq!(state.sub_problem_status(1), Some(SubProblemStatus::Failed));
    assert_eq!(
        state.progress[1].failure.as_ref().map(|f| f.code),
        Some(ReasonCode::BudgetExhausted)
    );
    assert_eq!(state.report.as_ref().unwrap().gaps.len(), 1);
}

#[tokio::test]
async fn test_round_budget_forces_vote() {
    let mut config = fast_config();
    config.budget.max_total_rounds = 2;
    let inference = Arc::new(happy_script(CHAIN_DECOMPOSITION));
    let engine = engine(config, inference.clone(), memory_store());

    let id = engine.start("Should we migrate billing?", "", vec![]).await.unwrap();
    let state = engine.wait(&id).await.unwrap();

    assert_eq!(state.status, SessionStatus::Completed);
    assert_eq!(state.cumulative_rounds, 2);
    assert_eq!(state.progress[0].rounds_completed, 2);
    match &state.progress[0].stop {
        Some(StopDecision::BudgetExhausted { limit }) => assert!(limit.starts_with("rounds")),
        other => panic!("unexpected stop {other:?}"),
    }
    assert_eq!(state.sub_problem_status(0), Some(SubProblemStatus::Complete));
    assert_eq!(
        state.progress[1].failure.as_ref().map(|f| f.code),
        Some(ReasonCode::BudgetExhausted)
    );
    assert_eq!(state.progress[1].rounds_completed, 0);
    // two rounds of four experts, nothing for the second sub-problem
    assert_eq!(inference.calls(Role::Expert), 8);
}

// ── Kill ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_terminate_running_session() {
    let inference = Arc::new(
        happy_script(CHAIN_DECOMPOSITION)
            .on(Role::Judge, |_, _| Ok(OPEN_JUDGE.into()))
            .with_delay(Duration::from_millis(20)),
    );
    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = engine(fast_config(), inference.clone(), store.clone());
    let mut events = engine.subscribe();

    let id = engine.start("Should we migrate billing?", "", vec![]).await.unwrap();
    loop {
        let event = events.recv().await.unwrap();
        if event.event_type() == "round_complete" {
            break;
        }
    }
    engine.terminate(&id).await.unwrap();
    let state = engine.wait(&id).await.unwrap();

    assert_eq!(state.status, SessionStatus::Killed);
    assert_eq!(
        state.failure.as_ref().map(|f| f.code),
        Some(ReasonCode::Killed)
    );
    assert!(state.report.is_none());
    assert_eq!(inference.calls(Role::MetaSynthesizer), 0);

    // Terminal sessions ignore further termination.
    engine.terminate(&id).await.unwrap();

    let stored = CheckpointManager::new(store, CheckpointConfig::default())
        .load(&id)
        .await
        .unwrap();
    assert_eq!(stored.status, SessionStatus::Killed);
}

#[tokio::test]
async fn test_terminate_paused_session() {
    let engine = engine(fast_config(), Arc::new(questions_script()), memory_store());
    let id = engine.start("Should we migrate billing?", "", vec![]).await.unwrap();
    engine.wait(&id).await.unwrap();

    engine.terminate(&id).await.unwrap();
    let state = engine.get_state(&id).await.unwrap();
    assert_eq!(state.status, SessionStatus::Killed);
}

// ── Scheduling ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_speculative_dependent_starts_early() {
    let mut config = fast_config();
    config.scheduler.mode = SchedulingMode::Speculative;
    config.scheduler.early_start_round = 2;

    let saw_provisional = Arc::new(AtomicBool::new(false));
    let flag = saw_provisional.clone();
    let inference = Arc::new(happy_script(CHAIN_DECOMPOSITION).on(Role::Expert, move |req, n| {
        if req.prompt.contains("PROVISIONAL") {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(format!("point {n}"))
    }));
    let engine = engine(config, inference, memory_store());
    let mut events = engine.subscribe();

    let id = engine.start("Should we migrate billing?", "", vec![]).await.unwrap();
    let state = engine.wait(&id).await.unwrap();

    assert_eq!(state.status, SessionStatus::Completed);
    assert_eq!(state.progress[1].speculative_inputs, vec![0]);
    assert!(saw_provisional.load(Ordering::SeqCst));

    let speculative_start = drain(&mut events).into_iter().any(|e| {
        matches!(
            e,
            ProgressEvent::SubProblemStarted {
                sub_problem: 1,
                speculative: true,
                ..
            }
        )
    });
    assert!(speculative_start);
}

/// Speculative chain where the first sub-problem debates to its round cap
/// while the dependent converges quickly, so the dependent finishes first.
fn slow_prerequisite_script() -> ScriptedInference {
    happy_script(CHAIN_DECOMPOSITION).on(Role::Judge, |req, _| {
        if req.prompt.contains("Plan the engineering rollout") {
            Ok(converged_judge(&req.prompt, "phased migration"))
        } else {
            Ok(OPEN_JUDGE.into())
        }
    })
}

fn speculative_config() -> EngineConfig {
    let mut config = fast_config();
    config.scheduler.mode = SchedulingMode::Speculative;
    config.scheduler.early_start_round = 2;
    config
}

#[tokio::test]
async fn test_speculative_dependent_fails_with_prerequisite() {
    let inference = Arc::new(slow_prerequisite_script().on(Role::Synthesizer, |req, _| {
        if req.prompt.starts_with("## Sub-problem\n\nEstimate migration cost") {
            Err(InferenceError::Http {
                status: 400,
                body: "context too long".into(),
            })
        } else {
            Ok("fine".into())
        }
    }));
    let engine = engine(speculative_config(), inference, memory_store());
    let mut events = engine.subscribe();

    let id = engine.start("Should we migrate billing?", "", vec![]).await.unwrap();
    let state = engine.wait(&id).await.unwrap();

    assert_eq!(state.status, SessionStatus::Completed);
    assert_eq!(state.progress[1].speculative_inputs, vec![0]);
    assert!(state.progress[1].rounds_completed > 0);
    assert_eq!(state.sub_problem_status(0), Some(SubProblemStatus::Failed));
    assert_eq!(state.sub_problem_status(1), Some(SubProblemStatus::Failed));
    assert_eq!(
        state.progress[1].failure.as_ref().map(|r| r.code),
        Some(ReasonCode::BlockedByDependency)
    );
    assert!(state.progress[1].result.is_none());
    assert!(state
        .sub_problem_results
        .iter()
        .all(|r| r.sub_problem_index == 0));

    let events = drain(&mut events);
    assert!(!events.iter().any(|e| matches!(
        e,
        ProgressEvent::SubProblemComplete { sub_problem: 1, .. }
    )));
}

#[tokio::test]
async fn test_speculative_result_waits_for_prerequisite() {
    let inference = Arc::new(slow_prerequisite_script());
    let engine = engine(speculative_config(), inference, memory_store());
    let mut events = engine.subscribe();

    let id = engine.start("Should we migrate billing?", "", vec![]).await.unwrap();
    let state = engine.wait(&id).await.unwrap();

    assert_eq!(state.status, SessionStatus::Completed);
    assert_eq!(state.sub_problem_status(0), Some(SubProblemStatus::Complete));
    assert_eq!(state.sub_problem_status(1), Some(SubProblemStatus::Complete));
    assert_eq!(state.progress[0].rounds_completed, 7);

    let completions: Vec<usize> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ProgressEvent::SubProblemComplete { sub_problem, .. } => Some(sub_problem),
            _ => None,
        })
        .collect();
    assert_eq!(completions, vec![0, 1]);
}

// ── Checkpoints ────────────────────────────────────────────────────

#[tokio::test]
async fn test_checkpoint_failure_suspends_then_resumes() {
    // created→decomposing, decomposed and →deliberating land; the next write fails
    let store = Arc::new(FlakyStore::failing_after(3));
    let inference = Arc::new(happy_script(CHAIN_DECOMPOSITION));
    let engine = engine(fast_config(), inference.clone(), store.clone());
    let mut events = engine.subscribe();

    let id = engine.start("Should we migrate billing?", "", vec![]).await.unwrap();
    let suspended = engine.wait(&id).await.unwrap();
    assert_eq!(suspended.status, SessionStatus::Suspended);
    assert_eq!(suspended.suspended_from, Some(SessionStatus::Deliberating));
    assert!(drain(&mut events)
        .iter()
        .any(|e| e.event_type() == "suspended"));

    store.heal();
    let resumed = engine.resume(&id).await.unwrap();
    assert_eq!(resumed.status, SessionStatus::Deliberating);
    let done = engine.wait(&id).await.unwrap();

    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.sub_problem_results.len(), 2);
    assert_eq!(inference.calls(Role::Planner), 1);
}

#[tokio::test]
async fn test_session_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let first = engine(
            fast_config(),
            Arc::new(questions_script()),
            Arc::new(FileCheckpointStore::new(dir.path())),
        );
        let id = first.start("Should we migrate billing?", "", vec![]).await.unwrap();
        let paused = first.wait(&id).await.unwrap();
        assert_eq!(paused.status, SessionStatus::PausedForClarification);
        id
    };

    let inference = Arc::new(questions_script());
    let second = engine(
        fast_config(),
        inference.clone(),
        Arc::new(FileCheckpointStore::new(dir.path())),
    );
    let restored = second.get_state(&id).await.unwrap();
    assert_eq!(restored.status, SessionStatus::PausedForClarification);
    assert!(restored.problem.is_decomposed());

    // Paused sessions stay paused on resume.
    let same = second.resume(&id).await.unwrap();
    assert_eq!(same.status, SessionStatus::PausedForClarification);

    let mut answers = BTreeMap::new();
    answers.insert("Which region hosts the data?".to_string(), "EU".to_string());
    second.submit_clarification(&id, answers).await.unwrap();
    let done = second.wait(&id).await.unwrap();

    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(inference.calls(Role::Planner), 0);
    assert_eq!(inference.calls(Role::Clarifier), 0);
    assert!(done.checkpoint_sequence > restored.checkpoint_sequence);
}
