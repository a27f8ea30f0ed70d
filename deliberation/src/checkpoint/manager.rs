//! Checkpoint envelope, integrity validation and retrying writes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{CheckpointError, SharedCheckpointStore};
use crate::config::CheckpointConfig;
use crate::planning::dag::SubProblemGraph;
use crate::state::SessionState;

/// Stored form of a session: the full state plus what wrote it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub version: u32,
    /// Mirrors `state.checkpoint_sequence`; increases by one per write.
    pub sequence: u64,
    /// Transition that triggered the write.
    pub reason: String,
    pub saved_at: DateTime<Utc>,
    pub state: SessionState,
}

impl SessionCheckpoint {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(state: &SessionState, reason: &str) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            sequence: state.checkpoint_sequence,
            reason: reason.to_string(),
            saved_at: Utc::now(),
            state: state.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, CheckpointError> {
        serde_json::to_string(self).map_err(|e| CheckpointError::Serialize(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, CheckpointError> {
        let checkpoint: Self =
            serde_json::from_str(json).map_err(|e| CheckpointError::Deserialize(e.to_string()))?;
        if checkpoint.version > Self::CURRENT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                expected: Self::CURRENT_VERSION,
                found: checkpoint.version,
            });
        }
        Ok(checkpoint)
    }
}

/// Verdict on a restored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityStatus {
    Valid,
    /// Bookkeeping drift the driver tolerates, such as a stale round total.
    Recoverable { warnings: Vec<String> },
    /// Structural damage; continuing would break session invariants.
    Corrupted { errors: Vec<String> },
}

impl IntegrityStatus {
    pub fn can_resume(&self) -> bool {
        matches!(self, Self::Valid | Self::Recoverable { .. })
    }
}

/// Check a restored checkpoint against the session invariants before the
/// driver continues from it.
pub fn validate_checkpoint(checkpoint: &SessionCheckpoint) -> IntegrityStatus {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();
    let state = &checkpoint.state;

    if checkpoint.version > SessionCheckpoint::CURRENT_VERSION {
        errors.push(format!(
            "version {} > current {}",
            checkpoint.version,
            SessionCheckpoint::CURRENT_VERSION
        ));
    }

    if checkpoint.sequence != state.checkpoint_sequence {
        errors.push(format!(
            "envelope sequence {} != state sequence {}",
            checkpoint.sequence, state.checkpoint_sequence
        ));
    }

    if let Some(last) = state.transitions.last() {
        if last.to != state.status {
            errors.push(format!(
                "last transition target {} doesn't match status {}",
                last.to, state.status
            ));
        }
    }

    let sub_problems = &state.problem.sub_problems;
    if !sub_problems.is_empty() {
        if let Err(e) = SubProblemGraph::from_sub_problems(sub_problems) {
            errors.push(format!("dependency graph: {e}"));
        }
        if state.progress.len() != sub_problems.len() {
            errors.push(format!(
                "{} progress records for {} sub-problems",
                state.progress.len(),
                sub_problems.len()
            ));
        }
        for (sp, progress) in sub_problems.iter().zip(&state.progress) {
            if progress.rounds_completed > sp.round_budget.max_rounds {
                errors.push(format!(
                    "sub-problem {} has {} rounds, cap {}",
                    sp.index, progress.rounds_completed, sp.round_budget.max_rounds
                ));
            }
            if progress.assessments.len() as u32 > progress.rounds_completed {
                warnings.push(format!(
                    "sub-problem {} has more assessments than rounds",
                    sp.index
                ));
            }
        }
        let total: u32 = state.progress.iter().map(|p| p.rounds_completed).sum();
        if total != state.cumulative_rounds {
            warnings.push(format!(
                "cumulative_rounds {} != sum of sub-problem rounds {}",
                state.cumulative_rounds, total
            ));
        }
    }

    if state.clarification.is_some()
        && state.status != crate::state::SessionStatus::PausedForClarification
        && state.suspended_from != Some(crate::state::SessionStatus::PausedForClarification)
    {
        warnings.push("clarification request outside paused status".to_string());
    }

    if !errors.is_empty() {
        IntegrityStatus::Corrupted { errors }
    } else if !warnings.is_empty() {
        IntegrityStatus::Recoverable { warnings }
    } else {
        IntegrityStatus::Valid
    }
}

/// Writes and restores session checkpoints.
#[derive(Clone)]
pub struct CheckpointManager {
    store: SharedCheckpointStore,
    config: CheckpointConfig,
}

impl CheckpointManager {
    pub fn new(store: SharedCheckpointStore, config: CheckpointConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &SharedCheckpointStore {
        &self.store
    }

    /// Persist the entire state, retrying transient store failures.
    ///
    /// Advances `state.checkpoint_sequence` only when the write lands.
    pub async fn save(&self, state: &mut SessionState, reason: &str) -> Result<u64, CheckpointError> {
        state.checkpoint_sequence += 1;
        let json = match SessionCheckpoint::new(state, reason).to_json() {
            Ok(json) => json,
            Err(e) => {
                state.checkpoint_sequence -= 1;
                return Err(e);
            }
        };

        let attempts = self.config.put_attempts.max(1);
        let mut last = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(
                    self.config.backoff_ms.saturating_mul(1u64 << (attempt - 1).min(8)),
                ))
                .await;
            }
            match self.store.put(&state.id, json.clone()).await {
                Ok(()) => {
                    debug!(
                        session_id = %state.id,
                        sequence = state.checkpoint_sequence,
                        reason,
                        "Checkpoint saved"
                    );
                    return Ok(state.checkpoint_sequence);
                }
                Err(e) => {
                    warn!(
                        session_id = %state.id,
                        attempt = attempt + 1,
                        attempts,
                        error = %e,
                        "Checkpoint write failed"
                    );
                    last = Some(e);
                }
            }
        }

        state.checkpoint_sequence -= 1;
        error!(session_id = %state.id, reason, "Checkpoint store unavailable");
        Err(last.unwrap_or_else(|| CheckpointError::Store("no attempts made".into())))
    }

    /// Load and validate the latest checkpoint for a session.
    pub async fn load(&self, session_id: &str) -> Result<SessionState, CheckpointError> {
        let raw = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| CheckpointError::NotFound(session_id.to_string()))?;
        let checkpoint = SessionCheckpoint::from_json(&raw)?;
        match validate_checkpoint(&checkpoint) {
            IntegrityStatus::Valid => {}
            IntegrityStatus::Recoverable { warnings } => {
                warn!(session_id, ?warnings, "Checkpoint restored with warnings");
            }
            IntegrityStatus::Corrupted { errors } => {
                return Err(CheckpointError::Integrity(errors.join("; ")));
            }
        }
        info!(
            session_id,
            sequence = checkpoint.sequence,
            status = %checkpoint.state.status,
            "Checkpoint restored"
        );
        Ok(checkpoint.state)
    }
}
