//! Clarification gate: critical missing information after decomposition.
//!
//! The gate never blocks deliberation on its own failure. A failed or
//! malformed clarifier call proceeds as if no questions were raised.

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::inference::{Role, SessionCaller};
use crate::prompts::{self, parse_json_reply};
use crate::state::{fingerprint_questions, Problem};

#[derive(Debug, Deserialize)]
struct ClarificationReply {
    #[serde(default)]
    questions: Vec<String>,
}

/// Questions to pause on (empty to proceed) and the call cost.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateOutcome {
    pub questions: Vec<String>,
    pub cost: u64,
}

impl GateOutcome {
    pub fn should_pause(&self) -> bool {
        !self.questions.is_empty()
    }
}

pub struct ClarificationGate<'a> {
    caller: &'a SessionCaller,
    config: &'a EngineConfig,
}

impl<'a> ClarificationGate<'a> {
    pub fn new(caller: &'a SessionCaller, config: &'a EngineConfig) -> Self {
        Self { caller, config }
    }

    /// Ask the clarifier for critical questions. A question set whose
    /// fingerprint is in `answered` never pauses the session again.
    pub async fn check(&self, problem: &Problem, answered: &[String]) -> GateOutcome {
        if !self.config.clarification.enabled {
            return GateOutcome::default();
        }
        let request = prompts::clarification(problem, self.config.clarification.max_questions)
            .into_request(
                Role::Clarifier,
                self.config.caller.max_tokens.planning,
                self.config.caller.planning_timeout(),
            );

        let response = match self.caller.call(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Clarifier unavailable, proceeding without questions");
                return GateOutcome::default();
            }
        };

        let questions = match parse_json_reply::<ClarificationReply>(&response.content) {
            Ok(reply) => reply.questions,
            Err(e) => {
                warn!(error = %e, "Clarifier reply malformed, proceeding without questions");
                Vec::new()
            }
        };

        let mut questions: Vec<String> = questions
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        questions.dedup();
        questions.truncate(self.config.clarification.max_questions);

        if !questions.is_empty() && answered.contains(&fingerprint_questions(&questions)) {
            info!("Clarification questions already answered, not pausing again");
            questions.clear();
        }

        GateOutcome {
            questions,
            cost: response.token_cost,
        }
    }
}
