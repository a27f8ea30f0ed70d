//! Panel voting after the round loop ends.
//!
//! Every panel member votes in parallel. A vote whose call fails after
//! retries, or whose reply cannot be parsed, is recorded as an abstention.

use std::collections::HashMap;

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::inference::{Role, SessionCaller};
use crate::prompts::{self, parse_json_reply};
use crate::state::{Contribution, ExpertId, ExpertPanel, Recommendation, SubProblem};

#[derive(Debug, Deserialize)]
struct VoteReply {
    preferred_option: String,
    confidence: f64,
    #[serde(default)]
    rationale: String,
}

/// Collected votes, in panel order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoteOutcome {
    pub recommendations: Vec<Recommendation>,
    pub abstentions: Vec<ExpertId>,
    pub cost: u64,
}

/// Confidence-weighted support for one option.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionTally {
    pub option: String,
    pub weight: f64,
    pub backers: Vec<ExpertId>,
}

pub async fn collect_votes(
    caller: &SessionCaller,
    config: &EngineConfig,
    sub_problem: &SubProblem,
    panel: &ExpertPanel,
    contributions: &[Contribution],
) -> VoteOutcome {
    let requests: Vec<_> = panel
        .experts()
        .iter()
        .enumerate()
        .map(|(i, expert)| {
            let request = prompts::vote(expert, sub_problem, contributions).into_request(
                Role::Voter,
                config.caller.max_tokens.vote,
                config.caller.vote_timeout(),
            );
            (i, expert.id.clone(), request)
        })
        .collect();

    let mut replies: Vec<_> = stream::iter(requests)
        .map(|(i, expert_id, request)| async move {
            (i, expert_id, caller.call(&request).await)
        })
        .buffer_unordered(config.caller.round_concurrency.max(1))
        .collect()
        .await;
    replies.sort_by_key(|(i, _, _)| *i);

    let mut outcome = VoteOutcome::default();
    for (_, expert_id, reply) in replies {
        let response = match reply {
            Ok(response) => response,
            Err(e) => {
                warn!(sub_problem = sub_problem.index, expert = %expert_id, error = %e, "Vote call failed, recording abstention");
                outcome.abstentions.push(expert_id);
                continue;
            }
        };
        outcome.cost += response.token_cost;
        match parse_json_reply::<VoteReply>(&response.content) {
            Ok(vote) if !vote.preferred_option.trim().is_empty() => {
                outcome.recommendations.push(Recommendation {
                    expert_id,
                    preferred_option: vote.preferred_option.trim().to_string(),
                    confidence: if vote.confidence.is_finite() {
                        vote.confidence.clamp(0.0, 1.0)
                    } else {
                        0.0
                    },
                    rationale: vote.rationale,
                });
            }
            Ok(_) | Err(_) => {
                debug!(sub_problem = sub_problem.index, expert = %expert_id, "Unusable vote, recording abstention");
                outcome.abstentions.push(expert_id);
            }
        }
    }

    info!(
        sub_problem = sub_problem.index,
        votes = outcome.recommendations.len(),
        abstentions = outcome.abstentions.len(),
        "Votes collected"
    );
    outcome
}

/// Sum vote confidence per option, strongest first.
///
/// Options are compared case- and whitespace-insensitively.
pub fn tally(recommendations: &[Recommendation]) -> Vec<OptionTally> {
    let mut order: Vec<String> = Vec::new();
    let mut totals: HashMap<String, OptionTally> = HashMap::new();
    for rec in recommendations {
        let key = rec
            .preferred_option
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        let entry = totals.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            OptionTally {
                option: rec.preferred_option.trim().to_string(),
                weight: 0.0,
                backers: Vec::new(),
            }
        });
        entry.weight += rec.confidence;
        entry.backers.push(rec.expert_id.clone());
    }

    let mut tallies: Vec<OptionTally> = order
        .into_iter()
        .filter_map(|key| totals.remove(&key))
        .collect();
    // stable sort keeps first-seen order between equal weights
    tallies.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    tallies
}
