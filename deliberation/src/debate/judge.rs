//! Convergence judge: scores one debate round.
//!
//! The judge model returns a strict JSON structure; the four scores are
//! computed here from that structure rather than taken from the model:
//!
//! - exploration: mean coverage over all seven aspects (none 0, shallow 0.5, deep 1)
//! - convergence: share of the panel backing the leading option, times
//!   their mean confidence
//! - focus: the judged on-topic fraction
//! - novelty: the judged novel fraction (always 1.0 in round one)
//!
//! A malformed reply is retried once with a corrective instruction. If the
//! second reply is unusable too, or the call fails, a heuristic assessment
//! flagged `degraded` is returned instead.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::inference::{Role, SessionCaller};
use crate::prompts::{self, parse_json_reply};
use crate::state::{
    Aspect, Contribution, CoverageLevel, ExpertPanel, RecommendedAction, RoundAssessment,
    SubProblem,
};

/// Minimum token length counted by the lexical novelty estimate.
const MIN_TOKEN_LEN: usize = 4;

#[derive(Debug, Deserialize)]
struct JudgeReply {
    coverage: BTreeMap<String, CoverageLevel>,
    #[serde(default)]
    positions: Vec<Position>,
    on_topic_fraction: f64,
    novel_fraction: f64,
    #[serde(default)]
    missing_aspects: Vec<String>,
    recommended_action: RecommendedAction,
}

#[derive(Debug, Clone, Deserialize)]
struct Position {
    expert_id: String,
    option: String,
    confidence: f64,
}

/// Assessment plus the cost of producing it.
#[derive(Debug, Clone)]
pub struct Judgement {
    pub assessment: RoundAssessment,
    pub cost: u64,
}

pub struct ConvergenceJudge<'a> {
    caller: &'a SessionCaller,
    config: &'a EngineConfig,
}

impl<'a> ConvergenceJudge<'a> {
    pub fn new(caller: &'a SessionCaller, config: &'a EngineConfig) -> Self {
        Self { caller, config }
    }

    /// Assess `round`. `contributions` holds the full history including
    /// this round; `previous` is the last assessment, if any.
    pub async fn assess(
        &self,
        sub_problem: &SubProblem,
        panel: &ExpertPanel,
        round: u32,
        contributions: &[Contribution],
        previous: Option<&RoundAssessment>,
    ) -> Judgement {
        let panel_ids = panel.ids();
        let base = prompts::judge(sub_problem, &panel_ids, round, contributions);
        let mut prompt = base.clone();
        let mut cost = 0;

        for attempt in 0..2 {
            let request = prompt.clone().into_request(
                Role::Judge,
                self.config.caller.max_tokens.judge,
                self.config.caller.judge_timeout(),
            );
            let response = match self.caller.call(&request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        sub_problem = sub_problem.index,
                        round,
                        error = %e,
                        "Judge call failed, using heuristic assessment"
                    );
                    break;
                }
            };
            cost += response.token_cost;

            match parse_json_reply::<JudgeReply>(&response.content) {
                Ok(reply) => {
                    debug!(sub_problem = sub_problem.index, round, "Judge reply parsed");
                    return Judgement {
                        assessment: score_reply(reply, panel, round),
                        cost,
                    };
                }
                Err(problem) => {
                    warn!(
                        sub_problem = sub_problem.index,
                        round,
                        attempt = attempt + 1,
                        error = %problem,
                        "Malformed judge reply"
                    );
                    prompt = base.clone().with_correction(&problem);
                }
            }
        }

        Judgement {
            assessment: heuristic_assessment(round, contributions, previous),
            cost,
        }
    }
}

fn score_reply(reply: JudgeReply, panel: &ExpertPanel, round: u32) -> RoundAssessment {
    let coverage: BTreeMap<Aspect, CoverageLevel> = Aspect::all()
        .iter()
        .map(|&aspect| {
            let level = reply
                .coverage
                .iter()
                .find(|(name, _)| Aspect::parse(name) == Some(aspect))
                .map(|(_, level)| *level)
                .unwrap_or(CoverageLevel::None);
            (aspect, level)
        })
        .collect();

    let (convergence_score, leading_option) = convergence(&reply.positions, panel);

    let mut missing: Vec<Aspect> = reply
        .missing_aspects
        .iter()
        .filter_map(|name| Aspect::parse(name))
        .chain(
            coverage
                .iter()
                .filter(|(_, level)| **level == CoverageLevel::None)
                .map(|(aspect, _)| *aspect),
        )
        .collect();
    missing.sort();
    missing.dedup();

    RoundAssessment {
        round_number: round,
        exploration_score: exploration(&coverage),
        convergence_score,
        focus_score: clamp_unit(reply.on_topic_fraction, 0.0),
        novelty_score: if round <= 1 {
            1.0
        } else {
            clamp_unit(reply.novel_fraction, 0.0)
        },
        recommended_action: reply.recommended_action,
        missing_aspects: missing,
        coverage,
        leading_option,
        degraded: false,
    }
}

fn clamp_unit(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        fallback
    }
}

/// Mean coverage score over every aspect; unlisted aspects count as none.
pub fn exploration(coverage: &BTreeMap<Aspect, CoverageLevel>) -> f64 {
    let all = Aspect::all();
    let total: f64 = all
        .iter()
        .map(|a| coverage.get(a).copied().unwrap_or(CoverageLevel::None).score())
        .sum();
    total / all.len() as f64
}

fn normalize_option(option: &str) -> String {
    option.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// `(backers / panel size) * mean backer confidence` for the leading option.
///
/// Positions from experts outside the panel are ignored and only the first
/// position per expert counts. The leading option has the most backers,
/// then the highest summed confidence, then sorts first.
fn convergence(positions: &[Position], panel: &ExpertPanel) -> (f64, Option<String>) {
    if panel.is_empty() {
        return (0.0, None);
    }
    let members: HashSet<String> = panel.ids().into_iter().collect();
    let mut seen = HashSet::new();
    let mut by_option: HashMap<String, Vec<f64>> = HashMap::new();
    for p in positions {
        let option = normalize_option(&p.option);
        if option.is_empty() || !members.contains(&p.expert_id) || !seen.insert(p.expert_id.clone())
        {
            continue;
        }
        by_option
            .entry(option)
            .or_default()
            .push(clamp_unit(p.confidence, 0.0));
    }

    let leader = by_option.into_iter().max_by(|(a_opt, a), (b_opt, b)| {
        a.len()
            .cmp(&b.len())
            .then(
                a.iter()
                    .sum::<f64>()
                    .partial_cmp(&b.iter().sum::<f64>())
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(b_opt.cmp(a_opt))
    });

    match leader {
        Some((option, confidences)) => {
            let backers = confidences.len() as f64;
            let mean = confidences.iter().sum::<f64>() / backers;
            let score = (backers / panel.len() as f64) * mean;
            (score.clamp(0.0, 1.0), Some(option))
        }
        None => (0.0, None),
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_TOKEN_LEN)
        .map(str::to_lowercase)
}

/// Share of distinct tokens in `round` that never appeared earlier.
pub fn lexical_novelty(round: u32, contributions: &[Contribution]) -> f64 {
    if round <= 1 {
        return 1.0;
    }
    let prior: HashSet<String> = contributions
        .iter()
        .filter(|c| c.round_number < round)
        .flat_map(|c| tokens(&c.content))
        .collect();
    let current: HashSet<String> = contributions
        .iter()
        .filter(|c| c.round_number == round)
        .flat_map(|c| tokens(&c.content))
        .collect();
    if current.is_empty() {
        return 0.0;
    }
    let fresh = current.iter().filter(|t| !prior.contains(*t)).count();
    fresh as f64 / current.len() as f64
}

/// Conservative assessment used when the judge output is unusable.
///
/// Carries the previous round's scores and coverage forward; the stopping
/// policy never stops on a degraded assessment.
pub fn heuristic_assessment(
    round: u32,
    contributions: &[Contribution],
    previous: Option<&RoundAssessment>,
) -> RoundAssessment {
    let (exploration_score, convergence_score, focus_score, coverage, leading_option) =
        match previous {
            Some(p) => (
                p.exploration_score,
                p.convergence_score,
                p.focus_score,
                p.coverage.clone(),
                p.leading_option.clone(),
            ),
            None => (0.0, 0.0, 0.5, BTreeMap::new(), None),
        };
    let missing_aspects = Aspect::all()
        .iter()
        .copied()
        .filter(|a| coverage.get(a).copied().unwrap_or(CoverageLevel::None) == CoverageLevel::None)
        .collect();

    RoundAssessment {
        round_number: round,
        exploration_score,
        convergence_score,
        focus_score,
        novelty_score: lexical_novelty(round, contributions),
        recommended_action: RecommendedAction::Continue,
        missing_aspects,
        coverage,
        leading_option,
        degraded: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Expert, Phase, RoundBudget, SubProblemStatus};
    use crate::testing::{caller_for, transient, ScriptedInference};
    use std::sync::Arc;

    fn panel() -> ExpertPanel {
        let e = |id: &str, tag: &str| Expert {
            id: id.into(),
            name: id.into(),
            expertise_tags: vec![tag.into()],
            style: "plain".into(),
        };
        ExpertPanel::new(vec![e("a", "x"), e("b", "y"), e("c", "z"), e("d", "w")]).unwrap()
    }

    fn sub_problem() -> SubProblem {
        SubProblem {
            index: 0,
            goal: "choose a database".into(),
            dependency_indices: vec![],
            complexity: 0.5,
            round_budget: RoundBudget {
                min_rounds: 3,
                max_rounds: 7,
            },
            status: SubProblemStatus::Running,
        }
    }

    fn contribution(expert: &str, round: u32, content: &str) -> Contribution {
        Contribution {
            expert_id: expert.into(),
            round_number: round,
            phase: Phase::Exploration,
            content: content.into(),
            token_cost: 5,
        }
    }

    const GOOD_REPLY: &str = r#"{
        "coverage": {"problem_clarity": "deep", "objectives": "deep", "options": "deep",
                     "risks": "shallow", "constraints": "shallow", "stakeholders": "none",
                     "dependencies": "none"},
        "positions": [
            {"expert_id": "a", "option": "Postgres", "confidence": 0.8},
            {"expert_id": "b", "option": "postgres ", "confidence": 0.6},
            {"expert_id": "b", "option": "mysql", "confidence": 0.9},
            {"expert_id": "c", "option": "MySQL", "confidence": 0.9},
            {"expert_id": "zz", "option": "mysql", "confidence": 1.0}
        ],
        "on_topic_fraction": 0.9,
        "novel_fraction": 0.4,
        "missing_aspects": ["stakeholders"],
        "recommended_action": "continue"
    }"#;

    #[test]
    fn test_scores_from_reply() {
        let reply: JudgeReply = parse_json_reply(GOOD_REPLY).unwrap();
        let a = score_reply(reply, &panel(), 2);
        // (1 + 1 + 1 + 0.5 + 0.5 + 0 + 0) / 7
        assert!((a.exploration_score - 4.0 / 7.0).abs() < 1e-9);
        // postgres: a 0.8, b 0.6 -> 2/4 * 0.7
        assert!((a.convergence_score - 0.35).abs() < 1e-9);
        assert_eq!(a.leading_option.as_deref(), Some("postgres"));
        assert!((a.focus_score - 0.9).abs() < 1e-9);
        assert!((a.novelty_score - 0.4).abs() < 1e-9);
        assert_eq!(
            a.missing_aspects,
            vec![Aspect::Stakeholders, Aspect::Dependencies]
        );
        assert!(!a.degraded);
    }

    #[test]
    fn test_first_round_novelty_is_full() {
        let reply: JudgeReply = parse_json_reply(GOOD_REPLY).unwrap();
        assert_eq!(score_reply(reply, &panel(), 1).novelty_score, 1.0);
    }

    #[test]
    fn test_lexical_novelty() {
        let history = vec![
            contribution("a", 1, "postgres replication costs"),
            contribution("a", 2, "postgres replication latency"),
        ];
        // {postgres, replication, latency}: one unseen
        assert!((lexical_novelty(2, &history) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(lexical_novelty(3, &history), 0.0);
    }

    #[test]
    fn test_heuristic_carries_previous_scores() {
        let reply: JudgeReply = parse_json_reply(GOOD_REPLY).unwrap();
        let previous = score_reply(reply, &panel(), 2);
        let h = heuristic_assessment(3, &[], Some(&previous));
        assert!(h.degraded);
        assert_eq!(h.exploration_score, previous.exploration_score);
        assert_eq!(h.recommended_action, RecommendedAction::Continue);
        assert!(h.missing_aspects.contains(&Aspect::Stakeholders));
    }

    #[test]
    fn test_heuristic_without_history() {
        let h = heuristic_assessment(1, &[], None);
        assert_eq!(h.exploration_score, 0.0);
        assert_eq!(h.convergence_score, 0.0);
        assert_eq!(h.focus_score, 0.5);
        assert_eq!(h.missing_aspects.len(), 7);
    }

    #[tokio::test]
    async fn test_malformed_reply_retried_once() {
        let inference = Arc::new(ScriptedInference::new().on(Role::Judge, |req, n| {
            if n == 0 {
                Ok("not json".into())
            } else {
                assert!(req.prompt.contains("Correction"));
                Ok(GOOD_REPLY.into())
            }
        }));
        let caller = caller_for(inference.clone());
        let config = EngineConfig::default();
        let judgement = ConvergenceJudge::new(&caller, &config)
            .assess(&sub_problem(), &panel(), 2, &[], None)
            .await;
        assert!(!judgement.assessment.degraded);
        assert_eq!(inference.calls(Role::Judge), 2);
        assert_eq!(judgement.cost, 20);
    }

    #[tokio::test]
    async fn test_two_malformed_replies_degrade() {
        let inference =
            Arc::new(ScriptedInference::new().on(Role::Judge, |_, _| Ok("{\"coverage\": 3}".into())));
        let caller = caller_for(inference.clone());
        let config = EngineConfig::default();
        let judgement = ConvergenceJudge::new(&caller, &config)
            .assess(&sub_problem(), &panel(), 2, &[], None)
            .await;
        assert!(judgement.assessment.degraded);
        assert_eq!(inference.calls(Role::Judge), 2);
    }

    #[tokio::test]
    async fn test_call_failure_degrades() {
        let inference = Arc::new(ScriptedInference::new().on(Role::Judge, |_, _| Err(transient())));
        let caller = caller_for(inference);
        let config = EngineConfig::default();
        let judgement = ConvergenceJudge::new(&caller, &config)
            .assess(&sub_problem(), &panel(), 1, &[], None)
            .await;
        assert!(judgement.assessment.degraded);
        assert_eq!(judgement.cost, 0);
    }
}
