//! Sub-problem synthesis and the final meta-synthesis.

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::inference::{CallError, Role, SessionCaller};
use crate::prompts::{self, UpstreamContext};
use crate::state::{
    Contribution, FinalReport, Problem, Recommendation, ReportGap, SubProblem, SubProblemResult,
};

/// Single-shot synthesis of one sub-problem's debate and votes.
///
/// Returns the synthesis text and its cost.
pub async fn synthesize(
    caller: &SessionCaller,
    config: &EngineConfig,
    sub_problem: &SubProblem,
    contributions: &[Contribution],
    recommendations: &[Recommendation],
    upstream: &[UpstreamContext],
) -> Result<(String, u64), CallError> {
    let request = prompts::synthesis(sub_problem, contributions, recommendations, upstream)
        .into_request(
            Role::Synthesizer,
            config.caller.max_tokens.synthesis,
            config.caller.synthesis_timeout(),
        );
    let response = caller.call(&request).await?;
    Ok((response.content, response.token_cost))
}

/// Combines sub-problem results into the final report, exactly once per
/// session.
pub struct MetaSynthesizer<'a> {
    caller: &'a SessionCaller,
    config: &'a EngineConfig,
}

impl<'a> MetaSynthesizer<'a> {
    pub fn new(caller: &'a SessionCaller, config: &'a EngineConfig) -> Self {
        Self { caller, config }
    }

    /// Merge `results` (ordered by sub-problem index) and flag `gaps`.
    ///
    /// If the call fails the report is a plain concatenation of the
    /// sub-problem syntheses, marked degraded.
    pub async fn synthesize(
        &self,
        problem: &Problem,
        results: &[SubProblemResult],
        gaps: Vec<ReportGap>,
    ) -> (FinalReport, u64) {
        let request = prompts::meta_synthesis(problem, results, &gaps).into_request(
            Role::MetaSynthesizer,
            self.config.caller.max_tokens.synthesis,
            self.config.caller.synthesis_timeout(),
        );
        match self.caller.call(&request).await {
            Ok(response) => {
                info!(
                    results = results.len(),
                    gaps = gaps.len(),
                    "Meta-synthesis complete"
                );
                (
                    FinalReport {
                        text: response.content,
                        gaps,
                        degraded: false,
                    },
                    response.token_cost,
                )
            }
            Err(e) => {
                warn!(error = %e, "Meta-synthesis failed, concatenating sub-problem results");
                (
                    FinalReport {
                        text: concatenate(problem, results, &gaps),
                        gaps,
                        degraded: true,
                    },
                    0,
                )
            }
        }
    }
}

fn concatenate(problem: &Problem, results: &[SubProblemResult], gaps: &[ReportGap]) -> String {
    let mut out = format!("# {}\n\n", problem.statement);
    for r in results {
        let goal = problem
            .sub_problem(r.sub_problem_index)
            .map(|s| s.goal.as_str())
            .unwrap_or("");
        out.push_str(&format!(
            "## {}. {}\n\n{}\n\n",
            r.sub_problem_index, goal, r.synthesis_text
        ));
    }
    if !gaps.is_empty() {
        out.push_str("## Not deliberated\n\n");
        for g in gaps {
            out.push_str(&format!("- {}. {}: {}\n", g.sub_problem_index, g.goal, g.reason));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureReason, ReasonCode};
    use crate::testing::{caller_for, transient, ScriptedInference};
    use std::sync::Arc;

    fn result(index: usize, text: &str) -> SubProblemResult {
        SubProblemResult {
            sub_problem_index: index,
            synthesis_text: text.into(),
            recommendations: vec![],
            abstentions: vec![],
            total_cost: 0,
            contribution_count: 0,
            round_count: 3,
            degraded: false,
        }
    }

    fn gap() -> ReportGap {
        ReportGap {
            sub_problem_index: 1,
            goal: "vendor choice".into(),
            reason: FailureReason::new(ReasonCode::BlockedByDependency, "prerequisite 0 failed"),
        }
    }

    #[tokio::test]
    async fn test_meta_synthesis_keeps_gaps() {
        let inference = Arc::new(
            ScriptedInference::new().on(Role::MetaSynthesizer, |req, _| {
                assert!(req.prompt.contains("Not deliberated"));
                Ok("Go with Postgres.".into())
            }),
        );
        let caller = caller_for(inference);
        let config = EngineConfig::default();
        let problem = Problem::new("Which database?", "", vec![]);
        let (report, cost) = MetaSynthesizer::new(&caller, &config)
            .synthesize(&problem, &[result(0, "postgres")], vec![gap()])
            .await;
        assert_eq!(report.text, "Go with Postgres.");
        assert_eq!(report.gaps.len(), 1);
        assert!(!report.degraded);
        assert_eq!(cost, 10);
    }

    #[tokio::test]
    async fn test_meta_synthesis_falls_back_to_concatenation() {
        let inference =
            Arc::new(ScriptedInference::new().on(Role::MetaSynthesizer, |_, _| Err(transient())));
        let caller = caller_for(inference);
        let config = EngineConfig::default();
        let problem = Problem::new("Which database?", "", vec![]);
        let (report, _) = MetaSynthesizer::new(&caller, &config)
            .synthesize(
                &problem,
                &[result(0, "postgres wins"), result(2, "hire two DBAs")],
                vec![gap()],
            )
            .await;
        assert!(report.degraded);
        assert!(report.text.contains("postgres wins"));
        assert!(report.text.contains("hire two DBAs"));
        assert!(report.text.contains("blocked_by_dependency"));
    }
}
