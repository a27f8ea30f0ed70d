//! Prompt construction for every inference role, plus JSON reply parsing.
//!
//! Prompt wording is not load-bearing; the JSON reply shapes are. Each
//! structured role documents its expected shape inline in the system
//! prompt, and replies are parsed with [`parse_json_reply`].

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::inference::{InferenceRequest, Role};
use crate::state::{
    Aspect, Contribution, Expert, Phase, Problem, Recommendation, ReportGap, SubProblem,
    SubProblemResult,
};

/// Contributions from the most recent rounds included verbatim in prompts.
const HISTORY_ROUNDS: u32 = 2;

/// A system/user prompt pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn into_request(self, role: Role, max_tokens: u32, timeout: Duration) -> InferenceRequest {
        InferenceRequest::new(role, self.system, self.user)
            .max_tokens(max_tokens)
            .timeout(timeout)
    }

    /// Append a corrective instruction after a malformed reply.
    pub fn with_correction(mut self, problem: &str) -> Self {
        self.user.push_str(&format!(
            "\n\n## Correction\n\nYour previous reply was rejected: {problem}. \
             Reply with a single JSON object in exactly the requested shape and nothing else."
        ));
        self
    }
}

/// Output of a prerequisite sub-problem, as seen by a dependent.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamContext {
    pub index: usize,
    pub goal: String,
    /// The prerequisite was still deliberating; this is not its final word.
    pub provisional: bool,
    pub summary: String,
}

fn problem_section(problem: &Problem) -> String {
    let mut out = format!("## Problem\n\n{}\n", problem.statement);
    if !problem.context.trim().is_empty() {
        out.push_str(&format!("\n## Context\n\n{}\n", problem.context.trim()));
    }
    if !problem.constraints.is_empty() {
        out.push_str("\n## Constraints\n\n");
        for c in &problem.constraints {
            out.push_str(&format!("- {c}\n"));
        }
    }
    out
}

fn upstream_section(upstream: &[UpstreamContext]) -> String {
    if upstream.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n## Prerequisite findings\n\n");
    for u in upstream {
        let tag = if u.provisional {
            " (PROVISIONAL: still under debate, may change)"
        } else {
            ""
        };
        out.push_str(&format!(
            "### Sub-problem {}: {}{}\n\n{}\n\n",
            u.index, u.goal, tag, u.summary
        ));
    }
    out
}

fn contributions_section(contributions: &[Contribution], since_round: u32) -> String {
    let mut out = String::new();
    for c in contributions.iter().filter(|c| c.round_number >= since_round) {
        out.push_str(&format!(
            "[round {} | {} | {}]\n{}\n\n",
            c.round_number, c.phase, c.expert_id, c.content
        ));
    }
    out
}

fn aspect_list(aspects: &[Aspect]) -> String {
    aspects
        .iter()
        .map(|a| a.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn decomposition(problem: &Problem, max_sub_problems: usize) -> Prompt {
    Prompt {
        system: format!(
            "You break decision problems into at most {max_sub_problems} focused sub-problems \
             that can each be debated by a small expert panel. Reply with JSON only:\n\
             {{\"complexity\": 0.0-1.0, \"sub_problems\": [{{\"goal\": \"...\", \
             \"depends_on\": [indices of earlier sub-problems this one needs], \
             \"complexity\": 0.0-1.0}}]}}\n\
             Dependencies must not form cycles and must refer to listed sub-problems."
        ),
        user: problem_section(problem),
    }
}

pub fn clarification(problem: &Problem, max_questions: usize) -> Prompt {
    let mut user = problem_section(problem);
    user.push_str("\n## Planned sub-problems\n\n");
    for sp in &problem.sub_problems {
        user.push_str(&format!("{}. {}\n", sp.index, sp.goal));
    }
    Prompt {
        system: format!(
            "You check whether a decision problem is missing information that is critical \
             to deliberate it at all. Ask only questions whose answers would change the \
             recommendation; at most {max_questions}. If nothing critical is missing, return an \
             empty list. Reply with JSON only: {{\"questions\": [\"...\"]}}"
        ),
        user,
    }
}

/// Inputs for one expert's contribution prompt.
pub struct ContributionInput<'a> {
    pub problem: &'a Problem,
    pub sub_problem: &'a SubProblem,
    pub expert: &'a Expert,
    pub round: u32,
    pub phase: Phase,
    pub history: &'a [Contribution],
    pub follow_up: &'a [Aspect],
    pub upstream: &'a [UpstreamContext],
}

pub fn contribution(input: &ContributionInput<'_>) -> Prompt {
    let phase_instruction = match input.phase {
        Phase::Exploration => "Explore the option space broadly: surface options, objectives, risks and constraints others may miss.",
        Phase::Challenge => "Challenge the strongest positions so far. Name weaknesses, hidden assumptions and counter-evidence.",
        Phase::Convergence => "Converge: state which option you back and why, and what would change your mind.",
    };
    let mut user = problem_section(input.problem);
    user.push_str(&upstream_section(input.upstream));
    user.push_str(&format!(
        "\n## Sub-problem {}\n\n{}\n\n## Round {} ({})\n\n{}\n",
        input.sub_problem.index, input.sub_problem.goal, input.round, input.phase, phase_instruction
    ));
    if !input.follow_up.is_empty() {
        user.push_str(&format!(
            "\nThe debate has not yet covered: {}. Address these explicitly.\n",
            aspect_list(input.follow_up)
        ));
    }
    let since = input.round.saturating_sub(HISTORY_ROUNDS);
    let history = contributions_section(input.history, since);
    if !history.is_empty() {
        user.push_str("\n## Recent debate\n\n");
        user.push_str(&history);
    }
    Prompt {
        system: format!(
            "You are {}, an expert in {}. Style: {}. Contribute concisely to a structured \
             expert debate. Do not repeat points already made; add new reasoning.",
            input.expert.name,
            input.expert.expertise_tags.join(", "),
            input.expert.style
        ),
        user,
    }
}

pub fn judge(
    sub_problem: &SubProblem,
    panel: &[String],
    round: u32,
    contributions: &[Contribution],
) -> Prompt {
    let mut user = format!(
        "## Sub-problem\n\n{}\n\n## Panel\n\n{}\n\n## Current round: {}\n\n",
        sub_problem.goal,
        panel.join(", "),
        round
    );
    let current = contributions_section(contributions, round);
    let prior: Vec<Contribution> = contributions
        .iter()
        .filter(|c| c.round_number < round)
        .cloned()
        .collect();
    if !prior.is_empty() {
        user.push_str("## Earlier rounds\n\n");
        user.push_str(&contributions_section(&prior, 0));
    }
    user.push_str("## This round\n\n");
    user.push_str(&current);

    let aspects = aspect_list(Aspect::all());
    Prompt {
        system: format!(
            "You assess the quality of one round of an expert debate. Reply with JSON only:\n\
             {{\"coverage\": {{<aspect>: \"none\"|\"shallow\"|\"deep\"}} for aspects [{aspects}],\n\
             \"positions\": [{{\"expert_id\": \"...\", \"option\": \"short option label\", \"confidence\": 0.0-1.0}}],\n\
             \"on_topic_fraction\": 0.0-1.0, \"novel_fraction\": 0.0-1.0 (share of this round's points \
             not already made in earlier rounds),\n\
             \"missing_aspects\": [aspect names], \"recommended_action\": \"continue\"|\"vote\"|\"clarify\"|\"moderate\"}}\n\
             Use the same option label for experts backing the same option."
        ),
        user,
    }
}

pub fn vote(expert: &Expert, sub_problem: &SubProblem, contributions: &[Contribution]) -> Prompt {
    let mut user = format!("## Sub-problem\n\n{}\n\n## Debate\n\n", sub_problem.goal);
    user.push_str(&contributions_section(contributions, 0));
    Prompt {
        system: format!(
            "You are {}, an expert in {}. The debate is over. Cast your vote. Reply with JSON only: \
             {{\"preferred_option\": \"...\", \"confidence\": 0.0-1.0, \"rationale\": \"...\"}}",
            expert.name,
            expert.expertise_tags.join(", ")
        ),
        user,
    }
}

fn votes_section(recommendations: &[Recommendation]) -> String {
    let mut out = String::new();
    for r in recommendations {
        out.push_str(&format!(
            "- {} backs \"{}\" (confidence {:.2}): {}\n",
            r.expert_id, r.preferred_option, r.confidence, r.rationale
        ));
    }
    out
}

pub fn synthesis(
    sub_problem: &SubProblem,
    contributions: &[Contribution],
    recommendations: &[Recommendation],
    upstream: &[UpstreamContext],
) -> Prompt {
    let mut user = format!("## Sub-problem\n\n{}\n", sub_problem.goal);
    user.push_str(&upstream_section(upstream));
    user.push_str("\n## Debate\n\n");
    user.push_str(&contributions_section(contributions, 0));
    user.push_str("## Votes\n\n");
    user.push_str(&votes_section(recommendations));
    Prompt {
        system: "You synthesize an expert debate into one recommendation. Write: a short \
                 summary, the recommended option, prioritized actions, and the rationale \
                 including dissenting views."
            .to_string(),
        user,
    }
}

pub fn meta_synthesis(problem: &Problem, results: &[SubProblemResult], gaps: &[ReportGap]) -> Prompt {
    let mut user = problem_section(problem);
    user.push_str("\n## Sub-problem findings\n\n");
    for r in results {
        let goal = problem
            .sub_problem(r.sub_problem_index)
            .map(|s| s.goal.as_str())
            .unwrap_or("");
        user.push_str(&format!(
            "### {}. {}\n\n{}\n\n",
            r.sub_problem_index, goal, r.synthesis_text
        ));
    }
    if !gaps.is_empty() {
        user.push_str("## Not deliberated\n\n");
        for g in gaps {
            user.push_str(&format!(
                "- {}. {} ({})\n",
                g.sub_problem_index, g.goal, g.reason.code
            ));
        }
    }
    Prompt {
        system: "You merge sub-problem recommendations into one decision report: overall \
                 recommendation, prioritized actions, key risks, and an explicit note of \
                 any sub-problem that could not be deliberated."
            .to_string(),
        user,
    }
}

/// Render raw votes as text when synthesis is unavailable.
pub fn raw_votes_text(sub_problem: &SubProblem, recommendations: &[Recommendation]) -> String {
    if recommendations.is_empty() {
        return format!(
            "Synthesis unavailable for \"{}\" and no votes were cast.",
            sub_problem.goal
        );
    }
    format!(
        "Synthesis unavailable for \"{}\". Raw votes:\n{}",
        sub_problem.goal,
        votes_section(recommendations)
    )
}

/// Try to extract a JSON block from a response that may contain surrounding text.
pub fn extract_json_block(text: &str) -> Option<&str> {
    // Look for ```json ... ``` fenced blocks
    if let Some(start) = text.find("```json") {
        let json_start = start + 7;
        if let Some(end) = text[json_start..].find("```") {
            return Some(text[json_start..json_start + end].trim());
        }
    }

    // Look for first { to last }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Parse a structured reply, tolerating prose or fences around the JSON.
pub fn parse_json_reply<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let block = extract_json_block(text).ok_or_else(|| "no JSON object found".to_string())?;
    serde_json::from_str(block).map_err(|e| e.to_string())
}
