//! Engine configuration.
//!
//! Loaded from an optional TOML file, then overridden by `DELIBERATION_*`
//! environment variables, then validated. Every field has a default, so a
//! partial file (or none at all) is valid.
//!
//! ```toml
//! [stopping]
//! min_rounds = 3
//! exploration_floor = 0.6
//!
//! [scheduler]
//! mode = "speculative"
//! early_start_round = 2
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::RetryPolicy;
use crate::state::{Aspect, Criticality, Expert};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid environment override {key}={value}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub stopping: StoppingConfig,
    pub rounds: RoundPolicy,
    pub decomposition: DecompositionConfig,
    pub clarification: ClarificationConfig,
    pub panel: PanelConfig,
    pub scheduler: SchedulerConfig,
    pub caller: CallerConfig,
    pub budget: BudgetConfig,
    pub checkpoint: CheckpointConfig,
    pub inference: InferenceEndpointConfig,
    /// Expert catalog; empty means the built-in catalog.
    pub experts: Vec<Expert>,
}

/// Stopping-rule thresholds evaluated after every round.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoppingConfig {
    pub min_rounds: u32,
    /// Minimum exploration score before any stop other than the hard cap.
    pub exploration_floor: f64,
    /// Repetition ratio (`1 - novelty`) at or above which a round counts
    /// as repetitive.
    pub repetition_floor: f64,
    /// Convergence must improve by more than this over the stall window.
    pub stall_delta: f64,
    /// Rounds over which the convergence trend is measured.
    pub stall_window: u32,
    pub readiness_weights: ReadinessWeights,
    pub readiness_targets: ReadinessTargets,
    /// Aspects that must be covered at least shallowly before stopping.
    pub required_aspects: Vec<Aspect>,
}

impl Default for StoppingConfig {
    fn default() -> Self {
        Self {
            min_rounds: 3,
            exploration_floor: 0.6,
            repetition_floor: 0.73,
            stall_delta: 0.05,
            stall_window: 2,
            readiness_weights: ReadinessWeights::default(),
            readiness_targets: ReadinessTargets::default(),
            required_aspects: vec![Aspect::Risks],
        }
    }
}

/// Weights of the composite readiness score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessWeights {
    pub exploration: f64,
    pub convergence: f64,
    pub focus: f64,
    pub inverse_novelty: f64,
}

impl Default for ReadinessWeights {
    fn default() -> Self {
        Self {
            exploration: 0.30,
            convergence: 0.35,
            focus: 0.15,
            inverse_novelty: 0.20,
        }
    }
}

impl ReadinessWeights {
    pub fn total(&self) -> f64 {
        self.exploration + self.convergence + self.focus + self.inverse_novelty
    }
}

/// Readiness target per criticality tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessTargets {
    pub standard: f64,
    pub high: f64,
}

impl Default for ReadinessTargets {
    fn default() -> Self {
        Self {
            standard: 0.70,
            high: 0.72,
        }
    }
}

impl ReadinessTargets {
    pub fn for_tier(&self, tier: Criticality) -> f64 {
        match tier {
            Criticality::Standard => self.standard,
            Criticality::High => self.high,
        }
    }
}

/// Maps complexity to a round ceiling: `clamp(round(base + slope * c), floor, ceiling)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundPolicy {
    pub base: f64,
    pub slope: f64,
    pub floor: u32,
    pub ceiling: u32,
}

impl Default for RoundPolicy {
    fn default() -> Self {
        Self {
            base: 3.0,
            slope: 7.0,
            floor: 2,
            ceiling: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompositionConfig {
    pub max_sub_problems: usize,
    /// Total attempts, including the corrective retry.
    pub max_attempts: u32,
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            max_sub_problems: 4,
            max_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClarificationConfig {
    pub enabled: bool,
    pub max_questions: usize,
}

impl Default for ClarificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_questions: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// Target panel size, clamped to 3..=5.
    pub size: usize,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self { size: 4 }
    }
}

/// How sub-problems are ordered across the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// One sub-problem at a time in topological order.
    #[default]
    Sequential,
    /// Independent sub-problems run in parallel; dependents may start once
    /// every prerequisite reaches `early_start_round`.
    Speculative,
}

impl std::str::FromStr for SchedulingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "speculative" | "parallel" => Ok(Self::Speculative),
            other => Err(format!("unknown scheduling mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub mode: SchedulingMode,
    pub early_start_round: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SchedulingMode::Sequential,
            early_start_round: 2,
        }
    }
}

/// Output token limits per call kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxTokens {
    pub planning: u32,
    pub contribution: u32,
    pub judge: u32,
    pub vote: u32,
    pub synthesis: u32,
}

impl Default for MaxTokens {
    fn default() -> Self {
        Self {
            planning: 1200,
            contribution: 800,
            judge: 600,
            vote: 300,
            synthesis: 1500,
        }
    }
}

/// Outbound call policy: deadlines, retries, breaker, concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallerConfig {
    pub planning_timeout_secs: u64,
    pub contribution_timeout_secs: u64,
    pub judge_timeout_secs: u64,
    pub vote_timeout_secs: u64,
    pub synthesis_timeout_secs: u64,
    pub max_tokens: MaxTokens,
    pub retry: RetryPolicy,
    /// Consecutive failures before a provider's circuit opens.
    pub breaker_failure_threshold: u32,
    /// Seconds before an open circuit allows a trial.
    pub breaker_cooldown_secs: u64,
    /// In-flight calls across all sessions.
    pub global_concurrency: usize,
    /// In-flight calls within one session.
    pub session_concurrency: usize,
    /// In-flight calls within one round fan-out.
    pub round_concurrency: usize,
}

impl Default for CallerConfig {
    fn default() -> Self {
        Self {
            planning_timeout_secs: 90,
            contribution_timeout_secs: 90,
            judge_timeout_secs: 60,
            vote_timeout_secs: 45,
            synthesis_timeout_secs: 120,
            max_tokens: MaxTokens::default(),
            retry: RetryPolicy::default(),
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 30,
            global_concurrency: 16,
            session_concurrency: 6,
            round_concurrency: 5,
        }
    }
}

impl CallerConfig {
    pub fn planning_timeout(&self) -> Duration {
        Duration::from_secs(self.planning_timeout_secs)
    }

    pub fn contribution_timeout(&self) -> Duration {
        Duration::from_secs(self.contribution_timeout_secs)
    }

    pub fn judge_timeout(&self) -> Duration {
        Duration::from_secs(self.judge_timeout_secs)
    }

    pub fn vote_timeout(&self) -> Duration {
        Duration::from_secs(self.vote_timeout_secs)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }
}

/// Session-level budget (0 = unlimited).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_cost_tokens: u64,
    pub max_wall_clock_secs: u64,
    /// Debate rounds summed over every sub-problem.
    pub max_total_rounds: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_cost_tokens: 400_000,
            max_wall_clock_secs: 1_800,
            max_total_rounds: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Attempts per checkpoint write before the session suspends.
    pub put_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            put_attempts: 3,
            backoff_ms: 200,
        }
    }
}

/// OpenAI-compatible inference endpoint used by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceEndpointConfig {
    pub url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f32,
}

impl Default for InferenceEndpointConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000/v1/chat/completions".to_string(),
            model: "default".to_string(),
            api_key_env: "DELIBERATION_API_KEY".to_string(),
            temperature: 0.4,
        }
    }
}

impl EngineConfig {
    /// Load from an optional TOML file, apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `DELIBERATION_*` overrides from a variable lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    key: key.to_string(),
                    value,
                })
        }

        if let Some(v) = lookup("DELIBERATION_SCHEDULER_MODE") {
            self.scheduler.mode = parse("DELIBERATION_SCHEDULER_MODE", v)?;
        }
        if let Some(v) = lookup("DELIBERATION_EARLY_START_ROUND") {
            self.scheduler.early_start_round = parse("DELIBERATION_EARLY_START_ROUND", v)?;
        }
        if let Some(v) = lookup("DELIBERATION_MIN_ROUNDS") {
            self.stopping.min_rounds = parse("DELIBERATION_MIN_ROUNDS", v)?;
        }
        if let Some(v) = lookup("DELIBERATION_MAX_COST_TOKENS") {
            self.budget.max_cost_tokens = parse("DELIBERATION_MAX_COST_TOKENS", v)?;
        }
        if let Some(v) = lookup("DELIBERATION_MAX_WALL_CLOCK_SECS") {
            self.budget.max_wall_clock_secs = parse("DELIBERATION_MAX_WALL_CLOCK_SECS", v)?;
        }
        if let Some(v) = lookup("DELIBERATION_MAX_TOTAL_ROUNDS") {
            self.budget.max_total_rounds = parse("DELIBERATION_MAX_TOTAL_ROUNDS", v)?;
        }
        if let Some(v) = lookup("DELIBERATION_INFERENCE_URL") {
            self.inference.url = v;
        }
        if let Some(v) = lookup("DELIBERATION_MODEL") {
            self.inference.model = v;
        }
        Ok(())
    }

    /// Reject thresholds outside their meaningful ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.stopping;
        for (name, value) in [
            ("stopping.exploration_floor", s.exploration_floor),
            ("stopping.repetition_floor", s.repetition_floor),
            ("stopping.stall_delta", s.stall_delta),
            ("stopping.readiness_targets.standard", s.readiness_targets.standard),
            ("stopping.readiness_targets.high", s.readiness_targets.high),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{} = {} not in [0, 1]",
                    name, value
                )));
            }
        }
        if s.readiness_weights.total() <= 0.0 {
            return Err(ConfigError::Invalid(
                "readiness weights must sum to a positive value".to_string(),
            ));
        }
        if s.stall_window == 0 {
            return Err(ConfigError::Invalid("stopping.stall_window must be >= 1".into()));
        }
        if self.rounds.floor == 0 || self.rounds.floor > self.rounds.ceiling {
            return Err(ConfigError::Invalid(format!(
                "rounds.floor {} must be in 1..=ceiling {}",
                self.rounds.floor, self.rounds.ceiling
            )));
        }
        if self.decomposition.max_sub_problems == 0 {
            return Err(ConfigError::Invalid(
                "decomposition.max_sub_problems must be >= 1".into(),
            ));
        }
        if self.decomposition.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "decomposition.max_attempts must be >= 1".into(),
            ));
        }
        let c = &self.caller;
        if c.global_concurrency == 0 || c.session_concurrency == 0 || c.round_concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency limits must be >= 1".into()));
        }
        if self.scheduler.early_start_round == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.early_start_round must be >= 1".into(),
            ));
        }
        Ok(())
    }
}
