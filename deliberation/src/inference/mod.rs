//! Inference service abstraction and the call wrapper around it.
//!
//! Every outbound model call in the engine goes through
//! [`ExpertCaller`]: per-call deadline, retries with jittered exponential
//! backoff, a circuit breaker per provider and an ordered fallback ladder.

pub mod caller;
pub mod circuit_breaker;
pub mod http;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use caller::{CallError, ExpertCaller, SessionCaller};
pub use circuit_breaker::{Admission, CircuitBreaker, CircuitState, FallbackLadder};
pub use http::OpenAiCompatibleProvider;
pub use retry::RetryPolicy;

/// What a call is for. Providers may route or prompt differently per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Planner,
    Clarifier,
    Expert,
    Judge,
    Voter,
    Synthesizer,
    MetaSynthesizer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planner => write!(f, "planner"),
            Self::Clarifier => write!(f, "clarifier"),
            Self::Expert => write!(f, "expert"),
            Self::Judge => write!(f, "judge"),
            Self::Voter => write!(f, "voter"),
            Self::Synthesizer => write!(f, "synthesizer"),
            Self::MetaSynthesizer => write!(f, "meta_synthesizer"),
        }
    }
}

/// One model invocation.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub role: Role,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl InferenceRequest {
    pub fn new(role: Role, system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            role,
            system: system.into(),
            prompt: prompt.into(),
            max_tokens: 800,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Model output and what it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResponse {
    pub content: String,
    pub token_cost: u64,
}

/// Errors from a single provider call
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

impl InferenceError {
    /// Whether retrying the same call can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status == 429 || *status == 408 || *status >= 500,
            Self::Transport(_) | Self::Timeout(_) | Self::Unavailable(_) => true,
            Self::Malformed(_) => false,
        }
    }
}

/// A model backend.
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Provider name, used as the circuit breaker key.
    fn provider(&self) -> &str;

    async fn invoke(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError>;
}

pub type SharedInference = Arc<dyn InferenceService>;

/// Rough token estimate for providers that do not report usage.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
