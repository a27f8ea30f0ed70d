//! Circuit breaker and fallback ladder for inference providers.
//!
//! The circuit breaker tracks consecutive failures per provider. When
//! failures reach a configurable threshold the circuit *opens* and the
//! provider is skipped. After a cooldown the circuit enters *half-open*
//! state: exactly one caller is admitted as a trial, everyone else keeps
//! skipping the provider until the trial is recorded. A failed trial
//! re-opens the circuit.
//!
//! The [`FallbackLadder`] walks an ordered list of providers and admits the
//! caller to the first one that will take it.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use super::SharedInference;

/// Breaker state of one inference provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    /// Skipped by the ladder until the cooldown has passed.
    Open,
    /// The next call is a trial; a failure reopens it.
    HalfOpen,
}

/// Outcome of asking the breaker to let a call through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Admitted as the single half-open trial.
    Trial,
    Denied,
}

/// Consecutive-failure counters keyed by provider name.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    consecutive_failures: HashMap<String, u32>,
    last_failure: HashMap<String, Instant>,
    /// Half-open providers with a trial call in flight.
    trials: HashSet<String>,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time after the last failure before Open → HalfOpen.
    pub cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            consecutive_failures: HashMap::new(),
            last_failure: HashMap::new(),
            trials: HashSet::new(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    /// Any success closes the circuit.
    pub fn record_success(&mut self, provider: &str) {
        self.consecutive_failures.remove(provider);
        self.last_failure.remove(provider);
        self.trials.remove(provider);
    }

    pub fn record_failure(&mut self, provider: &str) {
        self.trials.remove(provider);
        let count = self
            .consecutive_failures
            .entry(provider.to_string())
            .or_insert(0);
        *count += 1;
        self.last_failure
            .insert(provider.to_string(), Instant::now());
    }

    /// Current state of the circuit for `provider`.
    pub fn state(&self, provider: &str) -> CircuitState {
        if self.failure_count(provider) < self.failure_threshold {
            return CircuitState::Closed;
        }
        match self.last_failure.get(provider) {
            Some(last) if last.elapsed() < self.cooldown => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    /// Closed, or half-open with no trial in flight.
    pub fn is_available(&self, provider: &str) -> bool {
        match self.state(provider) {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !self.trials.contains(provider),
            CircuitState::Open => false,
        }
    }

    /// Let one call through if the circuit allows it. A half-open circuit
    /// admits a single trial until it is recorded or released.
    pub fn admit(&mut self, provider: &str) -> Admission {
        match self.state(provider) {
            CircuitState::Closed => Admission::Admitted,
            CircuitState::HalfOpen if self.trials.insert(provider.to_string()) => {
                Admission::Trial
            }
            CircuitState::HalfOpen | CircuitState::Open => Admission::Denied,
        }
    }

    /// Free the trial slot without a verdict, e.g. when the trial call
    /// was abandoned.
    pub fn release_trial(&mut self, provider: &str) {
        self.trials.remove(provider);
    }

    /// Consecutive failures recorded for `provider`.
    pub fn failure_count(&self, provider: &str) -> u32 {
        self.consecutive_failures.get(provider).copied().unwrap_or(0)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

/// Ordered fallback ladder of providers.
#[derive(Clone)]
pub struct FallbackLadder {
    providers: Vec<SharedInference>,
}

impl FallbackLadder {
    pub fn new(providers: Vec<SharedInference>) -> Self {
        Self { providers }
    }

    /// Admit the call to the first provider whose breaker lets it through.
    pub fn admit(&self, breaker: &mut CircuitBreaker) -> Option<(SharedInference, Admission)> {
        self.providers.iter().find_map(|p| match breaker.admit(p.provider()) {
            Admission::Denied => None,
            admission => Some((p.clone(), admission)),
        })
    }

    pub fn providers(&self) -> &[SharedInference] {
        &self.providers
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for FallbackLadder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.providers.iter().map(|p| p.provider()).collect();
        f.debug_struct("FallbackLadder")
            .field("providers", &names)
            .finish()
    }
}
