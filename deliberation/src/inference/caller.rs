//! ExpertCaller: the single path for outbound model calls.
//!
//! Each attempt acquires a global permit, is admitted to the first provider
//! on the fallback ladder whose breaker lets it through and runs under the
//! request's deadline. A half-open provider takes one trial at a time. Transient failures back off and retry; anything else fails
//! immediately.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{
    Admission, CircuitBreaker, FallbackLadder, InferenceError, InferenceRequest, InferenceResponse,
    RetryPolicy, Role, SharedInference,
};
use crate::config::CallerConfig;

/// Errors returned after retry and circuit breaking are exhausted
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("{role} call failed after {attempts} attempts: {last}")]
    Exhausted {
        role: Role,
        attempts: u32,
        last: InferenceError,
    },

    #[error("{role} call rejected: {source}")]
    Rejected { role: Role, source: InferenceError },

    #[error("{role} call failed: every provider circuit is open")]
    CircuitOpen { role: Role, attempts: u32 },

    #[error("No inference providers configured")]
    NoProviders,
}

/// Retrying, circuit-breaking call wrapper shared by every session.
pub struct ExpertCaller {
    ladder: FallbackLadder,
    breaker: Mutex<CircuitBreaker>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl ExpertCaller {
    pub fn new(providers: Vec<SharedInference>, config: &CallerConfig) -> Self {
        Self {
            ladder: FallbackLadder::new(providers),
            breaker: Mutex::new(CircuitBreaker::new(
                config.breaker_failure_threshold,
                Duration::from_secs(config.breaker_cooldown_secs),
            )),
            permits: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            retry: config.retry.clone(),
        }
    }

    /// Create a shared reference to this caller
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        match self.breaker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Admit one call to a provider. The returned slot must be recorded;
    /// dropping it unrecorded frees a held trial.
    fn pick_provider(&self) -> Option<ProviderSlot<'_>> {
        let (provider, admission) = self.ladder.admit(&mut self.breaker())?;
        Some(ProviderSlot {
            caller: self,
            provider,
            trial: admission == Admission::Trial,
        })
    }

    /// Invoke with deadline, retry and fallback.
    pub async fn call(&self, request: &InferenceRequest) -> Result<InferenceResponse, CallError> {
        if self.ladder.is_empty() {
            return Err(CallError::NoProviders);
        }
        let role = request.role;
        let mut last: Option<InferenceError> = None;

        for attempt in 0..self.retry.attempts() {
            if attempt > 0 {
                let backoff = self.retry.delay_before(attempt);
                warn!(
                    %role,
                    attempt,
                    max_retries = self.retry.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %last.as_ref().map(|e| e.to_string()).unwrap_or_else(|| "circuit open".into()),
                    "Transient inference failure, retrying"
                );
                tokio::time::sleep(backoff).await;
            }

            let _permit = match self.permits.acquire().await {
                Ok(permit) => permit,
                Err(_) => return Err(CallError::NoProviders),
            };

            let Some(mut slot) = self.pick_provider() else {
                last = None;
                continue;
            };
            if slot.trial {
                debug!(%role, provider = slot.provider.provider(), "Trying half-open provider");
            }

            let name = slot.provider.provider().to_string();
            let outcome =
                tokio::time::timeout(request.timeout, slot.provider.invoke(request)).await;
            match outcome {
                Ok(Ok(response)) => {
                    slot.record(true);
                    debug!(%role, provider = %name, tokens = response.token_cost, "Inference call succeeded");
                    return Ok(response);
                }
                Ok(Err(err)) if !err.is_transient() => {
                    warn!(%role, provider = %name, error = %err, "Inference call rejected");
                    return Err(CallError::Rejected { role, source: err });
                }
                Ok(Err(err)) => {
                    slot.record(false);
                    last = Some(err);
                }
                Err(_) => {
                    slot.record(false);
                    last = Some(InferenceError::Timeout(request.timeout));
                }
            }
        }

        let attempts = self.retry.max_retries + 1;
        Err(match last {
            Some(last) => CallError::Exhausted {
                role,
                attempts,
                last,
            },
            None => CallError::CircuitOpen { role, attempts },
        })
    }
}

/// A provider admitted for one attempt.
struct ProviderSlot<'a> {
    caller: &'a ExpertCaller,
    provider: SharedInference,
    /// Holds the provider's half-open trial until recorded or dropped.
    trial: bool,
}

impl ProviderSlot<'_> {
    fn record(&mut self, ok: bool) {
        let mut breaker = self.caller.breaker();
        let name = self.provider.provider();
        if ok {
            breaker.record_success(name);
        } else {
            breaker.record_failure(name);
        }
        self.trial = false;
    }
}

impl Drop for ProviderSlot<'_> {
    fn drop(&mut self) {
        if self.trial {
            self.caller.breaker().release_trial(self.provider.provider());
        }
    }
}

/// Per-session view of the shared caller with its own concurrency limit.
#[derive(Clone)]
pub struct SessionCaller {
    inner: Arc<ExpertCaller>,
    permits: Arc<Semaphore>,
}

impl SessionCaller {
    pub fn new(inner: Arc<ExpertCaller>, session_concurrency: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(session_concurrency.max(1))),
        }
    }

    pub async fn call(&self, request: &InferenceRequest) -> Result<InferenceResponse, CallError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CallError::NoProviders)?;
        self.inner.call(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::InferenceService;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `failures` times with the given error, then succeeds.
    struct Flaky {
        name: &'static str,
        failures: u32,
        error: InferenceError,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(name: &'static str, failures: u32, error: InferenceError) -> Arc<Self> {
            Arc::new(Self {
                name,
                failures,
                error,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl InferenceService for Flaky {
        fn provider(&self) -> &str {
            self.name
        }

        async fn invoke(
            &self,
            _request: &InferenceRequest,
        ) -> Result<InferenceResponse, InferenceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok(InferenceResponse {
                    content: format!("ok from {}", self.name),
                    token_cost: 10,
                })
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl InferenceService for Slow {
        fn provider(&self) -> &str {
            "slow"
        }

        async fn invoke(
            &self,
            _request: &InferenceRequest,
        ) -> Result<InferenceResponse, InferenceError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(InferenceResponse {
                content: String::new(),
                token_cost: 0,
            })
        }
    }

    fn request() -> InferenceRequest {
        InferenceRequest::new(Role::Expert, "system", "prompt").timeout(Duration::from_secs(5))
    }

    fn server_error() -> InferenceError {
        InferenceError::Http {
            status: 503,
            body: "busy".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let flaky = Flaky::new("primary", 2, server_error());
        let caller = ExpertCaller::new(vec![flaky.clone()], &CallerConfig::default());
        let response = caller.call(&request()).await.unwrap();
        assert_eq!(response.content, "ok from primary");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_retries() {
        let flaky = Flaky::new("primary", 10, server_error());
        let caller = ExpertCaller::new(vec![flaky.clone()], &CallerConfig::default());
        let err = caller.call(&request()).await.unwrap_err();
        assert!(matches!(err, CallError::Exhausted { attempts: 3, .. }));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_fails_immediately() {
        let flaky = Flaky::new(
            "primary",
            10,
            InferenceError::Http {
                status: 401,
                body: "no key".into(),
            },
        );
        let caller = ExpertCaller::new(vec![flaky.clone()], &CallerConfig::default());
        let err = caller.call(&request()).await.unwrap_err();
        assert!(matches!(err, CallError::Rejected { .. }));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient() {
        let config = CallerConfig {
            retry: RetryPolicy {
                max_retries: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let caller = ExpertCaller::new(vec![Arc::new(Slow)], &config);
        let err = caller.call(&request()).await.unwrap_err();
        match err {
            CallError::Exhausted { last, attempts, .. } => {
                assert_eq!(attempts, 2);
                assert!(matches!(last, InferenceError::Timeout(_)));
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_falls_back_to_next_provider() {
        let config = CallerConfig {
            breaker_failure_threshold: 1,
            breaker_cooldown_secs: 600,
            ..Default::default()
        };
        let primary = Flaky::new("primary", 100, server_error());
        let backup = Flaky::new("backup", 0, server_error());
        let caller = ExpertCaller::new(vec![primary.clone(), backup.clone()], &config);

        let response = caller.call(&request()).await.unwrap();
        assert_eq!(response.content, "ok from backup");
        // Primary's circuit is open, so the next call goes straight to backup.
        caller.call(&request()).await.unwrap();
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_circuits_open() {
        let config = CallerConfig {
            breaker_failure_threshold: 1,
            breaker_cooldown_secs: 3600,
            ..Default::default()
        };
        let primary = Flaky::new("primary", 100, server_error());
        let caller = ExpertCaller::new(vec![primary.clone()], &config);
        let _ = caller.call(&request()).await;
        let err = caller.call(&request()).await.unwrap_err();
        assert!(matches!(err, CallError::CircuitOpen { .. }));
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let config = CallerConfig {
            breaker_failure_threshold: 1,
            breaker_cooldown_secs: 30,
            ..Default::default()
        };
        let primary = Flaky::new("primary", 1, server_error());
        let caller = ExpertCaller::new(vec![primary.clone()], &config);
        caller.breaker().record_failure("primary");
        tokio::time::advance(Duration::from_secs(31)).await;

        let first = caller.pick_provider().unwrap();
        assert!(first.trial);
        assert!(caller.pick_provider().is_none());

        // An abandoned trial frees the slot for the next caller.
        drop(first);
        let mut second = caller.pick_provider().unwrap();
        assert!(second.trial);
        second.record(true);
        drop(second);
        assert!(!caller.pick_provider().unwrap().trial);
        assert!(caller.pick_provider().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_wait_behind_trial() {
        let config = CallerConfig {
            breaker_failure_threshold: 1,
            breaker_cooldown_secs: 30,
            retry: RetryPolicy {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let caller = ExpertCaller::new(vec![Arc::new(Slow)], &config);
        caller.breaker().record_failure("slow");
        tokio::time::advance(Duration::from_secs(31)).await;

        let (req_a, req_b) = (request(), request());
        let (trial, other) = tokio::join!(caller.call(&req_a), caller.call(&req_b));
        assert!(matches!(trial, Err(CallError::Exhausted { .. })));
        assert!(matches!(other, Err(CallError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_no_providers() {
        let caller = ExpertCaller::new(vec![], &CallerConfig::default());
        assert!(matches!(
            caller.call(&request()).await,
            Err(CallError::NoProviders)
        ));
    }
}
