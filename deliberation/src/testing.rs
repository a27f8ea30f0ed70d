//! Scripted inference for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::CallerConfig;
use crate::inference::{
    ExpertCaller, InferenceError, InferenceRequest, InferenceResponse, InferenceService, Role,
    SessionCaller,
};

type Responder = Arc<dyn Fn(&InferenceRequest, u32) -> Result<String, InferenceError> + Send + Sync>;

/// Replies per role from closures; counts calls per role.
#[derive(Default)]
pub struct ScriptedInference {
    responders: Mutex<HashMap<Role, Responder>>,
    calls: Mutex<HashMap<Role, u32>>,
}

impl ScriptedInference {
    pub fn new() -> Self {
        Self::default()
    }

    /// `f` receives the request and the 0-based call number for its role.
    pub fn on<F>(self, role: Role, f: F) -> Self
    where
        F: Fn(&InferenceRequest, u32) -> Result<String, InferenceError> + Send + Sync + 'static,
    {
        if let Ok(mut map) = self.responders.lock() {
            map.insert(role, Arc::new(f));
        }
        self
    }

    pub fn calls(&self, role: Role) -> u32 {
        self.calls
            .lock()
            .map(|m| m.get(&role).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl InferenceService for ScriptedInference {
    fn provider(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let n = {
            let mut calls = self.calls.lock().map_err(|_| InferenceError::Unavailable("poisoned".into()))?;
            let entry = calls.entry(request.role).or_insert(0);
            *entry += 1;
            *entry - 1
        };
        let responder = self
            .responders
            .lock()
            .ok()
            .and_then(|m| m.get(&request.role).cloned())
            .ok_or_else(|| InferenceError::Http {
                status: 400,
                body: format!("no script for {}", request.role),
            })?;
        let content = responder(request, n)?;
        Ok(InferenceResponse {
            content,
            token_cost: 10,
        })
    }
}

/// A session caller over `inference` with fast retries.
pub fn caller_for(inference: Arc<ScriptedInference>) -> SessionCaller {
    let mut config = CallerConfig::default();
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 2;
    let shared = ExpertCaller::new(vec![inference], &config).shared();
    SessionCaller::new(shared, 8)
}

pub fn transient() -> InferenceError {
    InferenceError::Http {
        status: 503,
        body: "unavailable".into(),
    }
}
