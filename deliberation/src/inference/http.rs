//! OpenAI-compatible chat-completions provider.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{estimate_tokens, InferenceError, InferenceRequest, InferenceResponse, InferenceService};
use crate::config::InferenceEndpointConfig;

/// Provider for any endpoint speaking the OpenAI chat-completions API
/// (vLLM, llama.cpp server, hosted gateways).
pub struct OpenAiCompatibleProvider {
    name: String,
    url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &InferenceEndpointConfig) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| InferenceError::Unavailable(format!("HTTP client: {e}")))?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        Ok(Self {
            name: format!("openai-compatible:{}", config.model),
            url: config.url.clone(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            client,
        })
    }

    fn body(&self, request: &InferenceRequest) -> Value {
        serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
            "max_tokens": request.max_tokens,
            "temperature": self.temperature,
        })
    }
}

/// Extract content and token cost from a chat-completions response body.
fn parse_completion(body: &Value, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
    let content = body["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| InferenceError::Malformed("missing choices[0].message.content".into()))?
        .to_string();
    if content.trim().is_empty() {
        // Empty-but-200 replies are usually a proxy hiccup.
        return Err(InferenceError::Unavailable("empty completion".into()));
    }
    let token_cost = body["usage"]["total_tokens"]
        .as_u64()
        .unwrap_or_else(|| {
            estimate_tokens(&request.system) + estimate_tokens(&request.prompt) + estimate_tokens(&content)
        });
    Ok(InferenceResponse {
        content,
        token_cost,
    })
}

#[async_trait]
impl InferenceService for OpenAiCompatibleProvider {
    fn provider(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let mut builder = self
            .client
            .post(&self.url)
            .timeout(request.timeout)
            .json(&self.body(request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout(request.timeout)
            } else {
                InferenceError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Http {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;
        parse_completion(&body, request)
    }
}
