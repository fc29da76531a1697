use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

/// Which role a gateway call is made on behalf of. The agent role drives
/// the episode's decision; the judge role is used by the safety reviewer's
/// model tier and runs colder and independently configured.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayRole {
    Agent,
    Judge,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub role: GatewayRole,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            role: GatewayRole::Agent,
            temperature: 0.7,
            max_tokens: 512,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Fallback text returned when every retry of a completion call fails.
/// The runtime treats a response equal to this sentinel as a
/// `gateway_fallback` episode and tags the strategy as the safest default.
pub const COMPLETION_FALLBACK: &str = "[gateway unavailable: unable to produce a response]";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("model call timed out after {0:?}")]
    ModelTimeout(Duration),
    #[error("malformed response from model: {0}")]
    MalformedResponse(String),
}

/// Uniform call contract the rest of the engine depends on. A deterministic
/// in-memory stub (see [`StubGateway`]) satisfies this trait for tests and
/// for the reproducibility properties described for the experiment runner.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        opts: &CompletionOptions,
    ) -> Result<String, GatewayError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError>;
}

/// Runs `f` up to `attempts` times with capped exponential backoff between
/// tries (start `initial`, doubling each retry, capped at `cap`). On final
/// failure the error from the last attempt is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(
    attempts: u32,
    initial: Duration,
    factor: u32,
    cap: Duration,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    let mut delay = initial;
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt + 1 == attempts.max(1) {
                    last_err = Some(err);
                    break;
                }
                warn!(attempt, ?err, "gateway call failed; retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * factor).min(cap);
                last_err = Some(err);
            }
        }
    }
    Err(last_err.expect("at least one attempt always runs"))
}

/// OpenAI-compatible chat-completions and embeddings client. The agent and
/// judge roles may point at different base URLs/models/temperatures; both
/// share one underlying `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    pub agent: RoleEndpoint,
    pub judge: RoleEndpoint,
    pub embedding_model: String,
    pub retry_attempts: u32,
    pub retry_initial_backoff: Duration,
    pub retry_backoff_factor: u32,
}

#[derive(Debug, Clone)]
pub struct RoleEndpoint {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl HttpGateway {
    pub fn new(agent: RoleEndpoint, judge: RoleEndpoint, embedding_model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            agent,
            judge,
            embedding_model: embedding_model.into(),
            retry_attempts: 3,
            retry_initial_backoff: Duration::from_millis(200),
            retry_backoff_factor: 2,
        }
    }

    fn endpoint_for(&self, role: GatewayRole) -> &RoleEndpoint {
        match role {
            GatewayRole::Agent => &self.agent,
            GatewayRole::Judge => &self.judge,
        }
    }

    async fn call_chat(
        &self,
        endpoint: &RoleEndpoint,
        system_prompt: &str,
        user_prompt: &str,
        opts: &CompletionOptions,
    ) -> Result<String, GatewayError> {
        let body = json!({
            "model": endpoint.model,
            "temperature": opts.temperature,
            "max_tokens": opts.max_tokens,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
        });

        let url = format!("{}/chat/completions", endpoint.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&endpoint.api_key)
            .json(&body)
            .timeout(opts.timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    GatewayError::ModelTimeout(opts.timeout)
                } else {
                    GatewayError::ModelUnavailable(err.to_string())
                }
            })?;

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|err| GatewayError::MalformedResponse(err.to_string()))?;

        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| GatewayError::MalformedResponse("missing choices[0].message.content".into()))
    }

    async fn call_embed(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        let body = json!({ "model": self.embedding_model, "input": text });
        let url = format!("{}/embeddings", self.agent.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.agent.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| GatewayError::ModelUnavailable(err.to_string()))?;

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|err| GatewayError::MalformedResponse(err.to_string()))?;

        value["data"][0]["embedding"]
            .as_array()
            .map(|arr| arr.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
            .ok_or_else(|| GatewayError::MalformedResponse("missing data[0].embedding".into()))
    }
}

#[async_trait]
impl ModelGateway for HttpGateway {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        opts: &CompletionOptions,
    ) -> Result<String, GatewayError> {
        let endpoint = self.endpoint_for(opts.role).clone();
        retry_with_backoff(
            self.retry_attempts,
            self.retry_initial_backoff,
            self.retry_backoff_factor,
            Duration::from_secs(5),
            || self.call_chat(&endpoint, system_prompt, user_prompt, opts),
        )
        .await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        retry_with_backoff(
            self.retry_attempts,
            self.retry_initial_backoff,
            self.retry_backoff_factor,
            Duration::from_secs(5),
            || self.call_embed(text),
        )
        .await
    }
}

/// Calls `gateway.complete`, falling back to [`COMPLETION_FALLBACK`] and
/// logging a warning instead of propagating the error. Used by callers that
/// must keep an episode loop moving even when the model is unreachable.
pub async fn complete_or_fallback(
    gateway: &dyn ModelGateway,
    system_prompt: &str,
    user_prompt: &str,
    opts: &CompletionOptions,
) -> (String, bool) {
    match gateway.complete(system_prompt, user_prompt, opts).await {
        Ok(text) => (text, false),
        Err(err) => {
            warn!(?err, "gateway completion failed after retries; using fallback");
            (COMPLETION_FALLBACK.to_string(), true)
        }
    }
}

/// Deterministic stub used throughout the test suite and by the engine's
/// reproducibility scenarios. Echoes a caller-supplied strategy tag into the
/// response text and returns a fixed-seed pseudo-embedding derived from the
/// input's byte length, so identical inputs always produce identical
/// vectors without a live embedding backend.
pub struct StubGateway {
    pub canned_response: Arc<dyn Fn(&str, &str) -> String + Send + Sync>,
}

impl Default for StubGateway {
    fn default() -> Self {
        Self {
            canned_response: Arc::new(|_system, user| format!("stub reply to: {user}")),
        }
    }
}

impl StubGateway {
    pub fn with_response(f: impl Fn(&str, &str) -> String + Send + Sync + 'static) -> Self {
        Self { canned_response: Arc::new(f) }
    }
}

#[async_trait]
impl ModelGateway for StubGateway {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        _opts: &CompletionOptions,
    ) -> Result<String, GatewayError> {
        Ok((self.canned_response)(system_prompt, user_prompt))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        let mut vector = vec![0.0f32; 16];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % 16] += byte as f32 / 255.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

/// Extract the first valid JSON fenced code block from a model response,
/// falling back to the widest bare `{...}` span. Used by the safety
/// reviewer's model tier to parse judge verdicts.
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(json_start) = after_fence.find(|c: char| !c.is_whitespace()) {
            let json_body = &after_fence[json_start..];
            if let Some(fence_end) = json_body.find("```") {
                let json_str = json_body[..fence_end].trim();
                if let Ok(val) = serde_json::from_str(json_str) {
                    return Some(val);
                }
            }
        }
    }

    let trimmed = response.trim();
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                let candidate = &trimmed[start..=end];
                if let Ok(val) = serde_json::from_str(candidate) {
                    return Some(val);
                }
            }
        }
    }

    None
}
