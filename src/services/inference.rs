//! Downstream inference collaborator.
//!
//! The gate never runs a model itself. Admitted chat requests are handed to
//! an [`InferenceBackend`]:
//!
//! - [`UpstreamBackend`] forwards to an OpenAI-compatible
//!   `/v1/chat/completions` endpoint
//! - [`UnavailableBackend`] is used when no upstream is configured; it
//!   reports `not_loaded` and fails every call
//!
//! Every call goes through [`forward`], which bounds it with the configured
//! timeout and maps failures onto [`AppError`] without leaking upstream
//! detail to the caller.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::metrics;

/// Boxed future returned by [`InferenceBackend::complete`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Validated, flattened chat input.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub model: String,
    pub text: String,
    /// Base64 image payload, already validated.
    pub image_b64: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Model availability as reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Ok,
    NotLoaded,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStatus {
    pub state: ModelState,
    pub model: String,
    pub load_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("model not loaded: {0}")]
    NotLoaded(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),
}

impl From<InferenceError> for AppError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::NotLoaded(msg) => AppError::ModelNotLoaded(msg),
            InferenceError::Upstream(msg) | InferenceError::MalformedResponse(msg) => {
                AppError::Generation(msg)
            }
        }
    }
}

/// A component that turns a prompt into completion text.
pub trait InferenceBackend: Send + Sync {
    fn status(&self) -> BackendStatus;

    fn complete<'a>(&'a self, prompt: &'a Prompt) -> BoxFuture<'a, Result<String, InferenceError>>;
}

/// Run one completion, bounded by `timeout`.
pub async fn forward(
    backend: &dyn InferenceBackend,
    prompt: &Prompt,
    timeout: Duration,
) -> AppResult<String> {
    let start = Instant::now();
    let result = tokio::time::timeout(timeout, backend.complete(prompt)).await;
    let elapsed = start.elapsed().as_secs_f64();

    match result {
        Ok(Ok(text)) => {
            metrics::record_downstream_call("ok", elapsed);
            debug!(elapsed_secs = elapsed, chars = text.len(), "Completion finished");
            Ok(text)
        }
        Ok(Err(e)) => {
            metrics::record_downstream_call("error", elapsed);
            warn!(error = %e, elapsed_secs = elapsed, "Completion failed");
            Err(e.into())
        }
        Err(_) => {
            metrics::record_downstream_call("timeout", elapsed);
            warn!(timeout_secs = timeout.as_secs(), "Completion timed out");
            Err(AppError::DownstreamTimeout(format!(
                "no completion within {}s",
                timeout.as_secs()
            )))
        }
    }
}

// =============================================================================
// Unavailable
// =============================================================================

/// Backend used when no upstream is configured.
#[derive(Debug, Clone)]
pub struct UnavailableBackend {
    model: String,
    reason: Option<String>,
}

impl UnavailableBackend {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            reason: None,
        }
    }

    /// Backend whose model failed to load; reported as `error` by `/health`.
    pub fn failed(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            reason: Some(reason.into()),
        }
    }
}

impl InferenceBackend for UnavailableBackend {
    fn status(&self) -> BackendStatus {
        BackendStatus {
            state: if self.reason.is_some() {
                ModelState::Error
            } else {
                ModelState::NotLoaded
            },
            model: self.model.clone(),
            load_error: self.reason.clone(),
        }
    }

    fn complete<'a>(&'a self, _prompt: &'a Prompt) -> BoxFuture<'a, Result<String, InferenceError>> {
        let reason = self
            .reason
            .clone()
            .unwrap_or_else(|| "no inference upstream configured".to_string());
        Box::pin(async move { Err(InferenceError::NotLoaded(reason)) })
    }
}

// =============================================================================
// Upstream
// =============================================================================

/// Forwards completions to an OpenAI-compatible server.
#[derive(Debug, Clone)]
pub struct UpstreamBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Deserialize)]
struct CompletionBody {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

impl UpstreamBackend {
    /// Backend for the server at `base_url` (without the `/v1/...` path).
    pub fn new(base_url: &str, model: impl Into<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AppError::ConfigError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_body(&self, prompt: &Prompt) -> serde_json::Value {
        let content = match &prompt.image_b64 {
            Some(b64) => json!([
                { "type": "image_url", "image_url": { "url": format!("data:image/png;base64,{b64}") } },
                { "type": "text", "text": prompt.text },
            ]),
            None => json!(prompt.text),
        };
        json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
            "max_tokens": prompt.max_tokens,
            "temperature": prompt.temperature,
        })
    }

    async fn send(&self, prompt: &Prompt) -> Result<String, InferenceError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|e| InferenceError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(InferenceError::Upstream(format!("upstream returned {status}")));
        }

        let body: CompletionBody = response
            .json()
            .await
            .map_err(|e| InferenceError::MalformedResponse(e.to_string()))?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| InferenceError::MalformedResponse("no completion choices".to_string()))
    }
}

impl InferenceBackend for UpstreamBackend {
    fn status(&self) -> BackendStatus {
        BackendStatus {
            state: ModelState::Ok,
            model: self.model.clone(),
            load_error: None,
        }
    }

    fn complete<'a>(&'a self, prompt: &'a Prompt) -> BoxFuture<'a, Result<String, InferenceError>> {
        Box::pin(self.send(prompt))
    }
}
