use serde::{Deserialize, Serialize};

use crate::metrics::RequestSummary;
use crate::services::abuse::AbuseStats;
use crate::services::inference::ModelState;

/// OpenAI-style chat completion request.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    128
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

/// Message content: plain text or a list of typed parts.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One content part.
///
/// Parts are matched on `type` (`text`, `image`, `image_url`); other types
/// are ignored. Image data is read from `image.b64` for both image types.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image: Option<ImagePayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImagePayload {
    #[serde(default)]
    pub b64: Option<String>,
}

/// Chat completion response.
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: &'static str,
    pub model: String,
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatResponse {
    /// Single-choice completion for the request identified by `request_id`.
    pub fn completion(request_id: &str, model: String, content: String) -> Self {
        let short_id: String = request_id.chars().take(8).collect();
        Self {
            id: format!("chatcmpl-{short_id}"),
            object: "chat.completion",
            model,
            choices: vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant",
                    content,
                },
                finish_reason: "stop",
            }],
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: ModelState,
    pub model: String,
    pub load_error: Option<String>,
    pub version: String,
}

/// Admin metrics summary.
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub requests_total: u64,
    pub requests_2xx: u64,
    pub requests_4xx: u64,
    pub requests_5xx: u64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub uptime_seconds: u64,
    pub abuse_stats: AbuseStats,
}

impl MetricsResponse {
    pub fn new(summary: RequestSummary, uptime_seconds: u64, abuse_stats: AbuseStats) -> Self {
        Self {
            requests_total: summary.total,
            requests_2xx: summary.success,
            requests_4xx: summary.client_errors,
            requests_5xx: summary.server_errors,
            latency_p50_ms: round2(summary.p50_ms),
            latency_p95_ms: round2(summary.p95_ms),
            uptime_seconds,
            abuse_stats,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
