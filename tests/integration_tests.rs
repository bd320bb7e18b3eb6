//! End-to-end tests for the inference gate.
//!
//! Each test starts the real router on an ephemeral port with a scripted
//! in-memory backend, a temporary credential store and a temporary
//! denylist, then drives it over HTTP with `reqwest`.
//!
//! Run with: `cargo test --test integration_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use inference_gate::services::UnavailableBackend;
use inference_gate::services::inference::{
    BackendStatus, BoxFuture, InferenceBackend, InferenceError, ModelState, Prompt,
};
use inference_gate::services::rate_limiter::RatePolicy;
use inference_gate::{AppState, Config, build_router};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

const CHAT_SECRET: &str = "chat-secret-0001";
const ADMIN_SECRET: &str = "admin-secret-0001";
const EXPIRED_SECRET: &str = "expired-secret-0001";
const BLOCKED_SECRET: &str = "blocked-secret-0001";

/// Backend that echoes the prompt text after an optional delay.
struct ScriptedBackend {
    delay: Duration,
}

impl InferenceBackend for ScriptedBackend {
    fn status(&self) -> BackendStatus {
        BackendStatus {
            state: ModelState::Ok,
            model: "test-model".to_string(),
            load_error: None,
        }
    }

    fn complete<'a>(&'a self, prompt: &'a Prompt) -> BoxFuture<'a, Result<String, InferenceError>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(format!("echo: {}", prompt.text))
        })
    }
}

fn hash(secret: &str) -> String {
    bcrypt::hash(secret, 4).unwrap()
}

fn credential_store() -> String {
    format!(
        r#"keys:
  - id: chat
    hash: "{chat}"
    owner: chat@example.com
    scopes: ["chat:read"]
  - id: admin
    hash: "{admin}"
    owner: ops@example.com
    scopes: ["*"]
  - id: expired
    hash: "{expired}"
    owner: old@example.com
    scopes: ["chat:read"]
    expires_at: "2020-01-01T00:00:00Z"
  - id: blocked
    hash: "{blocked}"
    owner: blocked@example.com
    scopes: ["chat:read"]
"#,
        chat = hash(CHAT_SECRET),
        admin = hash(ADMIN_SECRET),
        expired = hash(EXPIRED_SECRET),
        blocked = hash(BLOCKED_SECRET),
    )
}

/// Running server plus the files backing it.
struct TestFixture {
    base_url: String,
    client: Client,
    denylist_file: PathBuf,
    state: AppState,
    _dir: TempDir,
}

impl TestFixture {
    async fn new() -> Self {
        Self::with(|_| {}, Arc::new(ScriptedBackend { delay: Duration::ZERO })).await
    }

    /// Start a server; `tweak` adjusts the config after the stores are set.
    async fn with(
        tweak: impl FnOnce(&mut Config),
        backend: Arc<dyn InferenceBackend>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let api_keys_file = dir.path().join("api_keys.yaml");
        let denylist_file = dir.path().join("denylist.txt");
        std::fs::write(&api_keys_file, credential_store()).unwrap();
        std::fs::write(&denylist_file, "# seeded\nkey:blocked\n").unwrap();

        let mut config = Config {
            api_keys_file,
            denylist_file: denylist_file.clone(),
            ip_rate: RatePolicy::parse("6000/minute", 1000).unwrap(),
            metrics_port: 0,
            ..Config::default()
        };
        tweak(&mut config);

        let state = AppState::new(config, backend);
        let app = build_router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            base_url: format!("http://{addr}"),
            client,
            denylist_file,
            state,
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn chat(&self, secret: Option<&str>, body: Value) -> reqwest::Response {
        let mut request = self.client.post(self.url("/v1/chat/completions")).json(&body);
        if let Some(secret) = secret {
            request = request.bearer_auth(secret);
        }
        request.send().await.unwrap()
    }
}

fn hello() -> Value {
    json!({
        "model": "test-model",
        "messages": [{"role": "user", "content": "Hello there"}]
    })
}

async fn error_type(response: reqwest::Response) -> String {
    let body: Value = response.json().await.unwrap();
    body["error"].as_str().unwrap_or_default().to_string()
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_is_public() {
    let fixture = TestFixture::new().await;

    let response = fixture.client.get(fixture.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request_id = response
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(request_id.len(), 36);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["model"], "test-model");
    assert!(body["load_error"].is_null());
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_health_reports_not_loaded() {
    let fixture = TestFixture::with(|_| {}, Arc::new(UnavailableBackend::new("vlm"))).await;

    let body: Value = fixture
        .client
        .get(fixture.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "not_loaded");
    assert_eq!(body["model"], "vlm");
}

#[tokio::test]
async fn test_client_request_id_is_replaced() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .client
        .get(fixture.url("/health"))
        .header("x-request-id", "client-chosen")
        .send()
        .await
        .unwrap();
    let id = response.headers().get("x-request-id").unwrap();
    assert_ne!(id, "client-chosen");
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_missing_key_is_unauthorized() {
    let fixture = TestFixture::new().await;

    let response = fixture.chat(None, hello()).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers().get("www-authenticate").unwrap(), "Bearer");
    assert_eq!(error_type(response).await, "unauthorized");
}

#[tokio::test]
async fn test_invalid_key_is_unauthorized() {
    let fixture = TestFixture::new().await;

    let response = fixture.chat(Some("not-a-real-key"), hello()).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_expired_key_is_unauthorized() {
    let fixture = TestFixture::new().await;

    let response = fixture.chat(Some(EXPIRED_SECRET), hello()).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_x_api_key_header_accepted() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .client
        .post(fixture.url("/v1/chat/completions"))
        .header("x-api-key", CHAT_SECRET)
        .json(&hello())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ============================================================================
// Chat Completions
// ============================================================================

#[tokio::test]
async fn test_chat_completion_success() {
    let fixture = TestFixture::new().await;

    let response = fixture.chat(Some(CHAT_SECRET), hello()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("cache-control").unwrap(), "no-store");

    let request_id = response
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["id"], format!("chatcmpl-{}", &request_id[..8]));
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "test-model");
    assert_eq!(body["choices"][0]["index"], 0);
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "echo: Hello there");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn test_max_tokens_over_limit_is_bad_request() {
    let fixture = TestFixture::new().await;

    let mut body = hello();
    body["max_tokens"] = json!(100_000);
    let response = fixture.chat(Some(CHAT_SECRET), body).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_image_is_decode_error() {
    let fixture = TestFixture::new().await;

    let body = json!({
        "model": "test-model",
        "messages": [{"role": "user", "content": [
            {"type": "text", "text": "What is this?"},
            {"type": "image", "image": {"b64": "%%% not base64 %%%"}}
        ]}]
    });
    let response = fixture.chat(Some(CHAT_SECRET), body).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_type(response).await, "decode_error");
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let fixture = TestFixture::with(
        |config| config.max_body_mb = 0.001,
        Arc::new(ScriptedBackend { delay: Duration::ZERO }),
    )
    .await;

    let body = json!({
        "model": "test-model",
        "messages": [{"role": "user", "content": "x".repeat(8 * 1024)}]
    });
    let response = fixture.chat(Some(CHAT_SECRET), body).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(error_type(response).await, "payload_too_large");
}

#[tokio::test]
async fn test_model_not_loaded_is_unavailable() {
    let fixture = TestFixture::with(|_| {}, Arc::new(UnavailableBackend::new("vlm"))).await;

    let response = fixture.chat(Some(CHAT_SECRET), hello()).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_type(response).await, "model_not_loaded");
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let fixture = TestFixture::with(
        |config| config.downstream_timeout = Duration::from_millis(100),
        Arc::new(ScriptedBackend {
            delay: Duration::from_secs(2),
        }),
    )
    .await;

    let response = fixture.chat(Some(CHAT_SECRET), hello()).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(error_type(response).await, "timeout");
}

// ============================================================================
// Rate Limiting
// ============================================================================

#[tokio::test]
async fn test_key_burst_exhaustion_returns_429() {
    // Slow refill so the run time of 20 requests cannot earn a token back
    let fixture = TestFixture::with(
        |config| config.key_rate = RatePolicy::parse("1/hour", 20).unwrap(),
        Arc::new(ScriptedBackend { delay: Duration::ZERO }),
    )
    .await;

    for i in 0..20 {
        let response = fixture.chat(Some(CHAT_SECRET), hello()).await;
        assert_eq!(response.status(), StatusCode::OK, "request {i}");
    }

    let response = fixture.chat(Some(CHAT_SECRET), hello()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let headers = response.headers();
    let retry_after: u64 = headers
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "1");
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");

    // Another key keeps its own budget
    let response = fixture.chat(Some(ADMIN_SECRET), hello()).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_ip_limit_applies_to_public_route() {
    let fixture = TestFixture::with(
        |config| config.ip_rate = RatePolicy::parse("1/hour", 2).unwrap(),
        Arc::new(ScriptedBackend { delay: Duration::ZERO }),
    )
    .await;

    for _ in 0..2 {
        let response = fixture.client.get(fixture.url("/health")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = fixture.client.get(fixture.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "1");
}

// ============================================================================
// Scopes and Denylist
// ============================================================================

#[tokio::test]
async fn test_metrics_requires_admin_scope() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .client
        .get(fixture.url("/metrics"))
        .bearer_auth(CHAT_SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_type(response).await, "insufficient_scope");

    let response = fixture
        .client
        .get(fixture.url("/metrics"))
        .bearer_auth(ADMIN_SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert!(body["requests_total"].as_u64().unwrap() >= 1);
    assert!(body["requests_4xx"].as_u64().unwrap() >= 1);
    assert!(body["uptime_seconds"].is_u64());
    assert_eq!(body["abuse_stats"]["threshold_errors"], 5);
    assert_eq!(body["abuse_stats"]["window_seconds"], 30);
    assert_eq!(body["abuse_stats"]["denied_count"], 1);
}

#[tokio::test]
async fn test_denylisted_key_is_forbidden() {
    let fixture = TestFixture::new().await;

    let response = fixture.chat(Some(BLOCKED_SECRET), hello()).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_type(response).await, "forbidden");
}

#[tokio::test]
async fn test_repeated_auth_failures_block_ip() {
    let fixture = TestFixture::new().await;

    for _ in 0..5 {
        let response = fixture.chat(Some("wrong-key"), hello()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // Blocked for every route, valid key or not
    let response = fixture.chat(Some(CHAT_SECRET), hello()).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let response = fixture.client.get(fixture.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let persisted = std::fs::read_to_string(&fixture.denylist_file).unwrap();
    assert!(persisted.lines().any(|line| line.starts_with("127.0.0.1")));
    assert!(fixture.state.gate.abuse().is_denied("127.0.0.1"));
}

#[tokio::test]
async fn test_credential_reload_picks_up_new_key() {
    let fixture = TestFixture::new().await;
    let secret = "fresh-secret-0001";

    let response = fixture.chat(Some(secret), hello()).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let store = format!(
        "{}  - id: fresh\n    hash: \"{}\"\n    scopes: [\"chat:read\"]\n",
        credential_store(),
        hash(secret)
    );
    std::fs::write(&fixture.state.config.api_keys_file, store).unwrap();
    assert_eq!(fixture.state.gate.verifier().reload(), 5);

    let response = fixture.chat(Some(secret), hello()).await;
    assert_eq!(response.status(), StatusCode::OK);
}
