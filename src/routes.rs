//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Mints the id, adds X-Request-Id header
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← Span per request carrying the id
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Access Log     │ ← Stats, metrics, audit events
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Body Limit     │ ← 413 past MAX_BODY_MB
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │    Admission     │ ← 401 / 403 / 429 (per route)
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! # Routes
//!
//! - `GET /health` - public
//! - `POST /v1/chat/completions` - scope `chat:read`
//! - `GET /metrics` - scope `*`

use axum::Router;
use axum::body::Body;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::middleware::{AccessLogLayer, AdmissionLayer, RequestIdLayer, request_span};
use crate::services::credentials::WILDCARD_SCOPE;
use crate::state::AppState;

/// Scope required by the chat endpoint.
pub const CHAT_SCOPE: &str = "chat:read";

/// Build the application router with all routes and middleware configured.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so the
/// admission layer can see the peer address.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;
    let gate = &state.gate;

    // =========================================================================
    // Routes, each with its own admission requirement
    // =========================================================================
    let public = Router::new()
        .route("/health", get(handlers::health_check))
        .route_layer(AdmissionLayer::public(gate.clone()));

    let chat = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route_layer(AdmissionLayer::protected(gate.clone(), CHAT_SCOPE));

    let admin = Router::new()
        .route("/metrics", get(handlers::metrics_summary))
        .route_layer(AdmissionLayer::protected(gate.clone(), WILDCARD_SCOPE));

    let mut router = public.merge(chat).merge(admin);

    // =========================================================================
    // Apply Middleware Stack (order matters - applied bottom to top)
    // =========================================================================

    // 1. Request body size limit
    info!(
        max_body_mb = config.max_body_mb,
        "Request body size limit configured"
    );
    router = router.layer(DefaultBodyLimit::max(config.body_limit_bytes()));

    // 2. Access log and request stats
    router = router.layer(AccessLogLayer::new(
        state.stats.clone(),
        config.proxy_trust(),
    ));

    // 3. Tracing
    router = router.layer(TraceLayer::new_for_http().make_span_with(request_span::<Body>));

    // 4. Request ID (outermost so the trace span can read it)
    router = router.layer(RequestIdLayer::new());

    info!(
        ip_rate = %config.ip_rate,
        key_rate = %config.key_rate,
        trust_proxy_headers = config.trust_proxy_headers,
        credentials = gate.verifier().len(),
        "Admission gate configured"
    );

    router.with_state(state)
}
