//! Chat completion endpoint.

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::header::{CACHE_CONTROL, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use tracing::{info, instrument};

use crate::error::AppResult;
use crate::middleware::ip::ClientIp;
use crate::middleware::request_id::RequestId;
use crate::models::{ChatRequest, ChatResponse};
use crate::services::credentials::Principal;
use crate::services::inference;
use crate::state::AppState;
use crate::validation::validate_chat_request;

/// OpenAI-compatible chat completion.
///
/// Runs behind the admission layer, so the caller is already authenticated,
/// within budget and holds `chat:read`. The request is validated, forwarded
/// to the inference backend under the configured timeout and answered with
/// `Cache-Control: no-store`.
///
/// # Errors
///
/// - 400 `invalid_request` / `decode_error` for invalid input
/// - 413 for an oversized body or image, 415 for an unrecognised image
/// - 503 when no model is available
/// - 504 when the backend exceeds the timeout
/// - 500 for any other backend failure
#[instrument(
    skip_all,
    fields(key_id = %principal.id, client_ip = %client_ip, request_id = %request_id)
)]
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Extension(request_id): Extension<RequestId>,
    Extension(client_ip): Extension<ClientIp>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> AppResult<Response> {
    let Json(request) = payload?;
    let prompt = validate_chat_request(&request, state.config.chat_limits())?;

    let content = inference::forward(
        state.backend.as_ref(),
        &prompt,
        state.config.downstream_timeout,
    )
    .await?;

    info!(
        model = %request.model,
        max_tokens = prompt.max_tokens,
        has_image = prompt.image_b64.is_some(),
        "Chat completion served"
    );

    let body = ChatResponse::completion(request_id.as_str(), request.model, content);
    Ok((
        [(CACHE_CONTROL, HeaderValue::from_static("no-store"))],
        Json(body),
    )
        .into_response())
}
