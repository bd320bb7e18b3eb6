use axum::extract::rejection::JsonRejection;
use axum::http::header::{HeaderValue, RETRY_AFTER, WWW_AUTHENTICATE};
use axum::http::{HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Header carrying the configured request count of the policy that rejected.
pub const RATE_LIMIT_LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");

/// Header carrying the remaining allowance (always `0` on a 429).
pub const RATE_LIMIT_REMAINING_HEADER: HeaderName =
    HeaderName::from_static("x-ratelimit-remaining");

/// Classified failure kind recorded by abuse tracking.
///
/// Error responses carry their kind as a response extension so the
/// admission layer can record it without re-deriving it from the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRequest,
    Oversized,
    DecodeError,
    UnsupportedMedia,
    ModelNotLoaded,
    GenerationError,
    Timeout,
    Cancelled,
    Unauthenticated,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Oversized => "oversized",
            ErrorKind::DecodeError => "decode_error",
            ErrorKind::UnsupportedMedia => "unsupported_media",
            ErrorKind::ModelNotLoaded => "model_not_loaded",
            ErrorKind::GenerationError => "generation_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Internal => "internal_error",
        }
    }

    /// Fallback classification for error responses produced outside our
    /// handlers (extractor rejections, body limits).
    pub fn from_status(status: StatusCode) -> Option<Self> {
        match status {
            StatusCode::PAYLOAD_TOO_LARGE => Some(ErrorKind::Oversized),
            StatusCode::UNSUPPORTED_MEDIA_TYPE => Some(ErrorKind::UnsupportedMedia),
            StatusCode::UNAUTHORIZED => Some(ErrorKind::Unauthenticated),
            StatusCode::GATEWAY_TIMEOUT => Some(ErrorKind::Timeout),
            s if s.is_client_error() => Some(ErrorKind::InvalidRequest),
            s if s.is_server_error() => Some(ErrorKind::Internal),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application-wide error types with appropriate HTTP status codes.
///
/// # Admission Rejections
///
/// `Unauthenticated`, `Denied`, `RateLimited` and `InsufficientScope` are the
/// gate's rejection decisions. Each maps to one stable status code and the
/// headers the surrounding HTTP contract expects.
///
/// # Downstream Failures
///
/// `ModelNotLoaded`, `Generation` and `DownstreamTimeout` come from the
/// inference collaborator. They are reported with a generic message; the
/// detail is only logged server-side.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Access denied: {0}")]
    Denied(String),

    #[error("Rate limit exceeded for {scope}: retry after {retry_after}s")]
    RateLimited {
        scope: &'static str,
        retry_after: u64,
        limit: u32,
    },

    #[error("Insufficient scope: {0}")]
    InsufficientScope(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Downstream call timed out: {0}")]
    DownstreamTimeout(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Undecodable payload: {0}")]
    DecodeError(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Unsupported media: {0}")]
    UnsupportedMedia(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status this error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::Denied(_) | AppError::InsufficientScope(_) => StatusCode::FORBIDDEN,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::ModelNotLoaded(_) | AppError::StoreUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::DownstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::BadRequest(_) | AppError::DecodeError(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::UnsupportedMedia(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::ConfigError(_) | AppError::Generation(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Failure kind recorded for abuse tracking, if this error is one.
    ///
    /// Denials, rate limits and scope failures are gate decisions, not
    /// caller errors, and carry no kind.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            AppError::Unauthenticated(_) => Some(ErrorKind::Unauthenticated),
            AppError::BadRequest(_) => Some(ErrorKind::InvalidRequest),
            AppError::DecodeError(_) => Some(ErrorKind::DecodeError),
            AppError::PayloadTooLarge(_) => Some(ErrorKind::Oversized),
            AppError::UnsupportedMedia(_) => Some(ErrorKind::UnsupportedMedia),
            AppError::ModelNotLoaded(_) => Some(ErrorKind::ModelNotLoaded),
            AppError::Generation(_) => Some(ErrorKind::GenerationError),
            AppError::DownstreamTimeout(_) => Some(ErrorKind::Timeout),
            AppError::ConfigError(_) | AppError::StoreUnavailable(_) | AppError::Internal(_) => {
                Some(ErrorKind::Internal)
            }
            AppError::Denied(_) | AppError::RateLimited { .. } | AppError::InsufficientScope(_) => {
                None
            }
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::Unauthenticated(_) => "unauthorized",
            AppError::Denied(_) => "forbidden",
            AppError::RateLimited { .. } => "too_many_requests",
            AppError::InsufficientScope(_) => "insufficient_scope",
            AppError::ConfigError(_) => "config_error",
            AppError::StoreUnavailable(_) => "store_unavailable",
            AppError::ModelNotLoaded(_) => "model_not_loaded",
            AppError::Generation(_) => "generation_error",
            AppError::DownstreamTimeout(_) => "timeout",
            AppError::BadRequest(_) => "bad_request",
            AppError::DecodeError(_) => "decode_error",
            AppError::PayloadTooLarge(_) => "payload_too_large",
            AppError::UnsupportedMedia(_) => "unsupported_media",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Message safe to show to the caller.
    fn public_message(&self) -> String {
        match self {
            // Client-facing decisions - the message is meant for the caller
            AppError::Unauthenticated(msg)
            | AppError::Denied(msg)
            | AppError::InsufficientScope(msg)
            | AppError::BadRequest(msg)
            | AppError::DecodeError(msg)
            | AppError::PayloadTooLarge(msg)
            | AppError::UnsupportedMedia(msg) => msg.clone(),
            AppError::RateLimited {
                scope, retry_after, ..
            } => format!("Rate limit exceeded for {scope}. Try again in {retry_after} seconds."),

            // Downstream and internal failures - never expose internal details
            AppError::ModelNotLoaded(_) => {
                "Model is not available. Please try again later.".to_string()
            }
            AppError::Generation(_) => "Generation failed".to_string(),
            AppError::DownstreamTimeout(_) => {
                "Generation timed out. Please try again.".to_string()
            }
            AppError::StoreUnavailable(_) => {
                "Service is temporarily unavailable. Please try again later.".to_string()
            }
            AppError::ConfigError(_) => {
                "Service configuration error. Please contact support.".to_string()
            }
            AppError::Internal(_) => {
                "An internal error occurred. Please contact support if the issue persists."
                    .to_string()
            }
        }
    }
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            // Log the full error details server-side for debugging
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        let body = ErrorResponse {
            error: self.error_type().to_string(),
            message: self.public_message(),
        };
        let mut response = (status, axum::Json(body)).into_response();

        let headers = response.headers_mut();
        match &self {
            AppError::Unauthenticated(_) => {
                headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            AppError::RateLimited {
                retry_after, limit, ..
            } => {
                headers.insert(RETRY_AFTER, HeaderValue::from(*retry_after));
                headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(*limit));
                headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from_static("0"));
            }
            _ => {}
        }

        if let Some(kind) = self.kind() {
            response.extensions_mut().insert(kind);
        }
        response
    }
}

/// Body extraction failures keep the JSON error shape.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge("Request body too large".to_string())
        } else {
            AppError::BadRequest(rejection.body_text())
        }
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
