//! Admission middleware.
//!
//! Wraps a route with the [`AdmissionGate`]. Applied per route with
//! `route_layer`, so each route declares its own access requirement:
//!
//! ```rust,ignore
//! Router::new()
//!     .route("/health", get(health))
//!     .route_layer(AdmissionLayer::public(gate.clone()))
//! ```
//!
//! # Credentials
//!
//! A secret is read from `Authorization: Bearer <secret>`, falling back to
//! `X-API-Key: <secret>`.
//!
//! # Outcome Recording
//!
//! Admitted requests get an [`OutcomeGuard`](crate::services::gate::OutcomeGuard).
//! The response status and its [`ErrorKind`] extension (or a kind derived
//! from the status) are recorded once the inner service returns. If the
//! request future is dropped first, the guard records a cancellation.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::debug;

use super::ip::{ClientIp, client_ip_from_request};
use crate::error::ErrorKind;
use crate::services::gate::{AdmissionGate, PresentedCredential, RouteAccess};

/// Header carrying a raw API key.
pub const API_KEY_HEADER: &str = "x-api-key";

const BEARER_PREFIX: &str = "bearer ";

/// Admission layer for one route.
#[derive(Clone)]
pub struct AdmissionLayer {
    gate: Arc<AdmissionGate>,
    access: RouteAccess,
}

impl AdmissionLayer {
    /// Public route: denylist and IP rate limit only.
    pub fn public(gate: Arc<AdmissionGate>) -> Self {
        Self {
            gate,
            access: RouteAccess::Public,
        }
    }

    /// Protected route requiring `scope`.
    pub fn protected(gate: Arc<AdmissionGate>, scope: &'static str) -> Self {
        Self {
            gate,
            access: RouteAccess::Protected { scope },
        }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            gate: self.gate.clone(),
            access: self.access,
        }
    }
}

/// Admission service wrapper.
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    gate: Arc<AdmissionGate>,
    access: RouteAccess,
}

impl<S> Service<Request<Body>> for AdmissionService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let gate = self.gate.clone();
        let access = self.access;
        let client_ip = client_ip_from_request(&req, gate.proxy_trust());
        let credential = match access {
            RouteAccess::Public => PresentedCredential::None,
            RouteAccess::Protected { .. } => extract_credential(&req),
        };
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let principal = match gate.admit(&client_ip, credential, access).await {
                Ok(principal) => principal,
                Err(e) => {
                    debug!(client_ip = %client_ip, path = %req.uri().path(), "Request not admitted");
                    return Ok(e.into_response());
                }
            };

            let guard = gate.outcome_guard(
                client_ip.clone(),
                principal.as_ref().map(|p| p.id.clone()),
            );
            req.extensions_mut().insert(ClientIp(client_ip));
            if let Some(principal) = &principal {
                req.extensions_mut().insert(principal.clone());
            }

            let mut response = inner.call(req).await?;

            let status = response.status();
            let kind = response
                .extensions()
                .get::<ErrorKind>()
                .copied()
                .or_else(|| ErrorKind::from_status(status));
            guard.finish(status.as_u16(), kind);

            // Lets the access log attribute the request
            if let Some(principal) = principal {
                response.extensions_mut().insert(principal);
            }
            Ok(response)
        })
    }
}

/// Extract the presented secret, preferring the bearer token.
pub fn extract_credential<B>(req: &Request<B>) -> PresentedCredential {
    if let Some(value) = req.headers().get(AUTHORIZATION)
        && let Ok(value) = value.to_str()
        && let Some(prefix) = value.get(..BEARER_PREFIX.len())
        && prefix.eq_ignore_ascii_case(BEARER_PREFIX)
        && let Some(token) = value.get(BEARER_PREFIX.len()..)
        && !token.trim().is_empty()
    {
        return PresentedCredential::Secret(token.trim().to_string());
    }

    if let Some(value) = req.headers().get(API_KEY_HEADER)
        && let Ok(value) = value.to_str()
        && !value.trim().is_empty()
    {
        return PresentedCredential::Secret(value.trim().to_string());
    }

    PresentedCredential::None
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::middleware::ip::ProxyTrust;
    use crate::services::abuse::{AbuseDetector, AbusePolicy};
    use crate::services::credentials::{CredentialRecord, CredentialVerifier, Principal};
    use crate::services::denylist::Denylist;
    use crate::services::rate_limiter::{RateLimiter, RatePolicy};
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use chrono::Utc;
    use tower::ServiceExt;

    const SECRET: &str = "reader-secret";

    fn gate() -> Arc<AdmissionGate> {
        let record = CredentialRecord {
            id: "reader".to_string(),
            secret_hash: bcrypt::hash(SECRET, 4).unwrap(),
            owner: "test".to_string(),
            scopes: ["chat:read".to_string()].into_iter().collect(),
            created_at: Utc::now(),
            expires_at: None,
        };
        Arc::new(AdmissionGate::new(
            ProxyTrust::default(),
            Arc::new(CredentialVerifier::from_records(vec![record])),
            Arc::new(RateLimiter::new(
                RatePolicy::parse("100/minute", 50).unwrap(),
                RatePolicy::parse("100/minute", 50).unwrap(),
            )),
            Arc::new(AbuseDetector::new(
                Denylist::in_memory(),
                AbusePolicy::default(),
            )),
        ))
    }

    async fn whoami(principal: axum::Extension<Principal>) -> String {
        principal.id.clone()
    }

    async fn failing() -> AppError {
        AppError::Generation("boom".to_string())
    }

    fn app(gate: Arc<AdmissionGate>) -> Router {
        Router::new()
            .route("/whoami", get(whoami))
            .route("/fail", get(failing))
            .route_layer(AdmissionLayer::protected(gate, "chat:read"))
    }

    fn request(uri: &str, header: Option<(&str, &str)>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_extract_credential_sources() {
        let bearer = request("/", Some(("authorization", "Bearer abc")));
        assert_eq!(
            extract_credential(&bearer),
            PresentedCredential::Secret("abc".to_string())
        );

        let lower = request("/", Some(("authorization", "bearer  abc ")));
        assert_eq!(
            extract_credential(&lower),
            PresentedCredential::Secret("abc".to_string())
        );

        let header = request("/", Some(("x-api-key", "xyz")));
        assert_eq!(
            extract_credential(&header),
            PresentedCredential::Secret("xyz".to_string())
        );

        let basic = request("/", Some(("authorization", "Basic Zm9v")));
        assert_eq!(extract_credential(&basic), PresentedCredential::None);
        assert_eq!(
            extract_credential(&request("/", None)),
            PresentedCredential::None
        );
    }

    #[tokio::test]
    async fn test_admitted_request_sees_principal() {
        let response = app(gate())
            .oneshot(request("/whoami", Some(("x-api-key", SECRET))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"reader");
    }

    #[tokio::test]
    async fn test_missing_credential_is_401() {
        let response = app(gate()).oneshot(request("/whoami", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()["www-authenticate"], "Bearer");
    }

    #[tokio::test]
    async fn test_handler_errors_are_tracked_with_kind() {
        let gate = gate();
        let response = app(gate.clone())
            .oneshot(request("/fail", Some(("authorization", "Bearer reader-secret"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let tracker = gate.abuse().tracker("key:reader").unwrap();
        assert_eq!(tracker.recent_errors.len(), 1);
        assert_eq!(
            tracker.violations.back().map(String::as_str),
            Some("generation_error")
        );
    }
}
