//! Per-request access logging and audit events.
//!
//! Every completed request produces one `info` line with method, route,
//! status, latency, client IP and key id, and is folded into the in-process
//! [`RequestStats`] and the Prometheus request metrics.
//!
//! Security-relevant rejections (401, 403, 413, 415, 429) additionally emit a
//! `warn` event on the `audit` target, so they can be routed separately:
//!
//! ```bash
//! RUST_LOG=info,audit=warn
//! ```

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{Request, Response, StatusCode};
use parking_lot::Mutex;
use tower::{Layer, Service};
use tracing::{info, warn};

use super::ip::{ProxyTrust, client_ip_from_request};
use super::request_id::RequestIdExt;
use crate::error::ErrorKind;
use crate::services::credentials::Principal;
use crate::metrics::{self, RequestStats};

/// Route label for requests that matched no route.
const UNMATCHED_ROUTE: &str = "unmatched";

/// Whether `status` is logged on the `audit` target.
pub fn is_audited(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::PAYLOAD_TOO_LARGE
            | StatusCode::UNSUPPORTED_MEDIA_TYPE
            | StatusCode::TOO_MANY_REQUESTS
    )
}

/// Access log layer.
#[derive(Clone)]
pub struct AccessLogLayer {
    stats: Arc<Mutex<RequestStats>>,
    proxy_trust: ProxyTrust,
}

impl AccessLogLayer {
    pub fn new(stats: Arc<Mutex<RequestStats>>, proxy_trust: ProxyTrust) -> Self {
        Self { stats, proxy_trust }
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService {
            inner,
            stats: self.stats.clone(),
            proxy_trust: self.proxy_trust,
        }
    }
}

/// Access log service wrapper.
#[derive(Clone)]
pub struct AccessLogService<S> {
    inner: S,
    stats: Arc<Mutex<RequestStats>>,
    proxy_trust: ProxyTrust,
}

impl<S> Service<Request<Body>> for AccessLogService<S>
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

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let route = req
            .extensions()
            .get::<MatchedPath>()
            .map_or_else(|| UNMATCHED_ROUTE.to_string(), |p| p.as_str().to_string());
        let request_id = req
            .request_id()
            .map_or_else(|| "-".to_string(), ToString::to_string);
        let client_ip = client_ip_from_request(&req, self.proxy_trust);
        let stats = self.stats.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let response = inner.call(req).await?;

            let status = response.status();
            let elapsed = start.elapsed();
            let latency_ms = elapsed.as_secs_f64() * 1000.0;

            stats.lock().record(status.as_u16(), latency_ms);
            metrics::record_request(&route, status.as_u16());
            metrics::record_request_duration(
                &route,
                method.as_str(),
                status.as_str(),
                elapsed.as_secs_f64(),
            );

            let key_id = response
                .extensions()
                .get::<Principal>()
                .map_or("-", |principal| principal.id.as_str());

            info!(
                method = %method,
                path = %path,
                status = status.as_u16(),
                latency_ms = format_args!("{latency_ms:.2}"),
                client_ip = %client_ip,
                key_id = %key_id,
                request_id = %request_id,
                "Request completed"
            );
            if is_audited(status) {
                let reason = response.extensions().get::<ErrorKind>().map_or_else(
                    || status.canonical_reason().unwrap_or("rejected"),
                    |kind| kind.as_str(),
                );
                warn!(
                    target: "audit",
                    method = %method,
                    path = %path,
                    status = status.as_u16(),
                    client_ip = %client_ip,
                    key_id = %key_id,
                    request_id = %request_id,
                    reason,
                    "Security-relevant rejection"
                );
            }

            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;
    use tower::ServiceExt;

    #[test]
    fn test_audited_statuses() {
        for code in [401, 403, 413, 415, 429] {
            assert!(is_audited(StatusCode::from_u16(code).unwrap()), "{code}");
        }
        for code in [200, 400, 404, 500, 503, 504] {
            assert!(!is_audited(StatusCode::from_u16(code).unwrap()), "{code}");
        }
    }

    #[tokio::test]
    async fn test_requests_feed_stats() {
        let stats = Arc::new(Mutex::new(RequestStats::default()));
        let app = Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route("/denied", get(|| async { StatusCode::FORBIDDEN }))
            .layer(AccessLogLayer::new(stats.clone(), ProxyTrust::default()));

        for uri in ["/ok", "/ok", "/denied"] {
            app.clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
        }

        let summary = stats.lock().summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.success, 2);
        assert_eq!(summary.client_errors, 1);
    }
}
