//! Admission gate: one allow/deny decision per request.
//!
//! # Order of Checks
//!
//! For a protected route:
//!
//! 1. IP on the denylist → 403
//! 2. Credential verification → 401 if absent, invalid or expired
//! 3. Verified credential on the denylist → 403
//! 4. IP rate limit → 429
//! 5. Credential rate limit → 429
//! 6. Scope check → 403
//!
//! Public routes run steps 1 and 4 only. The credential denylist check
//! runs before any rate budget is spent, so a blocked key sees 403 rather
//! than 429.
//!
//! After the downstream call the outcome is recorded through an
//! [`OutcomeGuard`]; a guard dropped without being finished records the
//! request as cancelled.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::abuse::{AbuseContext, AbuseDetector, credential_entity};
use super::credentials::{CredentialVerifier, Principal};
use super::rate_limiter::{LimitScope, RateLimiter};
use crate::error::{AppError, AppResult, ErrorKind};
use crate::metrics;
use crate::middleware::ip::ProxyTrust;

/// Status recorded for requests abandoned by the client.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Access requirement of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAccess {
    Public,
    Protected { scope: &'static str },
}

/// Credential material presented with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentedCredential {
    None,
    Secret(String),
}

/// Sequences denylist, verification, rate limiting and scope checks.
pub struct AdmissionGate {
    proxy_trust: ProxyTrust,
    verifier: Arc<CredentialVerifier>,
    limiter: Arc<RateLimiter>,
    abuse: Arc<AbuseDetector>,
}

impl AdmissionGate {
    pub fn new(
        proxy_trust: ProxyTrust,
        verifier: Arc<CredentialVerifier>,
        limiter: Arc<RateLimiter>,
        abuse: Arc<AbuseDetector>,
    ) -> Self {
        Self {
            proxy_trust,
            verifier,
            limiter,
            abuse,
        }
    }

    pub fn proxy_trust(&self) -> ProxyTrust {
        self.proxy_trust
    }

    pub fn verifier(&self) -> &Arc<CredentialVerifier> {
        &self.verifier
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn abuse(&self) -> &Arc<AbuseDetector> {
        &self.abuse
    }

    /// Decide whether a request from `ip` may proceed.
    ///
    /// Returns the verified principal for protected routes, `None` for
    /// public ones.
    pub async fn admit(
        &self,
        ip: &str,
        credential: PresentedCredential,
        access: RouteAccess,
    ) -> AppResult<Option<Principal>> {
        if !self.abuse.admit(ip) {
            metrics::record_rejection("denied_ip");
            return Err(AppError::Denied("Access denied".to_string()));
        }

        let RouteAccess::Protected { scope } = access else {
            self.check_rate(LimitScope::Ip, ip)?;
            return Ok(None);
        };

        let principal = match credential {
            PresentedCredential::Secret(secret) => match self.verifier.verify_async(secret).await {
                Some(principal) => principal,
                None => return Err(self.reject_unauthenticated(ip, "Invalid or expired API key")),
            },
            PresentedCredential::None => {
                return Err(self.reject_unauthenticated(ip, "Missing API key"));
            }
        };
        self.check_credential_denied(&principal)?;

        self.check_rate(LimitScope::Ip, ip)?;
        self.check_rate(LimitScope::Credential, &principal.id)?;

        if !principal.has_scope(scope) {
            metrics::record_rejection("insufficient_scope");
            debug!(key_id = %principal.id, required = scope, "Insufficient scope");
            return Err(AppError::InsufficientScope(format!(
                "API key lacks required scope '{scope}'"
            )));
        }

        Ok(Some(principal))
    }

    /// Feed a completed request's outcome into abuse detection.
    pub fn record_outcome(&self, ip: &str, key_id: Option<&str>, status: u16, kind: Option<ErrorKind>) {
        let ctx = AbuseContext::new(ip, key_id, status);
        let ctx = match kind {
            Some(kind) => ctx.with_error_kind(kind.as_str()),
            None => ctx,
        };
        self.abuse.track(&ctx);

        if ctx.is_error() && self.abuse.is_context_denied(&ctx) {
            // The triggering request is still served; the next one is rejected.
            warn!(ip, key_id = ?key_id, status, "Request crossed the abuse threshold");
        }
    }

    /// Start recording the outcome of an admitted request.
    pub fn outcome_guard(self: &Arc<Self>, ip: String, key_id: Option<String>) -> OutcomeGuard {
        OutcomeGuard {
            gate: Arc::clone(self),
            ip,
            key_id,
            finished: false,
        }
    }

    /// Evict idle limiter buckets and abuse trackers. Returns the eviction counts.
    pub fn evict_idle(&self, max_age: Duration) -> (usize, usize) {
        let buckets = self.limiter.evict_idle(max_age);
        let trackers = self.abuse.evict_idle(max_age);

        let (ip_buckets, credential_buckets) = self.limiter.bucket_counts();
        metrics::set_rate_limit_buckets(ip_buckets, credential_buckets);
        let stats = self.abuse.stats();
        metrics::set_abuse_gauges(stats.tracked_entities, stats.denied_count);

        (buckets, trackers)
    }

    fn check_credential_denied(&self, principal: &Principal) -> AppResult<()> {
        if !self.abuse.admit(&credential_entity(&principal.id)) {
            metrics::record_rejection("denied_credential");
            return Err(AppError::Denied("API key is blocked".to_string()));
        }
        Ok(())
    }

    fn check_rate(&self, scope: LimitScope, entity: &str) -> AppResult<()> {
        let decision = self.limiter.check(scope, entity);
        if decision.allowed {
            return Ok(());
        }

        metrics::record_rejection(match scope {
            LimitScope::Ip => "rate_limited_ip",
            LimitScope::Credential => "rate_limited_credential",
        });
        Err(AppError::RateLimited {
            scope: scope.as_str(),
            retry_after: decision.retry_after_secs,
            limit: decision.limit,
        })
    }

    fn reject_unauthenticated(&self, ip: &str, message: &str) -> AppError {
        metrics::record_rejection("unauthenticated");
        self.record_outcome(ip, None, 401, Some(ErrorKind::Unauthenticated));
        AppError::Unauthenticated(message.to_string())
    }
}

/// Records a request's outcome exactly once.
///
/// Call [`finish`](Self::finish) with the final status. If the request
/// future is dropped first, the drop records a cancellation instead.
#[must_use = "dropping the guard records the request as cancelled"]
pub struct OutcomeGuard {
    gate: Arc<AdmissionGate>,
    ip: String,
    key_id: Option<String>,
    finished: bool,
}

impl OutcomeGuard {
    pub fn finish(mut self, status: u16, kind: Option<ErrorKind>) {
        self.finished = true;
        self.gate
            .record_outcome(&self.ip, self.key_id.as_deref(), status, kind);
    }
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(ip = %self.ip, key_id = ?self.key_id, "Request cancelled before completion");
        self.gate.record_outcome(
            &self.ip,
            self.key_id.as_deref(),
            CLIENT_CLOSED_REQUEST,
            Some(ErrorKind::Cancelled),
        );
    }
}
