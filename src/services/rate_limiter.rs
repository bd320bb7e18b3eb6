//! Dual-scope token bucket rate limiting.
//!
//! # Algorithm
//!
//! Each entity owns a continuous token bucket. On every check the bucket is
//! refilled by `elapsed * rate` (capped at capacity) and one token is
//! consumed if available. A fresh entity starts with a full bucket, so its
//! first `burst` requests are always admitted.
//!
//! # Scopes
//!
//! Two independent policies are enforced:
//!
//! - [`LimitScope::Ip`] keyed by the resolved client IP
//! - [`LimitScope::Credential`] keyed by the verified credential id
//!
//! # Configuration
//!
//! Rates are written as `"<count>/<period>"` (`"60/minute"`, `"10/s"`,
//! `"1000/hour"`) and parsed once at configuration time. A malformed string
//! is a [`RateLimitError`], never a per-request failure.
//!
//! # Concurrency
//!
//! Both bucket maps sit behind one mutex. Lookup, lazy creation,
//! refill-then-consume and idle eviction all take that lock, so a bucket is
//! never evicted while it is being refilled. Critical sections are pure
//! arithmetic.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

/// Error type for rate limit configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// The string is not `<count>/<period>`.
    #[error("invalid rate limit format '{0}', expected '<count>/<period>'")]
    Malformed(String),

    /// The period is not second, minute or hour.
    #[error("unknown rate limit period '{0}'")]
    UnknownPeriod(String),

    /// A zero count would never refill.
    #[error("rate limit count must be greater than 0")]
    ZeroCount,

    /// A zero burst would reject every request.
    #[error("burst must be greater than 0")]
    ZeroBurst,
}

/// Period of a rate string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatePeriod {
    Second,
    Minute,
    Hour,
}

impl RatePeriod {
    fn seconds(self) -> f64 {
        match self {
            RatePeriod::Second => 1.0,
            RatePeriod::Minute => 60.0,
            RatePeriod::Hour => 3600.0,
        }
    }
}

impl FromStr for RatePeriod {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "secs" | "second" | "seconds" => Ok(RatePeriod::Second),
            "m" | "min" | "mins" | "minute" | "minutes" => Ok(RatePeriod::Minute),
            "h" | "hr" | "hour" | "hours" => Ok(RatePeriod::Hour),
            other => Err(RateLimitError::UnknownPeriod(other.to_string())),
        }
    }
}

impl fmt::Display for RatePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RatePeriod::Second => "second",
            RatePeriod::Minute => "minute",
            RatePeriod::Hour => "hour",
        })
    }
}

/// A parsed `"<count>/<period>"` rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    pub count: u32,
    pub period: RatePeriod,
}

impl Rate {
    /// Tokens added per second.
    pub fn per_second(&self) -> f64 {
        f64::from(self.count) / self.period.seconds()
    }

    /// Requests per minute, rounded up so a slow rate never reports 0.
    pub fn per_minute(&self) -> u32 {
        match self.period {
            RatePeriod::Second => self.count.saturating_mul(60),
            RatePeriod::Minute => self.count,
            RatePeriod::Hour => self.count.div_ceil(60),
        }
    }
}

impl FromStr for Rate {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, period) = s
            .split_once('/')
            .ok_or_else(|| RateLimitError::Malformed(s.to_string()))?;
        let count: u32 = count
            .trim()
            .parse()
            .map_err(|_| RateLimitError::Malformed(s.to_string()))?;
        if count == 0 {
            return Err(RateLimitError::ZeroCount);
        }
        Ok(Self {
            count,
            period: period.parse()?,
        })
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.count, self.period)
    }
}

/// Rate plus burst capacity for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub rate: Rate,
    pub burst: u32,
}

impl RatePolicy {
    /// Build a policy, rejecting a zero burst.
    pub fn new(rate: Rate, burst: u32) -> Result<Self, RateLimitError> {
        if burst == 0 {
            return Err(RateLimitError::ZeroBurst);
        }
        Ok(Self { rate, burst })
    }

    /// Parse a rate string and attach a burst capacity.
    pub fn parse(rate: &str, burst: u32) -> Result<Self, RateLimitError> {
        Self::new(rate.parse()?, burst)
    }
}

impl fmt::Display for RatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} burst {}", self.rate, self.burst)
    }
}

/// Which of the two independent policies a check runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitScope {
    Ip,
    Credential,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitScope::Ip => "IP",
            LimitScope::Credential => "API key",
        }
    }
}

/// Per-entity rate state.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: f64::from(capacity),
            last_refill: now,
        }
    }

    /// Refill for the time elapsed since the last check, then try to take one token.
    pub fn try_consume(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(f64::from(self.capacity));
        // A stale `now` must not move the refill origin backwards
        self.last_refill = self.last_refill.max(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole seconds until one token is available, at least 1.
    pub fn retry_after_secs(&self) -> u64 {
        let needed = (1.0 - self.tokens).max(0.0);
        let secs = (needed / self.refill_rate).ceil();
        // `as` saturates on overflow and NaN
        (secs as u64).max(1)
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }
}

/// Outcome of a single rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Seconds to wait before retrying; 0 when allowed.
    pub retry_after_secs: u64,
    /// Whole tokens left after this check.
    pub remaining: u32,
    /// Sustained rate in requests per minute, for `X-RateLimit-Limit`.
    pub limit: u32,
}

#[derive(Default)]
struct Buckets {
    ip: HashMap<String, TokenBucket>,
    credential: HashMap<String, TokenBucket>,
}

impl Buckets {
    fn map_mut(&mut self, scope: LimitScope) -> &mut HashMap<String, TokenBucket> {
        match scope {
            LimitScope::Ip => &mut self.ip,
            LimitScope::Credential => &mut self.credential,
        }
    }
}

/// Thread-safe rate limiter with separate IP and credential policies.
pub struct RateLimiter {
    ip_policy: RatePolicy,
    credential_policy: RatePolicy,
    buckets: Mutex<Buckets>,
}

impl RateLimiter {
    pub fn new(ip_policy: RatePolicy, credential_policy: RatePolicy) -> Self {
        Self {
            ip_policy,
            credential_policy,
            buckets: Mutex::new(Buckets::default()),
        }
    }

    pub fn policy(&self, scope: LimitScope) -> RatePolicy {
        match scope {
            LimitScope::Ip => self.ip_policy,
            LimitScope::Credential => self.credential_policy,
        }
    }

    /// Check and consume one token for `entity` under `scope`'s policy.
    pub fn check(&self, scope: LimitScope, entity: &str) -> RateDecision {
        self.check_at(scope, entity, Instant::now())
    }

    /// [`check`](Self::check) against an explicit clock reading.
    pub fn check_at(&self, scope: LimitScope, entity: &str, now: Instant) -> RateDecision {
        let policy = self.policy(scope);
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .map_mut(scope)
            .entry(entity.to_string())
            .or_insert_with(|| TokenBucket::new(policy.burst, policy.rate.per_second(), now));

        let allowed = bucket.try_consume(now);
        RateDecision {
            allowed,
            retry_after_secs: if allowed {
                0
            } else {
                bucket.retry_after_secs()
            },
            // Token counts are bounded by capacity, so the cast is lossless
            remaining: bucket.tokens().floor() as u32,
            limit: policy.rate.per_minute(),
        }
    }

    /// Drop buckets whose last check is older than `max_age`.
    ///
    /// Returns the number of evicted buckets across both scopes.
    pub fn evict_idle(&self, max_age: Duration) -> usize {
        self.evict_idle_at(max_age, Instant::now())
    }

    pub fn evict_idle_at(&self, max_age: Duration, now: Instant) -> usize {
        let mut buckets = self.buckets.lock();
        let mut evicted = 0;
        for scope in [LimitScope::Ip, LimitScope::Credential] {
            let map = buckets.map_mut(scope);
            let before = map.len();
            map.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill()) <= max_age);
            evicted += before - map.len();
        }
        if evicted > 0 {
            debug!(evicted, "Evicted idle rate limit buckets");
        }
        evicted
    }

    /// Number of live buckets per scope: `(ip, credential)`.
    pub fn bucket_counts(&self) -> (usize, usize) {
        let buckets = self.buckets.lock();
        (buckets.ip.len(), buckets.credential.len())
    }

    /// Snapshot of one entity's bucket, if it exists.
    pub fn bucket(&self, scope: LimitScope, entity: &str) -> Option<TokenBucket> {
        let mut buckets = self.buckets.lock();
        buckets.map_mut(scope).get(entity).cloned()
    }
}
