//! Threshold-triggered abuse detection.
//!
//! Every tracked request updates a per-entity [`AbuseTracker`]. An entity is
//! either a client IP (tracked under its literal string) or a credential
//! (tracked under `key:<id>`, see [`credential_entity`]).
//!
//! A response with status ≥ 400 is an error. After each error the detector
//! counts the entity's errors inside the trailing window; when the count
//! reaches the threshold the entity is blocked and appended to the
//! [`Denylist`]. Blocks are permanent for the life of the process.
//!
//! # Concurrency
//!
//! The tracker map and the denylist share one mutex. The denylist append
//! happens under that lock; it is rare (once per newly blocked entity) and
//! its failure never undoes the in-memory block.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use super::denylist::Denylist;
use crate::metrics;

/// Number of recent error timestamps retained per entity.
pub const RECENT_ERRORS_CAPACITY: usize = 100;

/// Number of recent violation kinds retained per entity.
pub const RECENT_VIOLATIONS_CAPACITY: usize = 100;

/// Entity identifier for a credential.
///
/// The prefix keeps a credential id from colliding with an IP string.
pub fn credential_entity(key_id: &str) -> String {
    format!("key:{key_id}")
}

/// Fixed-capacity ring of the most recent error timestamps.
#[derive(Debug, Clone)]
pub struct RecentErrors {
    slots: Vec<Instant>,
    next: usize,
    capacity: usize,
}

impl RecentErrors {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            next: 0,
            capacity: capacity.max(1),
        }
    }

    /// Record an error, overwriting the oldest once full.
    pub fn push(&mut self, at: Instant) {
        if self.slots.len() < self.capacity {
            self.slots.push(at);
        } else if let Some(slot) = self.slots.get_mut(self.next) {
            *slot = at;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    /// Errors no older than `window` as of `now`.
    pub fn count_within(&self, window: Duration, now: Instant) -> usize {
        self.slots
            .iter()
            .filter(|&&t| now.saturating_duration_since(t) <= window)
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Per-entity abuse state.
#[derive(Debug, Clone)]
pub struct AbuseTracker {
    pub recent_errors: RecentErrors,
    pub violations: VecDeque<String>,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub total_requests: u64,
    pub blocked: bool,
}

impl AbuseTracker {
    fn new(now: Instant) -> Self {
        Self {
            recent_errors: RecentErrors::with_capacity(RECENT_ERRORS_CAPACITY),
            violations: VecDeque::new(),
            first_seen: now,
            last_seen: now,
            total_requests: 0,
            blocked: false,
        }
    }

    fn record_violation(&mut self, kind: &str) {
        if self.violations.len() == RECENT_VIOLATIONS_CAPACITY {
            self.violations.pop_front();
        }
        self.violations.push_back(kind.to_string());
    }
}

/// One observed request outcome.
#[derive(Debug, Clone, Copy)]
pub struct AbuseContext<'a> {
    pub ip: &'a str,
    pub key_id: Option<&'a str>,
    pub status: u16,
    pub error_kind: Option<&'a str>,
}

impl<'a> AbuseContext<'a> {
    pub fn new(ip: &'a str, key_id: Option<&'a str>, status: u16) -> Self {
        Self {
            ip,
            key_id,
            status,
            error_kind: None,
        }
    }

    pub fn with_error_kind(mut self, kind: &'a str) -> Self {
        self.error_kind = Some(kind);
        self
    }

    pub fn is_error(&self) -> bool {
        self.status >= 400
    }
}

/// Threshold policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbusePolicy {
    pub threshold_errors: usize,
    pub window: Duration,
}

impl Default for AbusePolicy {
    fn default() -> Self {
        Self {
            threshold_errors: 5,
            window: Duration::from_secs(30),
        }
    }
}

/// Aggregate detector statistics.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AbuseStats {
    pub denied_count: usize,
    pub tracked_entities: usize,
    pub threshold_errors: usize,
    pub window_seconds: u64,
}

struct Inner {
    trackers: HashMap<String, AbuseTracker>,
    denylist: Denylist,
}

/// Detects and blocks abusive entities.
pub struct AbuseDetector {
    policy: AbusePolicy,
    inner: Mutex<Inner>,
}

impl AbuseDetector {
    pub fn new(denylist: Denylist, policy: AbusePolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Inner {
                trackers: HashMap::new(),
                denylist,
            }),
        }
    }

    /// Detector backed by the denylist file at `path`.
    pub fn open(path: impl Into<PathBuf>, policy: AbusePolicy) -> Self {
        Self::new(Denylist::load(path), policy)
    }

    pub fn policy(&self) -> AbusePolicy {
        self.policy
    }

    /// O(1) denylist membership.
    pub fn is_denied(&self, entity: &str) -> bool {
        self.inner.lock().denylist.contains(entity)
    }

    /// Pre-check for one entity: `true` if it may proceed.
    pub fn admit(&self, entity: &str) -> bool {
        !self.is_denied(entity)
    }

    /// Whether either the IP or the credential of `ctx` is denied.
    pub fn is_context_denied(&self, ctx: &AbuseContext<'_>) -> bool {
        let inner = self.inner.lock();
        inner.denylist.contains(ctx.ip)
            || ctx
                .key_id
                .is_some_and(|key| inner.denylist.contains(&credential_entity(key)))
    }

    /// Record an outcome for the IP and, if present, the credential.
    pub fn track(&self, ctx: &AbuseContext<'_>) {
        self.track_at(ctx, Instant::now());
    }

    pub fn track_at(&self, ctx: &AbuseContext<'_>, now: Instant) {
        let mut inner = self.inner.lock();
        self.track_entity(&mut inner, ctx.ip, ctx, now);
        if let Some(key) = ctx.key_id {
            self.track_entity(&mut inner, &credential_entity(key), ctx, now);
        }
    }

    /// Returns `true` when this outcome added `entity` to the denylist.
    fn track_entity(
        &self,
        inner: &mut Inner,
        entity: &str,
        ctx: &AbuseContext<'_>,
        now: Instant,
    ) -> bool {
        let tracker = inner
            .trackers
            .entry(entity.to_string())
            .or_insert_with(|| AbuseTracker::new(now));
        tracker.last_seen = now;
        tracker.total_requests += 1;

        if !ctx.is_error() {
            return false;
        }

        tracker.recent_errors.push(now);
        if let Some(kind) = ctx.error_kind {
            tracker.record_violation(kind);
        }

        let recent = tracker.recent_errors.count_within(self.policy.window, now);
        if recent < self.policy.threshold_errors || tracker.blocked {
            return false;
        }

        tracker.blocked = true;
        let reason = format!("{recent} errors in {}s", self.policy.window.as_secs());
        warn!(
            entity,
            reason = %reason,
            last_error = ctx.error_kind.unwrap_or("unclassified"),
            "Blocking entity for abuse"
        );
        // Entries loaded from the store are already counted
        let added = inner.denylist.insert_and_persist(entity, &reason);
        if added {
            metrics::record_denylist_addition(if entity.starts_with("key:") {
                "credential"
            } else {
                "ip"
            });
        }
        added
    }

    /// Drop idle, non-blocked trackers not seen within `max_age`.
    ///
    /// Blocked trackers are kept so the block history stays inspectable.
    pub fn evict_idle(&self, max_age: Duration) -> usize {
        self.evict_idle_at(max_age, Instant::now())
    }

    pub fn evict_idle_at(&self, max_age: Duration, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.trackers.len();
        inner.trackers.retain(|_, tracker| {
            tracker.blocked || now.saturating_duration_since(tracker.last_seen) <= max_age
        });
        before - inner.trackers.len()
    }

    pub fn stats(&self) -> AbuseStats {
        let inner = self.inner.lock();
        AbuseStats {
            denied_count: inner.denylist.len(),
            tracked_entities: inner.trackers.len(),
            threshold_errors: self.policy.threshold_errors,
            window_seconds: self.policy.window.as_secs(),
        }
    }

    /// Snapshot of one entity's tracker.
    pub fn tracker(&self, entity: &str) -> Option<AbuseTracker> {
        self.inner.lock().trackers.get(entity).cloned()
    }
}
