//! Shared application state for Axum handlers.
//!
//! This module provides thread-safe, clonable state that is shared across
//! all request handlers and middleware. It includes:
//!
//! - **Admission gate**: Credential verifier, rate limiter and abuse detector
//! - **Inference backend**: The model server requests are forwarded to
//! - **Request stats**: Rolling counters behind `GET /metrics`
//! - **Configuration**: Runtime configuration access
//!
//! # Structured Concurrency
//!
//! Background tasks are managed using `tokio_util::task::TaskTracker` and
//! `CancellationToken`. Call `shutdown()` to stop them before exit.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::Config;
use crate::metrics::RequestStats;
use crate::services::abuse::AbuseDetector;
use crate::services::credentials::CredentialVerifier;
use crate::services::gate::AdmissionGate;
use crate::services::inference::InferenceBackend;
use crate::services::rate_limiter::RateLimiter;

/// Shared application state for Axum handlers.
///
/// # Lifecycle
///
/// The idle-state cleanup task is spawned when the state is created:
///
/// ```rust,ignore
/// let state = AppState::new(config, backend);
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Admission decisions for every route
    pub gate: Arc<AdmissionGate>,
    /// Model server
    pub backend: Arc<dyn InferenceBackend>,
    /// Request counters and latency window
    pub stats: Arc<Mutex<RequestStats>>,
    /// Timestamp when the application started
    pub started_at: Instant,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build state from configuration, loading the credential store and
    /// denylist from the configured paths.
    ///
    /// Missing or unreadable stores are logged and treated as empty.
    pub fn new(config: Config, backend: Arc<dyn InferenceBackend>) -> Self {
        let verifier = Arc::new(CredentialVerifier::load(config.api_keys_file.clone()));
        let limiter = Arc::new(RateLimiter::new(config.ip_rate, config.key_rate));
        let abuse = Arc::new(AbuseDetector::open(
            config.denylist_file.clone(),
            config.abuse_policy(),
        ));
        let gate = Arc::new(AdmissionGate::new(
            config.proxy_trust(),
            verifier,
            limiter,
            abuse,
        ));

        Self::with_gate(config, gate, backend)
    }

    /// Build state around an already assembled gate.
    pub fn with_gate(
        config: Config,
        gate: Arc<AdmissionGate>,
        backend: Arc<dyn InferenceBackend>,
    ) -> Self {
        let state = Self {
            config: Arc::new(config),
            gate,
            backend,
            stats: Arc::new(Mutex::new(RequestStats::default())),
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_cleanup_task();

        state
    }

    /// Spawn the idle-state eviction task.
    ///
    /// Holds only the gate, not the whole state.
    fn spawn_cleanup_task(&self) {
        let gate = Arc::clone(&self.gate);
        let every = self.config.cleanup_interval;
        let max_idle = self.config.state_max_idle;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(every);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Cleanup task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let (buckets, trackers) = gate.evict_idle(max_idle);
                        if buckets > 0 || trackers > 0 {
                            debug!(buckets, trackers, "Evicted idle limiter and abuse state");
                        }
                    }
                }
            }

            debug!("Cleanup task shutting down");
        });
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
