//! # Inference Gate
//!
//! Admission control in front of a vision-language model server, built on
//! Axum:
//!
//! - **Authentication**: bcrypt-hashed API keys with scopes and expiry,
//!   hot-reloaded on SIGHUP
//! - **Rate Limiting**: Independent per-IP and per-key token buckets
//! - **Abuse Detection**: Error bursts put an IP or key on a persistent denylist
//! - **Observability**: Request IDs, structured and audit logging, Prometheus
//!   metrics and an admin JSON summary
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Request ID → Trace → Access Log → Admission)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, chat completions, metrics)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  AdmissionGate (credentials, rate limiter, abuse detector)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  InferenceBackend (OpenAI-compatible upstream)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! use inference_gate::services::UnavailableBackend;
//! use inference_gate::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let backend = Arc::new(UnavailableBackend::new(config.model_id.clone()));
//!     let state = AppState::new(config.clone(), backend);
//!     let app = build_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind(config.server_addr()).await?;
//!     axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Rate Limits
//!
//! ```bash
//! RATE_LIMIT_IP=60/minute BURST_IP=10 RATE_LIMIT_KEY=120/minute BURST_KEY=20 cargo run
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod utils;
pub mod validation;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use routes::build_router;
pub use state::AppState;
