//! Admission services and the inference backend.
//!
//! - [`credentials`]: API key store and bcrypt verification
//! - [`rate_limiter`]: Per-IP and per-credential token buckets
//! - [`denylist`] / [`abuse`]: Persistent blocks driven by error bursts
//! - [`gate`]: Sequences the checks above for each request
//! - [`inference`]: Downstream model server

pub mod abuse;
pub mod credentials;
pub mod denylist;
pub mod gate;
pub mod inference;
pub mod rate_limiter;

pub use abuse::{AbuseDetector, AbusePolicy, AbuseStats};
pub use credentials::{CredentialVerifier, Principal};
pub use gate::{AdmissionGate, PresentedCredential, RouteAccess};
pub use inference::{InferenceBackend, UnavailableBackend, UpstreamBackend};
pub use rate_limiter::{RateLimiter, RatePolicy};
