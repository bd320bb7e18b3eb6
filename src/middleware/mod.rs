//! HTTP middleware for admission, request correlation and access logging.
//!
//! # Architecture
//!
//! ```text
//! Request → Request ID → Trace → Access Log → Admission → Handler → Response
//!               ↓                     ↓            ↓
//!         X-Request-Id header    audit events   401 / 403 / 429
//! ```
//!
//! Admission is applied per route; the other layers wrap the whole router.

pub mod access_log;
pub mod admission;
pub mod ip;
pub mod request_id;

pub use access_log::AccessLogLayer;
pub use admission::{API_KEY_HEADER, AdmissionLayer};
pub use ip::{ClientIp, ProxyTrust, resolve_client_ip};
pub use request_id::{REQUEST_ID_HEADER, RequestId, RequestIdLayer, request_span};
