//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with defaults
//! suitable for local development. In production, configure via environment
//! variables or a `.env` file.
//!
//! # Security Configuration
//!
//! - `API_KEYS_FILE`: YAML credential store (default: `ops/api_keys.yaml`)
//! - `DENYLIST_FILE`: Persisted denylist (default: `ops/denylist.txt`)
//! - `TRUST_PROXY_HEADERS` / `TRUSTED_PROXY_COUNT`: `X-Forwarded-For` handling
//!
//! # Rate Limiting and Abuse Detection
//!
//! - `RATE_LIMIT_IP` / `BURST_IP`: Per-IP policy (default: `60/minute`, burst 10)
//! - `RATE_LIMIT_KEY` / `BURST_KEY`: Per-key policy (default: `120/minute`, burst 20)
//! - `ABUSE_THRESHOLD_ERRORS` / `ABUSE_WINDOW_SECONDS`: Block after N errors
//!   within the window (default: 5 in 30s)
//!
//! Rate strings are parsed here, so a malformed value fails startup rather
//! than individual requests.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::middleware::ip::ProxyTrust;
use crate::services::abuse::AbusePolicy;
use crate::services::rate_limiter::{Rate, RatePeriod, RatePolicy};
use crate::validation::ChatLimits;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Host address to bind the server to
    pub host: String,

    /// Port number for the HTTP server
    pub port: u16,

    // =========================================================================
    // Security Stores
    // =========================================================================
    /// Path of the YAML credential store
    pub api_keys_file: PathBuf,

    /// Path of the append-only denylist
    pub denylist_file: PathBuf,

    /// Trust `X-Forwarded-For` for client IP resolution
    pub trust_proxy_headers: bool,

    /// Number of trailing `X-Forwarded-For` entries appended by our proxies
    pub trusted_proxy_count: usize,

    // =========================================================================
    // Rate Limiting and Abuse Detection
    // =========================================================================
    /// Per-IP rate policy
    pub ip_rate: RatePolicy,

    /// Per-credential rate policy
    pub key_rate: RatePolicy,

    /// Errors within `abuse_window` that trigger a block
    pub abuse_threshold_errors: usize,

    /// Sliding window for abuse detection
    pub abuse_window: Duration,

    // =========================================================================
    // Request Limits
    // =========================================================================
    /// Maximum request body (and decoded image) size in megabytes
    pub max_body_mb: f64,

    /// Upper bound on `max_tokens`
    pub max_tokens_limit: u32,

    /// Images allowed per chat request
    pub max_images_per_request: usize,

    // =========================================================================
    // Inference Backend
    // =========================================================================
    /// Base URL of an OpenAI-compatible server; `None` serves 503s
    pub inference_upstream_url: Option<String>,

    /// Model id reported by `/health` and sent upstream
    pub model_id: String,

    /// Timeout for one downstream call
    pub downstream_timeout: Duration,

    // =========================================================================
    // Maintenance and Observability
    // =========================================================================
    /// Idle age after which limiter buckets and abuse trackers are evicted
    pub state_max_idle: Duration,

    /// Interval of the background eviction task
    pub cleanup_interval: Duration,

    /// Log level filter (default: info)
    pub log_level: String,

    /// Prometheus exporter port (0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if a variable cannot be parsed or the
    /// resulting configuration is invalid.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: Self::parse_env("PORT", 8000)?,

            // Security stores
            api_keys_file: env::var("API_KEYS_FILE")
                .unwrap_or_else(|_| "ops/api_keys.yaml".to_string())
                .into(),
            denylist_file: env::var("DENYLIST_FILE")
                .unwrap_or_else(|_| "ops/denylist.txt".to_string())
                .into(),
            trust_proxy_headers: Self::parse_bool_env("TRUST_PROXY_HEADERS", false)?,
            trusted_proxy_count: Self::parse_env("TRUSTED_PROXY_COUNT", 1)?,

            // Rate limiting and abuse detection
            ip_rate: Self::parse_rate_env("RATE_LIMIT_IP", "60/minute", "BURST_IP", 10)?,
            key_rate: Self::parse_rate_env("RATE_LIMIT_KEY", "120/minute", "BURST_KEY", 20)?,
            abuse_threshold_errors: Self::parse_env("ABUSE_THRESHOLD_ERRORS", 5)?,
            abuse_window: Duration::from_secs(Self::parse_env("ABUSE_WINDOW_SECONDS", 30)?),

            // Request limits
            max_body_mb: Self::parse_env("MAX_BODY_MB", 10.0)?,
            max_tokens_limit: Self::parse_env("MAX_TOKENS_LIMIT", 2048)?,
            max_images_per_request: Self::parse_env("MAX_IMAGES_PER_REQUEST", 1)?,

            // Inference backend
            inference_upstream_url: env::var("INFERENCE_UPSTREAM_URL")
                .ok()
                .filter(|u| !u.trim().is_empty()),
            model_id: env::var("MODEL_ID").unwrap_or_else(|_| "Hcompany/Holo1.5-7B".to_string()),
            downstream_timeout: Duration::from_secs(Self::parse_env(
                "DOWNSTREAM_TIMEOUT_SECS",
                120,
            )?),

            // Maintenance and observability
            state_max_idle: Duration::from_secs(Self::parse_env("STATE_MAX_IDLE_SECS", 3600)?),
            cleanup_interval: Duration::from_secs(Self::parse_env("CLEANUP_INTERVAL_SECS", 300)?),
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate cross-field constraints.
    fn validate(&self) -> AppResult<()> {
        if self.abuse_threshold_errors == 0 {
            return Err(AppError::ConfigError(
                "ABUSE_THRESHOLD_ERRORS must be greater than 0".to_string(),
            ));
        }

        if self.abuse_window.is_zero() {
            return Err(AppError::ConfigError(
                "ABUSE_WINDOW_SECONDS must be greater than 0".to_string(),
            ));
        }

        if !self.max_body_mb.is_finite() || self.max_body_mb <= 0.0 {
            return Err(AppError::ConfigError(format!(
                "MAX_BODY_MB must be a positive number, got {}",
                self.max_body_mb
            )));
        }

        if self.max_tokens_limit == 0 {
            return Err(AppError::ConfigError(
                "MAX_TOKENS_LIMIT must be greater than 0".to_string(),
            ));
        }

        if self.downstream_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "DOWNSTREAM_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        if self.cleanup_interval.is_zero() {
            return Err(AppError::ConfigError(
                "CLEANUP_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the server bind address as a string.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Request body limit in bytes.
    pub fn body_limit_bytes(&self) -> usize {
        (self.max_body_mb * 1024.0 * 1024.0) as usize
    }

    pub fn chat_limits(&self) -> ChatLimits {
        ChatLimits {
            max_tokens: self.max_tokens_limit,
            max_images: self.max_images_per_request,
            max_image_mb: self.max_body_mb,
        }
    }

    pub fn proxy_trust(&self) -> ProxyTrust {
        ProxyTrust::new(self.trust_proxy_headers, self.trusted_proxy_count)
    }

    pub fn abuse_policy(&self) -> AbusePolicy {
        AbusePolicy {
            threshold_errors: self.abuse_threshold_errors,
            window: self.abuse_window,
        }
    }

    /// Check if the Prometheus exporter is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the Prometheus exporter address.
    ///
    /// Returns `None` if metrics are disabled.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        if self.metrics_enabled() {
            Some(SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
        } else {
            None
        }
    }

    /// Parse an environment variable with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr + ToString,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    fn parse_bool_env(name: &str, default: bool) -> AppResult<bool> {
        match env::var(name) {
            Ok(val) => parse_bool(&val).ok_or_else(|| {
                AppError::ConfigError(format!("Invalid {name}: '{val}' is not a boolean"))
            }),
            Err(_) => Ok(default),
        }
    }

    /// Parse a `<count>/<period>` rate and its burst into a policy.
    fn parse_rate_env(
        rate_name: &str,
        rate_default: &str,
        burst_name: &str,
        burst_default: u32,
    ) -> AppResult<RatePolicy> {
        let rate = env::var(rate_name).unwrap_or_else(|_| rate_default.to_string());
        let burst = Self::parse_env(burst_name, burst_default)?;
        RatePolicy::parse(&rate, burst)
            .map_err(|e| AppError::ConfigError(format!("Invalid {rate_name}/{burst_name}: {e}")))
    }
}

/// Lenient boolean: `1/0`, `true/false`, `yes/no`, `on/off`.
fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Default configuration for development and testing.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "127.0.0.1".to_string(),
            port: 8000,
            // Security stores
            api_keys_file: PathBuf::from("ops/api_keys.yaml"),
            denylist_file: PathBuf::from("ops/denylist.txt"),
            trust_proxy_headers: false,
            trusted_proxy_count: 1,
            // Rate limiting and abuse detection
            ip_rate: RatePolicy {
                rate: Rate {
                    count: 60,
                    period: RatePeriod::Minute,
                },
                burst: 10,
            },
            key_rate: RatePolicy {
                rate: Rate {
                    count: 120,
                    period: RatePeriod::Minute,
                },
                burst: 20,
            },
            abuse_threshold_errors: 5,
            abuse_window: Duration::from_secs(30),
            // Request limits
            max_body_mb: 10.0,
            max_tokens_limit: 2048,
            max_images_per_request: 1,
            // Inference backend
            inference_upstream_url: None,
            model_id: "Hcompany/Holo1.5-7B".to_string(),
            downstream_timeout: Duration::from_secs(120),
            // Maintenance and observability
            state_max_idle: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
            log_level: "info".to_string(),
            metrics_port: 9090,
        }
    }
}
