//! Hashed API key verification.
//!
//! # Store Format
//!
//! Credentials are loaded from a YAML document:
//!
//! ```yaml
//! keys:
//!   - id: "team-core"
//!     hash: "$2b$12$..."            # bcrypt hash of the secret
//!     owner: "core@example.com"
//!     scopes: ["chat:read"]         # defaults to ["*"]
//!     created_at: "2025-01-01T00:00:00Z"
//!     expires_at: null              # or an ISO-8601 timestamp
//! ```
//!
//! `key_id` is accepted as an alias for `id`.
//!
//! # Verification
//!
//! A presented secret is compared with bcrypt against **every** record, so
//! response time does not reveal which record matched. Records whose hash
//! cannot be parsed are treated as non-matches. Expired records never verify.
//!
//! # Failure Policy
//!
//! A missing, unreadable or malformed store yields an empty table: every
//! authenticated request is rejected, but the process keeps running.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult};

/// Scope granting every permission.
pub const WILDCARD_SCOPE: &str = "*";

const DEFAULT_OWNER: &str = "unknown";

/// One loaded credential. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub id: String,
    pub secret_hash: String,
    pub owner: String,
    pub scopes: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    /// Whether the record is expired as of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires < now)
    }
}

/// Verified identity of one request. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub owner: String,
    pub scopes: BTreeSet<String>,
}

impl Principal {
    /// True if `scope` is granted directly or through the wildcard.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope) || self.scopes.contains(WILDCARD_SCOPE)
    }
}

impl From<&CredentialRecord> for Principal {
    fn from(record: &CredentialRecord) -> Self {
        Self {
            id: record.id.clone(),
            owner: record.owner.clone(),
            scopes: record.scopes.clone(),
        }
    }
}

// =============================================================================
// Store Parsing
// =============================================================================

#[derive(Debug, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    keys: Vec<RawRecord>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(alias = "key_id")]
    id: String,
    hash: String,
    owner: Option<String>,
    scopes: Option<Vec<String>>,
    created_at: Option<String>,
    expires_at: Option<String>,
}

impl TryFrom<RawRecord> for CredentialRecord {
    type Error = AppError;

    fn try_from(raw: RawRecord) -> AppResult<Self> {
        let created_at = match raw.created_at.as_deref() {
            Some(s) => parse_timestamp(s)?,
            None => default_created_at(),
        };
        let expires_at = raw
            .expires_at
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(parse_timestamp)
            .transpose()?;

        Ok(Self {
            id: raw.id,
            secret_hash: raw.hash,
            owner: raw.owner.unwrap_or_else(|| DEFAULT_OWNER.to_string()),
            scopes: raw
                .scopes
                .unwrap_or_else(|| vec![WILDCARD_SCOPE.to_string()])
                .into_iter()
                .collect(),
            created_at,
            expires_at,
        })
    }
}

fn default_created_at() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
}

/// Parse an ISO-8601 timestamp. Values without an offset are taken as UTC.
fn parse_timestamp(s: &str) -> AppResult<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        && let Some(naive) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(naive.and_utc());
    }
    Err(AppError::ConfigError(format!("invalid timestamp '{s}'")))
}

/// Parse a credential store document.
///
/// Duplicate ids keep the first record.
pub fn parse_credentials(yaml: &str) -> AppResult<Vec<CredentialRecord>> {
    if yaml.trim().is_empty() {
        return Ok(Vec::new());
    }
    let file: Option<CredentialFile> = serde_yaml::from_str(yaml)
        .map_err(|e| AppError::ConfigError(format!("malformed credential store: {e}")))?;
    // `keys:` with nothing after it, or a bare `~`
    let raw = file.map(|f| f.keys).unwrap_or_default();

    let mut records: Vec<CredentialRecord> = Vec::with_capacity(raw.len());
    for entry in raw {
        let record = CredentialRecord::try_from(entry)?;
        if records.iter().any(|r| r.id == record.id) {
            warn!(id = %record.id, "Duplicate credential id, keeping the first record");
            continue;
        }
        records.push(record);
    }
    Ok(records)
}

fn read_store(path: &Path) -> AppResult<Vec<CredentialRecord>> {
    let contents = fs::read_to_string(path).map_err(|e| {
        AppError::StoreUnavailable(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_credentials(&contents)
}

// =============================================================================
// Verification
// =============================================================================

/// Immutable snapshot of the loaded credentials.
#[derive(Debug, Default)]
pub struct CredentialTable {
    records: Vec<CredentialRecord>,
}

impl CredentialTable {
    pub fn new(records: Vec<CredentialRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Verify `secret` as of `now`.
    ///
    /// Every record is hashed against, even after a match. Returns the first
    /// matching record that is not expired.
    pub fn verify_at(&self, secret: &str, now: DateTime<Utc>) -> Option<Principal> {
        let mut found: Option<&CredentialRecord> = None;

        for record in &self.records {
            let matched = match bcrypt::verify(secret, &record.secret_hash) {
                Ok(matched) => matched,
                Err(e) => {
                    debug!(id = %record.id, error = %e, "Unusable credential hash, skipping");
                    false
                }
            };
            if !matched || found.is_some() {
                continue;
            }
            if record.is_expired_at(now) {
                debug!(id = %record.id, "Presented credential is expired");
                continue;
            }
            found = Some(record);
        }

        found.map(Principal::from)
    }
}

/// Loads the credential store and verifies presented secrets.
///
/// The table is swapped atomically on [`reload`](Self::reload); in-flight
/// verifications finish against the snapshot they started with.
pub struct CredentialVerifier {
    path: Option<PathBuf>,
    table: RwLock<Arc<CredentialTable>>,
}

impl CredentialVerifier {
    /// Load from `path`, degrading to an empty table on any failure.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let table = load_table(&path);
        Self {
            path: Some(path),
            table: RwLock::new(Arc::new(table)),
        }
    }

    /// Verifier over an in-memory table.
    pub fn from_records(records: Vec<CredentialRecord>) -> Self {
        Self {
            path: None,
            table: RwLock::new(Arc::new(CredentialTable::new(records))),
        }
    }

    /// Rebuild the table from the backing store. Returns the new record count.
    pub fn reload(&self) -> usize {
        let Some(path) = &self.path else {
            return self.len();
        };
        let table = Arc::new(load_table(path));
        let count = table.len();
        *self.table.write() = table;
        count
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    pub fn snapshot(&self) -> Arc<CredentialTable> {
        self.table.read().clone()
    }

    /// Verify on the calling thread.
    pub fn verify(&self, secret: &str) -> Option<Principal> {
        self.snapshot().verify_at(secret, Utc::now())
    }

    /// Verify on the blocking pool; bcrypt is deliberately slow.
    pub async fn verify_async(&self, secret: String) -> Option<Principal> {
        let table = self.snapshot();
        match tokio::task::spawn_blocking(move || table.verify_at(&secret, Utc::now())).await {
            Ok(principal) => principal,
            Err(e) => {
                error!(error = %e, "Credential verification task failed");
                None
            }
        }
    }
}

fn load_table(path: &Path) -> CredentialTable {
    match read_store(path) {
        Ok(records) => {
            if records.is_empty() {
                warn!(path = %path.display(), "No API keys found; all authenticated requests will be rejected");
            } else {
                info!(count = records.len(), path = %path.display(), "Loaded API keys");
            }
            CredentialTable::new(records)
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "Credential store unavailable; all authenticated requests will be rejected"
            );
            CredentialTable::default()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: &str, secret: &str, expires_at: Option<DateTime<Utc>>) -> CredentialRecord {
        CredentialRecord {
            id: id.to_string(),
            secret_hash: bcrypt::hash(secret, 4).unwrap(),
            owner: format!("{id}@example.com"),
            scopes: ["chat:read".to_string()].into_iter().collect(),
            created_at: Utc::now(),
            expires_at,
        }
    }

    #[test]
    fn test_has_scope() {
        let reader = Principal {
            id: "r".into(),
            owner: "o".into(),
            scopes: ["chat:read".to_string()].into_iter().collect(),
        };
        assert!(reader.has_scope("chat:read"));
        assert!(!reader.has_scope("*"));
        assert!(!reader.has_scope("chat:write"));

        let admin = Principal {
            scopes: ["*".to_string()].into_iter().collect(),
            ..reader
        };
        assert!(admin.has_scope("*"));
        assert!(admin.has_scope("chat:read"));
        assert!(admin.has_scope("anything"));
    }

    #[test]
    fn test_verify_matches_correct_secret() {
        let table = CredentialTable::new(vec![
            record("alpha", "alpha-secret", None),
            record("beta", "beta-secret", None),
        ]);

        let principal = table.verify_at("beta-secret", Utc::now()).unwrap();
        assert_eq!(principal.id, "beta");
        assert_eq!(principal.owner, "beta@example.com");
        assert!(table.verify_at("unknown-secret", Utc::now()).is_none());
    }

    #[test]
    fn test_expired_record_never_verifies() {
        let now = Utc::now();
        let table = CredentialTable::new(vec![record(
            "old",
            "old-secret",
            Some(now - Duration::days(1)),
        )]);
        assert!(table.verify_at("old-secret", now).is_none());
    }

    #[test]
    fn test_future_expiry_and_no_expiry_verify() {
        let now = Utc::now();
        let table = CredentialTable::new(vec![
            record("soon", "soon-secret", Some(now + Duration::days(1))),
            record("never", "never-secret", None),
        ]);
        assert!(table.verify_at("soon-secret", now).is_some());
        assert!(
            table
                .verify_at("never-secret", now + Duration::days(365 * 50))
                .is_some()
        );
    }

    #[test]
    fn test_expired_match_falls_through_to_valid_record() {
        let now = Utc::now();
        let table = CredentialTable::new(vec![
            record("rotated-out", "shared", Some(now - Duration::hours(1))),
            record("rotated-in", "shared", None),
        ]);
        assert_eq!(table.verify_at("shared", now).unwrap().id, "rotated-in");
    }

    #[test]
    fn test_malformed_hash_is_skipped() {
        let mut broken = record("broken", "x", None);
        broken.secret_hash = "not-a-bcrypt-hash".to_string();
        let table = CredentialTable::new(vec![broken, record("good", "good-secret", None)]);

        assert_eq!(table.verify_at("good-secret", Utc::now()).unwrap().id, "good");
        assert!(table.verify_at("x", Utc::now()).is_none());
    }

    #[test]
    fn test_parse_credentials_defaults() {
        let hash = bcrypt::hash("s", 4).unwrap();
        let yaml = format!(
            "keys:\n  - key_id: legacy\n    hash: \"{hash}\"\n  - id: modern\n    hash: \"{hash}\"\n    owner: ops@example.com\n    scopes: [\"chat:read\"]\n    created_at: \"2025-03-01T12:00:00Z\"\n    expires_at: \"2030-01-01\"\n"
        );
        let records = parse_credentials(&yaml).unwrap();
        assert_eq!(records.len(), 2);

        let legacy = &records[0];
        assert_eq!(legacy.id, "legacy");
        assert_eq!(legacy.owner, "unknown");
        assert!(legacy.scopes.contains("*"));
        assert!(legacy.expires_at.is_none());

        let modern = &records[1];
        assert_eq!(modern.owner, "ops@example.com");
        assert_eq!(modern.created_at.to_rfc3339(), "2025-03-01T12:00:00+00:00");
        assert_eq!(
            modern.expires_at.unwrap().to_rfc3339(),
            "2030-01-01T00:00:00+00:00"
        );
    }

    #[test]
    fn test_parse_credentials_duplicate_keeps_first() {
        let yaml = "keys:\n  - id: dup\n    hash: a\n    owner: first\n  - id: dup\n    hash: b\n    owner: second\n";
        let records = parse_credentials(yaml).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].owner, "first");
    }

    #[test]
    fn test_parse_credentials_malformed() {
        assert!(parse_credentials("keys: [").is_err());
        assert!(parse_credentials("keys:\n  - owner: missing-id\n").is_err());
        assert!(parse_credentials("keys:\n  - id: a\n    hash: b\n    expires_at: soon\n").is_err());
        assert!(parse_credentials("").unwrap().is_empty());
    }

    #[test]
    fn test_missing_store_yields_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = CredentialVerifier::load(dir.path().join("missing.yaml"));
        assert!(verifier.is_empty());
        assert!(verifier.verify("anything").is_none());
    }

    #[test]
    fn test_malformed_store_yields_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_keys.yaml");
        fs::write(&path, "keys: {not: [a list").unwrap();
        assert!(CredentialVerifier::load(&path).is_empty());
    }

    #[test]
    fn test_reload_picks_up_new_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_keys.yaml");
        fs::write(&path, "keys: []\n").unwrap();

        let verifier = CredentialVerifier::load(&path);
        assert!(verifier.verify("fresh").is_none());

        let hash = bcrypt::hash("fresh", 4).unwrap();
        fs::write(&path, format!("keys:\n  - id: fresh\n    hash: \"{hash}\"\n")).unwrap();
        assert_eq!(verifier.reload(), 1);
        assert_eq!(verifier.verify("fresh").unwrap().id, "fresh");
    }

    #[tokio::test]
    async fn test_verify_async() {
        let verifier = CredentialVerifier::from_records(vec![record("a", "a-secret", None)]);
        let principal = verifier.verify_async("a-secret".to_string()).await;
        assert_eq!(principal.map(|p| p.id), Some("a".to_string()));
        assert!(verifier.verify_async("nope".to_string()).await.is_none());
    }
}
