//! Persisted denylist of blocked entities.
//!
//! The backing store is a plain-text file with one entity identifier per
//! line. Blank lines are ignored, as is a `#` that starts a line or follows
//! whitespace and everything after it. Entries written by
//! [`Denylist::insert_and_persist`] (`<id>  # Blocked: <reason> at <time>`)
//! load back as `<id>`, and a `#` inside an identifier (`key:team#1`) is kept.
//!
//! The file is append-only from this process's point of view. Entries are
//! removed by editing the file out-of-band and restarting.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};

/// In-memory denylist with an optional append-only backing file.
#[derive(Debug, Default)]
pub struct Denylist {
    path: Option<PathBuf>,
    entries: HashSet<String>,
}

impl Denylist {
    /// Denylist with no backing file.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the denylist from `path`.
    ///
    /// A missing file is created empty (with parent directories). Any other
    /// I/O failure is logged and the process starts with an empty list:
    /// nothing previously blocked is enforced, but new blocks still apply.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match read_entries(&path) {
            Ok(entries) => {
                if !entries.is_empty() {
                    info!(count = entries.len(), path = %path.display(), "Loaded denylist entries");
                }
                entries
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Err(e) = create_empty(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to create denylist file");
                }
                HashSet::new()
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Denylist store unavailable, starting with an empty denylist"
                );
                HashSet::new()
            }
        };

        Self {
            path: Some(path),
            entries,
        }
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.entries.contains(entity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Add `entity` and append it to the backing file.
    ///
    /// The in-memory insert always happens. A failed append is logged and
    /// otherwise ignored. Returns `false` if the entity was already present,
    /// in which case nothing is written.
    pub fn insert_and_persist(&mut self, entity: &str, reason: &str) -> bool {
        if !self.entries.insert(entity.to_string()) {
            return false;
        }

        if let Some(path) = &self.path {
            match append_entry(path, entity, reason) {
                Ok(()) => info!(entity, reason, "Added to denylist"),
                Err(e) => warn!(
                    entity,
                    path = %path.display(),
                    error = %e,
                    "Failed to persist denylist entry; block applies to this process only"
                ),
            }
        }
        true
    }
}

/// Parse one denylist line into an entity identifier.
fn parse_line(line: &str) -> Option<&str> {
    let line = line.trim();
    let comment = line
        .char_indices()
        .find(|&(i, c)| {
            c == '#'
                && line
                    .get(..i)
                    .and_then(|before| before.chars().next_back())
                    .is_none_or(char::is_whitespace)
        })
        .map_or(line.len(), |(i, _)| i);
    let entry = line.get(..comment).unwrap_or_default().trim_end();
    (!entry.is_empty()).then_some(entry)
}

fn read_entries(path: &Path) -> io::Result<HashSet<String>> {
    let contents = fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .filter_map(parse_line)
        .map(str::to_string)
        .collect())
}

fn create_empty(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}

fn append_entry(path: &Path, entity: &str, reason: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    writeln!(file, "{entity}  # Blocked: {reason} at {timestamp}")
}
