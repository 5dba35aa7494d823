//! On-disk metadata documents for cached artifacts
//!
//! Each body file has a sidecar `.meta` JSON, and the cache directory
//! carries one `cache_versions.json` ledger mapping filename → current
//! version. Both are written atomically (temp + rename) so concurrent
//! readers never observe partial state.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

/// Ledger document name inside the cache directory.
pub const LEDGER_FILE: &str = "cache_versions.json";

/// Sidecar metadata for one cached body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub url: String,
    pub cached_at: DateTime<Utc>,
    pub size: u64,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl ArtifactMeta {
    /// Age of the artifact relative to now.
    #[must_use]
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.cached_at
    }
}

/// One row of the version-tracking ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub version: String,
    pub url: String,
    pub updated_at: DateTime<Utc>,
}

/// Filename → current-version mapping, persisted alongside the cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionLedger {
    #[serde(default)]
    entries: BTreeMap<String, LedgerEntry>,
}

impl VersionLedger {
    /// Load the ledger, treating a missing file as empty.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("corrupt ledger at {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading ledger at {}", path.display())),
        }
    }

    /// Persist atomically next to the cache objects.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .context("ledger path has no parent directory")?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).context("creating ledger temp file")?;
        serde_json::to_writer_pretty(&mut tmp, self).context("serializing ledger")?;
        tmp.flush().context("flushing ledger temp file")?;
        tmp.persist(path)
            .with_context(|| format!("replacing ledger at {}", path.display()))?;
        Ok(())
    }

    #[must_use]
    pub fn version_of(&self, filename: &str) -> Option<&str> {
        self.entries.get(filename).map(|e| e.version.as_str())
    }

    #[must_use]
    pub fn entry(&self, filename: &str) -> Option<&LedgerEntry> {
        self.entries.get(filename)
    }

    /// Record `version` as current for `filename`. Returns the previous
    /// version when the update displaced one.
    pub fn track(&mut self, filename: &str, version: &str, url: &str) -> Option<String> {
        let previous = self
            .entries
            .get(filename)
            .filter(|e| e.version != version)
            .map(|e| e.version.clone());
        self.entries.insert(
            filename.to_string(),
            LedgerEntry {
                version: version.to_string(),
                url: url.to_string(),
                updated_at: Utc::now(),
            },
        );
        previous
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
