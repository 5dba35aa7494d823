//! Two-level script cache keyed by filename + version token
//!
//! The upstream surface ships multi-megabyte JS bundles whose URLs embed
//! a build identifier in the parent path segment. Caching by filename
//! alone risks serving stale bundles; caching by full URL wastes
//! capacity. This module keys on the (filename, version) pair and tracks
//! current versions in a persisted ledger.

pub mod meta;
pub mod store;
pub mod version;

pub use meta::{ArtifactMeta, LEDGER_FILE, LedgerEntry, VersionLedger};
pub use store::{ArtifactStatus, CacheOptions, CachedArtifact, ScriptCache};
pub use version::{KeyError, VersionedKey, filename_of, versioned_key};
