//! Core configuration types for scraping runs
//!
//! This module contains the main `ScrapeConfig` struct and its associated
//! types that define the parameters for a worker-fleet run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Cache validation strategy for the two-level script cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Invalid when the version changed OR the artifact exceeded max-age
    AgeAndVersion,
    /// Invalid only when the version changed
    VersionOnly,
    /// Invalid only on age exceedance
    AgeOnly,
    /// Never a hit
    AlwaysRevalidate,
}

/// Main configuration struct for a scraping run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    /// Origin of the transparency surface. Every creative URL, RPC call,
    /// and referer header derives from this.
    pub(crate) surface_origin: String,

    /// Directory holding the L2 script cache and version ledger.
    ///
    /// **INVARIANT:** Always an absolute path (normalized in builder).
    pub(crate) cache_dir: PathBuf,

    pub(crate) workers: usize,
    pub(crate) batch_size: usize,

    /// Total processing cap across the run (`--max-urls`). None = drain
    /// the queue.
    pub(crate) max_urls: Option<u64>,

    pub(crate) proxy_enabled: bool,

    /// Partial-proxy mode: authenticated traffic traverses the proxy,
    /// cacheable CDN scripts are fetched through a direct client.
    pub(crate) partial_proxy: bool,

    /// Re-acquire proxy credentials between batches.
    pub(crate) proxy_rotation: bool,

    pub(crate) headless: bool,

    /// When set, captured payloads are dumped here for postmortems.
    /// Raw HTML/JS is never persisted otherwise.
    pub(crate) debug_dump_dir: Option<PathBuf>,

    pub(crate) page_load_timeout_secs: u64,
    pub(crate) script_fetch_timeout_secs: u64,

    pub(crate) cache_memory_bytes: u64,
    pub(crate) cache_max_age_secs: u64,
    pub(crate) cache_strategy: CacheStrategy,

    pub(crate) proxy_max_attempts: u32,

    pub(crate) blocked_url_patterns: Vec<String>,
    pub(crate) cacheable_script_patterns: Vec<String>,

    /// Compiled forms of the pattern lists above.
    /// Pre-compiled at config creation to avoid hot-path regex compilation.
    #[serde(skip)]
    pub(crate) blocked_patterns_compiled: Vec<regex::Regex>,
    #[serde(skip)]
    pub(crate) cacheable_patterns_compiled: Vec<regex::Regex>,
}
