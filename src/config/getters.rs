//! Getter methods for `ScrapeConfig`
//!
//! Accessor layer over the pub(crate) fields; the rest of the crate reads
//! configuration exclusively through these.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::types::{CacheStrategy, ScrapeConfig};

impl ScrapeConfig {
    #[must_use]
    pub fn surface_origin(&self) -> &str {
        &self.surface_origin
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn max_urls(&self) -> Option<u64> {
        self.max_urls
    }

    #[must_use]
    pub fn proxy_enabled(&self) -> bool {
        self.proxy_enabled
    }

    #[must_use]
    pub fn partial_proxy(&self) -> bool {
        self.partial_proxy
    }

    #[must_use]
    pub fn proxy_rotation(&self) -> bool {
        self.proxy_rotation
    }

    #[must_use]
    pub fn headless(&self) -> bool {
        self.headless
    }

    #[must_use]
    pub fn debug_dump_dir(&self) -> Option<&PathBuf> {
        self.debug_dump_dir.as_ref()
    }

    #[must_use]
    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }

    #[must_use]
    pub fn script_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.script_fetch_timeout_secs)
    }

    #[must_use]
    pub fn cache_memory_bytes(&self) -> u64 {
        self.cache_memory_bytes
    }

    #[must_use]
    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }

    #[must_use]
    pub fn cache_strategy(&self) -> CacheStrategy {
        self.cache_strategy
    }

    #[must_use]
    pub fn proxy_max_attempts(&self) -> u32 {
        self.proxy_max_attempts
    }

    #[must_use]
    pub fn blocked_patterns(&self) -> &[regex::Regex] {
        &self.blocked_patterns_compiled
    }

    #[must_use]
    pub fn cacheable_patterns(&self) -> &[regex::Regex] {
        &self.cacheable_patterns_compiled
    }

    /// Creative detail URL for a queue entry on the configured surface.
    #[must_use]
    pub fn creative_url(&self, advertiser_id: &str, creative_id: &str) -> String {
        format!(
            "{}/advertiser/{}/creative/{}",
            self.surface_origin, advertiser_id, creative_id
        )
    }
}
