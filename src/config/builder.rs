//! Validating builder for `ScrapeConfig`
//!
//! Every field has a production default, so the builder is plain rather
//! than typestate; `build()` is where pattern compilation and range
//! validation happen, keeping hot paths free of both.

use anyhow::{Result, anyhow};
use regex::Regex;
use std::path::PathBuf;

use crate::utils::constants::{
    BLOCKED_URL_PATTERNS, CACHEABLE_SCRIPT_PATTERNS, DEFAULT_BATCH_SIZE,
    DEFAULT_CACHE_MAX_AGE_SECS, DEFAULT_CACHE_MEMORY_BYTES, DEFAULT_SURFACE_ORIGIN,
    DEFAULT_WORKERS, PAGE_LOAD_TIMEOUT_SECS, PROXY_MAX_ATTEMPTS, SCRIPT_FETCH_TIMEOUT_SECS,
};

use super::types::{CacheStrategy, ScrapeConfig};

/// Upper bound on worker tasks; beyond this the host runs out of Chromium
/// memory long before the queue runs out of rows.
const MAX_WORKERS: usize = 64;

pub struct ScrapeConfigBuilder {
    surface_origin: String,
    cache_dir: Option<PathBuf>,
    workers: usize,
    batch_size: usize,
    max_urls: Option<u64>,
    proxy_enabled: bool,
    partial_proxy: bool,
    proxy_rotation: bool,
    headless: bool,
    debug_dump_dir: Option<PathBuf>,
    page_load_timeout_secs: u64,
    script_fetch_timeout_secs: u64,
    cache_memory_bytes: u64,
    cache_max_age_secs: u64,
    cache_strategy: CacheStrategy,
    proxy_max_attempts: u32,
    blocked_url_patterns: Vec<String>,
    cacheable_script_patterns: Vec<String>,
}

impl Default for ScrapeConfigBuilder {
    fn default() -> Self {
        Self {
            surface_origin: DEFAULT_SURFACE_ORIGIN.to_string(),
            cache_dir: None,
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_urls: None,
            proxy_enabled: true,
            partial_proxy: false,
            proxy_rotation: false,
            headless: true,
            debug_dump_dir: None,
            page_load_timeout_secs: PAGE_LOAD_TIMEOUT_SECS,
            script_fetch_timeout_secs: SCRIPT_FETCH_TIMEOUT_SECS,
            cache_memory_bytes: DEFAULT_CACHE_MEMORY_BYTES,
            cache_max_age_secs: DEFAULT_CACHE_MAX_AGE_SECS,
            cache_strategy: CacheStrategy::AgeAndVersion,
            proxy_max_attempts: PROXY_MAX_ATTEMPTS,
            blocked_url_patterns: BLOCKED_URL_PATTERNS
                .iter()
                .map(|p| regex::escape(p))
                .collect(),
            cacheable_script_patterns: CACHEABLE_SCRIPT_PATTERNS
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
        }
    }
}

impl ScrapeConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn surface_origin(mut self, origin: impl Into<String>) -> Self {
        self.surface_origin = origin.into();
        self
    }

    #[must_use]
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    #[must_use]
    pub fn max_urls(mut self, cap: Option<u64>) -> Self {
        self.max_urls = cap;
        self
    }

    #[must_use]
    pub fn proxy_enabled(mut self, enabled: bool) -> Self {
        self.proxy_enabled = enabled;
        self
    }

    #[must_use]
    pub fn partial_proxy(mut self, enabled: bool) -> Self {
        self.partial_proxy = enabled;
        self
    }

    #[must_use]
    pub fn proxy_rotation(mut self, enabled: bool) -> Self {
        self.proxy_rotation = enabled;
        self
    }

    #[must_use]
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    #[must_use]
    pub fn debug_dump_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.debug_dump_dir = dir;
        self
    }

    #[must_use]
    pub fn page_load_timeout_secs(mut self, secs: u64) -> Self {
        self.page_load_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn script_fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.script_fetch_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn cache_memory_bytes(mut self, bytes: u64) -> Self {
        self.cache_memory_bytes = bytes;
        self
    }

    #[must_use]
    pub fn cache_max_age_secs(mut self, secs: u64) -> Self {
        self.cache_max_age_secs = secs;
        self
    }

    #[must_use]
    pub fn cache_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.cache_strategy = strategy;
        self
    }

    #[must_use]
    pub fn proxy_max_attempts(mut self, attempts: u32) -> Self {
        self.proxy_max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn blocked_url_patterns(mut self, patterns: Vec<String>) -> Self {
        self.blocked_url_patterns = patterns;
        self
    }

    #[must_use]
    pub fn cacheable_script_patterns(mut self, patterns: Vec<String>) -> Self {
        self.cacheable_script_patterns = patterns;
        self
    }

    /// Validate and build the final configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when a numeric bound is out of range, the surface
    /// origin is not an absolute http(s) URL, or a pattern fails to
    /// compile.
    pub fn build(self) -> Result<ScrapeConfig> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(anyhow!(
                "workers must be in 1..={MAX_WORKERS}, got {}",
                self.workers
            ));
        }
        if self.batch_size == 0 {
            return Err(anyhow!("batch size must be at least 1"));
        }
        if self.proxy_max_attempts == 0 {
            return Err(anyhow!("proxy max attempts must be at least 1"));
        }

        let origin = url::Url::parse(&self.surface_origin)
            .map_err(|e| anyhow!("invalid surface origin '{}': {e}", self.surface_origin))?;
        if origin.scheme() != "http" && origin.scheme() != "https" {
            return Err(anyhow!(
                "surface origin must be http(s), got '{}'",
                self.surface_origin
            ));
        }

        let cache_dir = match self.cache_dir {
            Some(dir) if dir.is_absolute() => dir,
            Some(dir) => std::env::current_dir()?.join(dir),
            None => std::env::temp_dir().join("adscrape_cache"),
        };

        let blocked_patterns_compiled = compile_patterns(&self.blocked_url_patterns)?;
        let cacheable_patterns_compiled = compile_patterns(&self.cacheable_script_patterns)?;

        Ok(ScrapeConfig {
            surface_origin: self.surface_origin.trim_end_matches('/').to_string(),
            cache_dir,
            workers: self.workers,
            batch_size: self.batch_size,
            max_urls: self.max_urls,
            proxy_enabled: self.proxy_enabled,
            partial_proxy: self.partial_proxy,
            proxy_rotation: self.proxy_rotation,
            headless: self.headless,
            debug_dump_dir: self.debug_dump_dir,
            page_load_timeout_secs: self.page_load_timeout_secs,
            script_fetch_timeout_secs: self.script_fetch_timeout_secs,
            cache_memory_bytes: self.cache_memory_bytes,
            cache_max_age_secs: self.cache_max_age_secs,
            cache_strategy: self.cache_strategy,
            proxy_max_attempts: self.proxy_max_attempts,
            blocked_url_patterns: self.blocked_url_patterns,
            cacheable_script_patterns: self.cacheable_script_patterns,
            blocked_patterns_compiled,
            cacheable_patterns_compiled,
        })
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| anyhow!("invalid pattern '{p}': {e}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let config = ScrapeConfigBuilder::new()
            .build()
            .expect("default builder should produce a valid config");
        assert_eq!(config.workers(), DEFAULT_WORKERS);
        assert_eq!(config.batch_size(), DEFAULT_BATCH_SIZE);
        assert!(config.cache_dir().is_absolute());
        assert!(!config.blocked_patterns().is_empty());
    }

    #[test]
    fn zero_workers_rejected() {
        assert!(ScrapeConfigBuilder::new().workers(0).build().is_err());
    }

    #[test]
    fn bad_origin_rejected() {
        assert!(
            ScrapeConfigBuilder::new()
                .surface_origin("ftp://example.com")
                .build()
                .is_err()
        );
        assert!(
            ScrapeConfigBuilder::new()
                .surface_origin("not a url")
                .build()
                .is_err()
        );
    }

    #[test]
    fn bad_pattern_rejected() {
        assert!(
            ScrapeConfigBuilder::new()
                .cacheable_script_patterns(vec!["[unclosed".to_string()])
                .build()
                .is_err()
        );
    }

    #[test]
    fn origin_trailing_slash_trimmed() {
        let config = ScrapeConfigBuilder::new()
            .surface_origin("https://example.com/")
            .build()
            .expect("origin with trailing slash should build");
        assert_eq!(config.surface_origin(), "https://example.com");
    }
}
