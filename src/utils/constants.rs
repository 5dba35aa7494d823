//! Shared configuration constants for adscrape
//!
//! This module contains default values and configuration constants used
//! throughout the codebase to ensure consistency and avoid magic numbers.

/// Default number of concurrent workers
///
/// Each worker owns one browser instance at a time, so this also bounds
/// concurrent Chromium processes. Raise with `--max-concurrent` once the
/// host has memory headroom; 50 workers is the tested ceiling.
pub const DEFAULT_WORKERS: usize = 3;

/// Default batch size claimed per queue round-trip
///
/// Item 0 of a batch pays for the full page navigation; items 1..N reuse
/// the session cookies with API-only replays. Larger batches amortize the
/// navigation cost but hold claimed rows longer.
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Timeout for page navigation and the content wait, in seconds
pub const PAGE_LOAD_TIMEOUT_SECS: u64 = 45;

/// Timeout for a single script-body fetch, in seconds
pub const SCRIPT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Interval between content-wait polls, in milliseconds
pub const CONTENT_POLL_INTERVAL_MS: u64 = 500;

/// Grace period after an empty lookup before giving up on the
/// `SearchCreatives` cross-check, in milliseconds
pub const SEARCH_CROSSCHECK_GRACE_MS: u64 = 3_000;

/// Memory tier bound for the script cache, in bytes (~100 MB)
pub const DEFAULT_CACHE_MEMORY_BYTES: u64 = 100 * 1024 * 1024;

/// Maximum age of a cached artifact before revalidation, in seconds (6 h)
///
/// The surface ships new bundle versions more often than this in practice,
/// so version-change invalidation usually fires first.
pub const DEFAULT_CACHE_MAX_AGE_SECS: u64 = 6 * 60 * 60;

/// Bounded attempts for proxy acquisition before the worker surfaces the
/// error and exits
pub const PROXY_MAX_ATTEMPTS: u32 = 5;

/// Base delay for proxy acquisition backoff, in milliseconds
pub const PROXY_BACKOFF_BASE_MS: u64 = 750;

/// Progress counters are logged every this many processed items
pub const PROGRESS_LOG_EVERY: u64 = 50;

/// Default transparency surface origin
///
/// Overridable via config for mirror/staging surfaces; every RPC call and
/// referer header derives from this origin.
pub const DEFAULT_SURFACE_ORIGIN: &str = "https://adstransparency.google.com";

/// User-agent pool for per-session randomization
///
/// Updated: 2025-06-12 (Chrome 136/137 stable window)
/// Next update: 2025-09-12 (quarterly schedule)
///
/// Chrome releases new stable versions ~every 4 weeks; keeping a small
/// pool of recent versions avoids a fleet-wide identical fingerprint.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/137.0.7151.68 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.7103.113 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/137.0.7151.68 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.7103.113 Safari/537.36",
];

/// URL substrings blocked outright as tracker/ads noise
///
/// These never carry creative payloads; blocking them saves proxy bytes
/// and keeps the traffic record focused on the lookup + script traffic.
pub const BLOCKED_URL_PATTERNS: &[&str] = &[
    "doubleclick.net/pixel",
    "google-analytics.com",
    "googletagmanager.com",
    "/pagead/1p-conversion",
    "/generate_204",
    "play.google.com/log",
    "facebook.com/tr",
];

/// Filename patterns treated as cacheable scripts
///
/// The surface serves its creative bundles as versioned `.js` artifacts;
/// anything matching here is eligible for the two-level cache when its URL
/// carries an extractable version segment.
pub const CACHEABLE_SCRIPT_PATTERNS: &[&str] = &[r"\.js$"];
