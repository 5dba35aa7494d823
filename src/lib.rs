pub mod browser;
pub mod cache;
pub mod classify;
pub mod config;
pub mod extract;
pub mod fetch;
pub mod intercept;
pub mod proxy;
pub mod queue;
pub mod rpc;
pub mod session;
pub mod stealth;
pub mod traffic;
pub mod utils;
pub mod validate;
pub mod worker;

pub use browser::{download_managed_browser, find_browser_executable, launch_session_browser};
pub use cache::{
    ArtifactMeta, ArtifactStatus, CacheOptions, CachedArtifact, ScriptCache, VersionLedger,
    VersionedKey, versioned_key,
};
pub use classify::{Classification, ErrorCategory, classify};
pub use config::{CacheStrategy, ScrapeConfig, ScrapeConfigBuilder};
pub use extract::{ExtractionMethod, ExtractionOutcome};
pub use fetch::{BrowserFetcher, CookiePair, DirectFetcher, FetchContext};
pub use intercept::{RouteAction, RouteRules, RouteStats, RouteStatsSnapshot, decide};
pub use proxy::{ProxyConfig, ProxyManager};
pub use queue::{QueueEntry, QueueStore, WriteDisposition};
pub use rpc::{LookupResponse, SearchResponse};
pub use session::{
    CreativeTask, ItemOutcome, ScrapingSession, SessionReport, WaitOutcome, pad_results,
};
pub use traffic::{TrafficSummary, TrafficTracker};
pub use validate::{Verdict, validate};
pub use worker::{RunCounters, RunSummary, WorkerPool};
