//! Batch scraping session orchestration
//!
//! One browser per batch. The head item pays for a full navigation
//! (route interception, traffic capture, cache population, cookie
//! harvest) and every tail item replays the lookup RPC from the same
//! context, fetching its script bodies in parallel (off-proxy when
//! partial-proxy mode is on). The hard invariant lives here: a session
//! returns exactly one result per input entry, in input order, no
//! matter which step failed.

pub mod outcome;
pub mod smart_wait;

pub use outcome::{CreativeTask, ItemOutcome, pad_results};
pub use smart_wait::{WaitOutcome, wait_for_content};

use anyhow::{Context, Result, anyhow};
use chromiumoxide::Page;
use chromiumoxide::browser::Browser;
use futures::future::join_all;
use log::{debug, info, warn};
use rand::seq::IndexedRandom;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::browser::{launch_session_browser, remove_profile};
use crate::cache::ScriptCache;
use crate::classify::BAD_AD_MESSAGE;
use crate::config::ScrapeConfig;
use crate::extract;
use crate::fetch::{BrowserFetcher, CookiePair, DirectFetcher, FetchContext};
use crate::intercept::{self, RouteRules, RouteStats, RouteStatsSnapshot};
use crate::proxy::ProxyConfig;
use crate::rpc::{self, LookupResponse};
use crate::stealth;
use crate::traffic::{self, CaptureConfig, TrafficSummary, TrafficTracker};
use crate::utils::constants::{
    CONTENT_POLL_INTERVAL_MS, SEARCH_CROSSCHECK_GRACE_MS, USER_AGENTS,
};
use crate::validate;

/// Everything a worker needs from one finished batch.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Same length and ordering as the input batch.
    pub results: Vec<ItemOutcome>,
    pub traffic: TrafficSummary,
    /// Interception counters for the head-of-batch full load.
    pub head_cache_stats: RouteStatsSnapshot,
    /// Interception counters accumulated over the tail replays.
    pub tail_cache_stats: RouteStatsSnapshot,
}

/// One batch-scoped scraping session.
pub struct ScrapingSession {
    config: ScrapeConfig,
    cache: ScriptCache,
    proxy: Option<ProxyConfig>,
}

impl ScrapingSession {
    #[must_use]
    pub fn new(config: ScrapeConfig, cache: ScriptCache, proxy: Option<ProxyConfig>) -> Self {
        Self {
            config,
            cache,
            proxy,
        }
    }

    /// Run the whole batch. Never fails: errors become per-item result
    /// records, and unprocessed entries are padded so the report always
    /// covers the batch.
    pub async fn run_batch(&self, batch: &[CreativeTask]) -> SessionReport {
        let tracker = TrafficTracker::new();
        let stats = RouteStats::default();
        let mut results = Vec::with_capacity(batch.len());
        let mut head_stats = RouteStatsSnapshot::default();

        if !batch.is_empty()
            && let Err(e) = self
                .run_batch_inner(batch, &tracker, &stats, &mut results, &mut head_stats)
                .await
        {
            let summary = format!("{e:#}");
            warn!(
                "session aborted with {}/{} items processed: {summary}",
                results.len(),
                batch.len()
            );
            let padding = if results.is_empty() {
                format!("Batch head gave no session: {summary}")
            } else {
                format!("Session aborted mid-batch: {summary}")
            };
            pad_results(&mut results, batch.len(), &padding);
        }
        debug_assert_eq!(results.len(), batch.len());

        SessionReport {
            results,
            traffic: tracker.summary(),
            head_cache_stats: head_stats,
            tail_cache_stats: stats.snapshot(),
        }
    }

    async fn run_batch_inner(
        &self,
        batch: &[CreativeTask],
        tracker: &TrafficTracker,
        stats: &RouteStats,
        results: &mut Vec<ItemOutcome>,
        head_stats: &mut RouteStatsSnapshot,
    ) -> Result<()> {
        let user_agent = USER_AGENTS
            .choose(&mut rand::rng())
            .copied()
            .unwrap_or(USER_AGENTS[0])
            .to_string();
        info!("opening session for batch of {}", batch.len());

        let (mut browser, handler_task, profile_dir) =
            launch_session_browser(&self.config, self.proxy.as_ref(), &user_agent).await?;

        let drive_result = self
            .drive(&browser, batch, tracker, stats, results, head_stats, &user_agent)
            .await;

        // Teardown runs on every path so a mid-batch error never leaks
        // a Chromium process or profile directory.
        if let Err(e) = browser.close().await {
            debug!("browser close failed: {e}");
        }
        handler_task.abort();
        if let Err(e) = handler_task.await
            && !e.is_cancelled()
        {
            warn!("handler task failed during abort: {e}");
        }
        remove_profile(&profile_dir);

        drive_result
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        browser: &Browser,
        batch: &[CreativeTask],
        tracker: &TrafficTracker,
        stats: &RouteStats,
        results: &mut Vec<ItemOutcome>,
        head_stats: &mut RouteStatsSnapshot,
        user_agent: &str,
    ) -> Result<()> {
        let page = Arc::new(
            browser
                .new_page("about:blank")
                .await
                .context("opening page")?,
        );
        stealth::prepare(&page, user_agent).await?;

        // The direct client exists for the whole session in partial-proxy
        // mode; cookies are mirrored into it after the head harvest.
        let direct = if self.config.partial_proxy() {
            Some(DirectFetcher::new(
                user_agent,
                &[],
                self.config.script_fetch_timeout(),
            )?)
        } else {
            None
        };

        let mut observer_handles = intercept::install(
            &page,
            RouteRules::from_config(&self.config),
            self.cache.clone(),
            direct.clone(),
            stats.clone(),
            self.proxy.clone(),
        )
        .await?;

        observer_handles.extend(
            traffic::attach(
                &page,
                tracker.clone(),
                CaptureConfig {
                    // In partial-proxy mode the interceptor populates the
                    // cache itself; capture-to-cache is the full-proxy path.
                    cache: (!self.config.partial_proxy()).then(|| self.cache.clone()),
                    cacheable_patterns: self.config.cacheable_patterns().to_vec(),
                },
            )
            .await?,
        );

        let processed = self
            .process_items(&page, batch, tracker, stats, results, head_stats, direct.as_ref())
            .await;

        for handle in observer_handles {
            handle.abort();
        }
        processed
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_items(
        &self,
        page: &Arc<Page>,
        batch: &[CreativeTask],
        tracker: &TrafficTracker,
        stats: &RouteStats,
        results: &mut Vec<ItemOutcome>,
        head_stats: &mut RouteStatsSnapshot,
        direct: Option<&DirectFetcher>,
    ) -> Result<()> {
        let head = &batch[0];
        let head_url = self.config.creative_url(&head.advertiser_id, &head.creative_id);
        info!("batch head navigation: {head_url}");

        with_timeout(
            async {
                page.goto(head_url.clone())
                    .await
                    .map(|_| ())
                    .map_err(|e| anyhow!("{e}"))
            },
            self.config.page_load_timeout(),
            "page navigation",
        )
        .await?;
        with_timeout(
            async {
                page.wait_for_navigation()
                    .await
                    .map(|_| ())
                    .map_err(|e| anyhow!("{e}"))
            },
            self.config.page_load_timeout(),
            "page load",
        )
        .await?;

        let wait_outcome = wait_for_content(
            tracker,
            self.config.page_load_timeout(),
            Duration::from_millis(CONTENT_POLL_INTERVAL_MS),
            Duration::from_millis(SEARCH_CROSSCHECK_GRACE_MS),
        )
        .await;

        match wait_outcome {
            WaitOutcome::EmptyLookup => {
                let confirmed_gone = tracker
                    .search_response()
                    .map(|s| !s.mentions_creative(&head.creative_id));
                if confirmed_gone == Some(true) {
                    // The surface has forgotten this creative. No usable
                    // session came out of the navigation either, so the
                    // batch cannot continue; tail entries go back for a
                    // fresh head.
                    results.push(ItemOutcome::failure(BAD_AD_MESSAGE));
                    return Err(anyhow!(
                        "head creative deleted, session cookies not established (TimeoutError)"
                    ));
                }
                // Empty lookup without a disagreeing cross-check is more
                // often proxy trouble than a dead creative.
                results.push(ItemOutcome::failure(
                    "Empty lookup response - ERR_EMPTY_RESPONSE",
                ));
            }
            WaitOutcome::Timeout => {
                results.push(ItemOutcome::failure(format!(
                    "TimeoutError: no creative content after {}s",
                    self.config.page_load_timeout().as_secs()
                )));
            }
            WaitOutcome::Ready | WaitOutcome::Static => {
                let lookup = tracker
                    .lookup_response()
                    .ok_or_else(|| anyhow!("lookup response vanished after content wait"))?;
                let scripts = tracker.script_responses();
                let expected = lookup.fletch_render_ids();
                let verdict =
                    validate::validate(&expected, &scripts, extract::extract(&lookup, &scripts));
                results.push(ItemOutcome::from_verdict(verdict));
            }
        }

        if let Some(dump_dir) = self.config.debug_dump_dir() {
            dump_captured(dump_dir, &head.creative_id, tracker);
        }

        // Cookie harvest seeds the tail fetch contexts.
        let cookies: Vec<CookiePair> = page
            .get_cookies()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|c| CookiePair {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
            })
            .collect();
        debug!("harvested {} cookies from head navigation", cookies.len());
        if let Some(direct) = direct {
            direct.add_cookies(&cookies);
        }

        let rpc_fetcher = BrowserFetcher::new(Arc::clone(page));
        let script_fetcher = match direct {
            Some(client) => FetchContext::Direct(client.clone()),
            None => FetchContext::Browser(BrowserFetcher::new(Arc::clone(page))),
        };

        *head_stats = stats.snapshot();
        stats.reset();

        for task in &batch[1..] {
            match self
                .process_tail_item(&rpc_fetcher, &script_fetcher, task)
                .await
            {
                Ok(item) => results.push(item),
                Err(e) => {
                    warn!("tail item {} failed: {e:#}", task.creative_id);
                    results.push(ItemOutcome::failure(format!("{e:#}")));
                }
            }
        }
        Ok(())
    }

    /// API-only replay for one tail entry: lookup POST from the browser
    /// context, then every referenced script body fetched in parallel.
    async fn process_tail_item(
        &self,
        rpc_fetcher: &BrowserFetcher,
        script_fetcher: &FetchContext,
        task: &CreativeTask,
    ) -> Result<ItemOutcome> {
        let referer = self.config.creative_url(&task.advertiser_id, &task.creative_id);
        let endpoint = rpc::lookup_url(self.config.surface_origin());
        let body = rpc::lookup_body(&task.advertiser_id, &task.creative_id);
        let headers = rpc::lookup_headers(self.config.surface_origin(), &referer);

        let response = with_timeout(
            rpc_fetcher.post_form(&endpoint, &body, &referer, &headers),
            self.config.script_fetch_timeout(),
            "lookup replay",
        )
        .await?;

        let lookup = LookupResponse::from_body(&response)?;
        if lookup.is_empty() {
            return Ok(ItemOutcome::failure(BAD_AD_MESSAGE));
        }

        let expected = lookup.fletch_render_ids();
        let urls = lookup.script_urls();
        debug!(
            "fetching {} script bodies for {}",
            urls.len(),
            task.creative_id
        );

        // All fetches start together; the item waits on the slowest one,
        // not on the sum.
        let fetches = urls.iter().map(|url| {
            let fetcher = script_fetcher.clone();
            let limit = self.config.script_fetch_timeout();
            let url = url.clone();
            async move {
                let fetched = with_timeout(fetcher.fetch_text(&url), limit, "script fetch").await;
                (url, fetched)
            }
        });

        let mut scripts = Vec::new();
        for (url, fetched) in join_all(fetches).await {
            match fetched {
                Ok(body) => scripts.push((url, body)),
                Err(e) => debug!("script fetch failed for {url}: {e:#}"),
            }
        }

        let verdict = validate::validate(&expected, &scripts, extract::extract(&lookup, &scripts));
        Ok(ItemOutcome::from_verdict(verdict))
    }
}

/// Debug mode only: dump captured payloads for postmortems. Raw bodies
/// are never persisted otherwise.
fn dump_captured(dir: &std::path::Path, creative_id: &str, tracker: &TrafficTracker) {
    let target = dir.join(creative_id);
    if let Err(e) = std::fs::create_dir_all(&target) {
        warn!("debug dump dir unavailable: {e}");
        return;
    }
    for (i, api) in tracker.api_responses().iter().enumerate() {
        let rendered = serde_json::to_vec_pretty(&api.body).unwrap_or_default();
        if let Err(e) = std::fs::write(target.join(format!("api_{i:02}.json")), rendered) {
            warn!("debug dump failed for {}: {e}", api.url);
        }
    }
    for (i, (url, body)) in tracker.script_responses().iter().enumerate() {
        if let Err(e) = std::fs::write(target.join(format!("script_{i:02}.js")), body) {
            warn!("debug dump failed for {url}: {e}");
        }
    }
}

/// Timeout wrapper whose error message classifies as transient.
async fn with_timeout<F, T>(operation: F, limit: Duration, name: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "TimeoutError: {name} exceeded {}s",
            limit.as_secs()
        )),
    }
}
