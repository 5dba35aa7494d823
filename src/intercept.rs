//! Per-request route decisions via CDP Fetch-domain interception
//!
//! Every outbound request from the browser context pauses here and gets
//! one of four treatments: fail (blocked resource classes and tracker
//! noise; zero upstream bytes), fulfill from the two-level cache,
//! fetch through the direct client and fulfill (partial-proxy mode), or
//! continue untouched. The lookup/search RPCs always continue; their
//! bodies are captured by the traffic observers.

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::fetch;
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, ResourceType};
use futures::StreamExt;
use log::{debug, warn};
use regex::Regex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;

use crate::cache::{ScriptCache, versioned_key};
use crate::config::ScrapeConfig;
use crate::fetch::DirectFetcher;
use crate::proxy::ProxyConfig;
use crate::rpc;

/// Marker header on responses fulfilled from the cache, so the traffic
/// observers don't re-capture (and re-save) them.
pub const CACHE_MARKER_HEADER: &str = "x-scrape-cache";

/// Resource classes that never carry creative payloads.
const BLOCKED_TYPES: &[ResourceType] = &[
    ResourceType::Image,
    ResourceType::Media,
    ResourceType::Font,
    ResourceType::Stylesheet,
];

/// Route decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Abort without an upstream fetch.
    Block,
    /// Cacheable script: serve from cache, or fetch-and-fill per mode.
    Script,
    /// RPC endpoint whose body the extractor needs; pass through.
    Rpc,
    PassThrough,
}

/// Compiled decision inputs, derived from config once per session.
#[derive(Clone)]
pub struct RouteRules {
    blocked_patterns: Vec<Regex>,
    cacheable_patterns: Vec<Regex>,
    partial_proxy: bool,
}

impl RouteRules {
    #[must_use]
    pub fn from_config(config: &ScrapeConfig) -> Self {
        Self {
            blocked_patterns: config.blocked_patterns().to_vec(),
            cacheable_patterns: config.cacheable_patterns().to_vec(),
            partial_proxy: config.partial_proxy(),
        }
    }

    #[must_use]
    pub fn partial_proxy(&self) -> bool {
        self.partial_proxy
    }
}

/// The decision table, pure so it stays testable without a browser.
#[must_use]
pub fn decide(resource_type: &ResourceType, url: &str, rules: &RouteRules) -> RouteAction {
    if BLOCKED_TYPES.contains(resource_type) {
        return RouteAction::Block;
    }
    if rules.blocked_patterns.iter().any(|re| re.is_match(url)) {
        return RouteAction::Block;
    }
    if rpc::is_lookup_url(url) || rpc::is_search_url(url) {
        return RouteAction::Rpc;
    }
    let cacheable_name = crate::cache::filename_of(url)
        .is_some_and(|name| rules.cacheable_patterns.iter().any(|re| re.is_match(&name)));
    if cacheable_name && versioned_key(url).is_ok() {
        return RouteAction::Script;
    }
    RouteAction::PassThrough
}

#[derive(Default)]
struct StatsInner {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    blocked_requests: AtomicU64,
    bytes_saved: AtomicU64,
}

/// Per-session interception counters.
#[derive(Clone, Default)]
pub struct RouteStats {
    inner: Arc<StatsInner>,
}

/// Snapshot of the interception counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteStatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub blocked_requests: u64,
    pub bytes_saved: u64,
}

impl RouteStats {
    #[must_use]
    pub fn snapshot(&self) -> RouteStatsSnapshot {
        RouteStatsSnapshot {
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.inner.cache_misses.load(Ordering::Relaxed),
            blocked_requests: self.inner.blocked_requests.load(Ordering::Relaxed),
            bytes_saved: self.inner.bytes_saved.load(Ordering::Relaxed),
        }
    }

    /// Zero the counters (after the head item, so the summary reflects
    /// tail reuse).
    pub fn reset(&self) {
        self.inner.cache_hits.store(0, Ordering::Relaxed);
        self.inner.cache_misses.store(0, Ordering::Relaxed);
        self.inner.blocked_requests.store(0, Ordering::Relaxed);
        self.inner.bytes_saved.store(0, Ordering::Relaxed);
    }
}

/// Install request interception on a page.
///
/// `direct` must be provided in partial-proxy mode; cache misses on
/// script URLs are then fetched through it, bypassing the proxy.
/// `proxy_auth` enables Fetch-domain auth handling for authenticated
/// upstream proxies.
pub async fn install(
    page: &Arc<Page>,
    rules: RouteRules,
    cache: ScriptCache,
    direct: Option<DirectFetcher>,
    stats: RouteStats,
    proxy_auth: Option<ProxyConfig>,
) -> Result<Vec<JoinHandle<()>>> {
    let handle_auth = proxy_auth.is_some();
    page.execute(
        fetch::EnableParams::builder()
            .pattern(
                fetch::RequestPattern::builder()
                    .url_pattern("*")
                    .request_stage(fetch::RequestStage::Request)
                    .build(),
            )
            .handle_auth_requests(handle_auth)
            .build(),
    )
    .await
    .context("failed enabling request interception")?;

    let mut handles = Vec::with_capacity(2);

    let mut events = page.event_listener::<fetch::EventRequestPaused>().await?;
    let page_for_routes = Arc::clone(page);
    handles.push(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let Err(e) =
                route_one(&page_for_routes, &event, &rules, &cache, direct.as_ref(), &stats).await
            {
                let rendered = format!("{e:?}");
                if rendered.contains("Invalid InterceptionId") {
                    // Navigation teardown invalidated the pause; nothing to do.
                    debug!("interception invalidated for {}", event.request.url);
                    continue;
                }
                warn!("route handling failed for {}: {e:#}", event.request.url);
                if let Err(e) = continue_request(&page_for_routes, &event).await {
                    debug!("continue after route failure also failed: {e:#}");
                }
            }
        }
    }));

    if let Some(proxy) = proxy_auth {
        let mut auth_events = page.event_listener::<fetch::EventAuthRequired>().await?;
        let page_for_auth = Arc::clone(page);
        handles.push(tokio::spawn(async move {
            while let Some(event) = auth_events.next().await {
                let response = fetch::AuthChallengeResponse {
                    response: fetch::AuthChallengeResponseResponse::ProvideCredentials,
                    username: Some(proxy.username.clone()),
                    password: Some(proxy.password.clone()),
                };
                if let Err(e) = page_for_auth
                    .execute(fetch::ContinueWithAuthParams::new(
                        event.request_id.clone(),
                        response,
                    ))
                    .await
                {
                    warn!("proxy auth response failed: {e}");
                }
            }
        }));
    }

    Ok(handles)
}

async fn route_one(
    page: &Page,
    event: &fetch::EventRequestPaused,
    rules: &RouteRules,
    cache: &ScriptCache,
    direct: Option<&DirectFetcher>,
    stats: &RouteStats,
) -> Result<()> {
    let url = event.request.url.as_str();

    match decide(&event.resource_type, url, rules) {
        RouteAction::Block => {
            stats.inner.blocked_requests.fetch_add(1, Ordering::Relaxed);
            page.execute(fetch::FailRequestParams::new(
                event.request_id.clone(),
                ErrorReason::BlockedByClient,
            ))
            .await
            .context("failed blocking request")?;
            Ok(())
        }
        RouteAction::Script => {
            if let Some(artifact) = cache.load(url).await {
                stats.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
                stats
                    .inner
                    .bytes_saved
                    .fetch_add(artifact.body.len() as u64, Ordering::Relaxed);
                return fulfill(
                    page,
                    event,
                    &artifact.body,
                    artifact.meta.content_type.as_deref(),
                )
                .await;
            }

            stats.inner.cache_misses.fetch_add(1, Ordering::Relaxed);

            if rules.partial_proxy
                && let Some(client) = direct
            {
                // Unauthenticated CDN content: fetch off-proxy, cache,
                // fulfill. A direct-fetch failure falls back to the
                // proxied path so the page still loads.
                match client.fetch_artifact(url).await {
                    Ok(fetched) => {
                        if let Err(e) = cache
                            .save(
                                url,
                                fetched.body.clone(),
                                fetched.content_type.clone(),
                                fetched.etag.clone(),
                                fetched.last_modified.clone(),
                            )
                            .await
                        {
                            debug!("not caching {url}: {e:#}");
                        }
                        return fulfill(page, event, &fetched.body, fetched.content_type.as_deref())
                            .await;
                    }
                    Err(e) => {
                        warn!("direct fetch failed for {url}, falling back to proxy: {e:#}");
                    }
                }
            }

            // Full-proxy mode (or direct-fetch fallback): let the browser
            // fetch it; the traffic observer captures the body into cache.
            continue_request(page, event).await
        }
        RouteAction::Rpc | RouteAction::PassThrough => continue_request(page, event).await,
    }
}

async fn continue_request(page: &Page, event: &fetch::EventRequestPaused) -> Result<()> {
    page.execute(
        fetch::ContinueRequestParams::builder()
            .request_id(event.request_id.clone())
            .build()
            .map_err(|e| anyhow!("failed building ContinueRequestParams: {e}"))?,
    )
    .await
    .context("failed continuing request")?;
    Ok(())
}

async fn fulfill(
    page: &Page,
    event: &fetch::EventRequestPaused,
    body: &[u8],
    content_type: Option<&str>,
) -> Result<()> {
    let headers = vec![
        fetch::HeaderEntry {
            name: "content-type".to_string(),
            value: content_type.unwrap_or("text/javascript").to_string(),
        },
        fetch::HeaderEntry {
            name: CACHE_MARKER_HEADER.to_string(),
            value: "hit".to_string(),
        },
    ];
    page.execute(
        fetch::FulfillRequestParams::builder()
            .request_id(event.request_id.clone())
            .response_code(200)
            .response_headers(headers)
            .body(BASE64_STANDARD.encode(body))
            .build()
            .map_err(|e| anyhow!("failed building FulfillRequestParams: {e}"))?,
    )
    .await
    .context("failed fulfilling request")?;
    Ok(())
}
