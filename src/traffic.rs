//! Per-session accounting of browser network traffic
//!
//! Observers attached to the page's request, response, and
//! loading-finished/failed events. Purely observational (no request is
//! mutated here), but two captured sequences feed the extractor: RPC
//! bodies from the lookup/search endpoints and fletch-render script
//! bodies. In full-proxy mode the script capture also populates the
//! cache, since the interceptor cannot see response bodies at the
//! request stage.

use anyhow::Result;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, EventResponseReceived,
    GetResponseBodyParams,
};
use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, warn};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;

use crate::cache::ScriptCache;
use crate::intercept::CACHE_MARKER_HEADER;
use crate::rpc::{self, LookupResponse, SearchResponse};

/// Captured RPC response.
#[derive(Debug, Clone)]
pub struct CapturedApi {
    pub url: String,
    pub body: Value,
}

/// Captured script body.
#[derive(Debug, Clone)]
pub struct CapturedScript {
    pub url: String,
    pub body: String,
}

/// Failed-request diagnostics.
#[derive(Debug, Clone)]
pub struct FailedRequest {
    pub url: String,
    pub kind: String,
    pub message: String,
}

/// Byte counters snapshot.
#[derive(Debug, Clone, Default)]
pub struct TrafficSummary {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub by_type_in: Vec<(String, u64)>,
}

struct RequestInfo {
    url: String,
    resource_type: String,
    content_type: Option<String>,
    served_from_cache: bool,
}

struct TrafficInner {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    by_type_in: DashMap<String, u64>,
    requests: DashMap<String, RequestInfo>,
    api_responses: Mutex<Vec<CapturedApi>>,
    script_responses: Mutex<Vec<CapturedScript>>,
    failures: Mutex<Vec<FailedRequest>>,
}

/// Session-lifetime traffic record; cheap to clone.
#[derive(Clone)]
pub struct TrafficTracker {
    inner: Arc<TrafficInner>,
}

impl Default for TrafficTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrafficInner {
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                by_type_in: DashMap::new(),
                requests: DashMap::new(),
                api_responses: Mutex::new(Vec::new()),
                script_responses: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Most recent lookup RPC response, if one was captured.
    #[must_use]
    pub fn lookup_response(&self) -> Option<LookupResponse> {
        self.inner
            .api_responses
            .lock()
            .iter()
            .rev()
            .find(|c| rpc::is_lookup_url(&c.url))
            .map(|c| LookupResponse::from_value(c.body.clone()))
    }

    /// Most recent search RPC response, if one was captured.
    #[must_use]
    pub fn search_response(&self) -> Option<SearchResponse> {
        self.inner
            .api_responses
            .lock()
            .iter()
            .rev()
            .find(|c| rpc::is_search_url(&c.url))
            .map(|c| SearchResponse::from_value(c.body.clone()))
    }

    #[must_use]
    pub fn api_responses(&self) -> Vec<CapturedApi> {
        self.inner.api_responses.lock().clone()
    }

    /// Captured script bodies as (url, body) pairs for the extractor.
    #[must_use]
    pub fn script_responses(&self) -> Vec<(String, String)> {
        self.inner
            .script_responses
            .lock()
            .iter()
            .map(|c| (c.url.clone(), c.body.clone()))
            .collect()
    }

    /// Fletch-render ids among the captured script URLs.
    #[must_use]
    pub fn captured_fletch_ids(&self) -> BTreeSet<u64> {
        self.inner
            .script_responses
            .lock()
            .iter()
            .filter_map(|c| rpc::fletch_render_id(&c.url))
            .collect()
    }

    #[must_use]
    pub fn failed_requests(&self) -> Vec<FailedRequest> {
        self.inner.failures.lock().clone()
    }

    #[must_use]
    pub fn summary(&self) -> TrafficSummary {
        let mut by_type: Vec<(String, u64)> = self
            .inner
            .by_type_in
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        by_type.sort();
        TrafficSummary {
            bytes_in: self.inner.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.inner.bytes_out.load(Ordering::Relaxed),
            by_type_in: by_type,
        }
    }

    fn record_api(&self, url: String, body: Value) {
        self.inner.api_responses.lock().push(CapturedApi { url, body });
    }

    fn record_script(&self, url: String, body: String) {
        self.inner
            .script_responses
            .lock()
            .push(CapturedScript { url, body });
    }

    #[cfg(test)]
    pub fn record_api_for_test(&self, url: &str, body: Value) {
        self.record_api(url.to_string(), body);
    }

    #[cfg(test)]
    pub fn record_script_for_test(&self, url: &str, body: &str) {
        self.record_script(url.to_string(), body.to_string());
    }
}

/// What the loading-finished observer should do with captured bodies.
pub struct CaptureConfig {
    /// Populate this cache with captured script bodies (full-proxy mode).
    pub cache: Option<ScriptCache>,
    pub cacheable_patterns: Vec<Regex>,
}

/// Attach the four network observers to a page.
///
/// Returned handles are aborted by the session on close; the streams end
/// on their own when the page goes away.
pub async fn attach(
    page: &Arc<Page>,
    tracker: TrafficTracker,
    capture: CaptureConfig,
) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(4);

    let mut requests = page.event_listener::<EventRequestWillBeSent>().await?;
    let t = tracker.clone();
    handles.push(tokio::spawn(async move {
        while let Some(event) = requests.next().await {
            let header_bytes = event.request.headers.inner().to_string().len() as u64;
            let estimate =
                header_bytes + event.request.url.len() as u64 + event.request.method.len() as u64 + 12;
            t.inner.bytes_out.fetch_add(estimate, Ordering::Relaxed);
            t.inner.requests.insert(
                request_key(event.request_id.inner()),
                RequestInfo {
                    url: event.request.url.clone(),
                    resource_type: event
                        .r#type
                        .as_ref()
                        .map_or_else(|| "Other".to_string(), |rt| format!("{rt:?}")),
                    content_type: None,
                    served_from_cache: false,
                },
            );
        }
    }));

    let mut responses = page.event_listener::<EventResponseReceived>().await?;
    let t = tracker.clone();
    handles.push(tokio::spawn(async move {
        while let Some(event) = responses.next().await {
            let key = request_key(event.request_id.inner());
            let from_cache = event
                .response
                .headers
                .inner()
                .get(CACHE_MARKER_HEADER)
                .is_some();
            if let Some(mut info) = t.inner.requests.get_mut(&key) {
                info.content_type = Some(event.response.mime_type.clone());
                info.served_from_cache = from_cache;
                info.resource_type = format!("{:?}", event.r#type);
            }
        }
    }));

    let mut finished = page.event_listener::<EventLoadingFinished>().await?;
    let t = tracker.clone();
    let page_for_bodies = Arc::clone(page);
    handles.push(tokio::spawn(async move {
        while let Some(event) = finished.next().await {
            let key = request_key(event.request_id.inner());
            let Some(info) = t.inner.requests.get(&key).map(|i| {
                (
                    i.url.clone(),
                    i.resource_type.clone(),
                    i.content_type.clone(),
                    i.served_from_cache,
                )
            }) else {
                continue;
            };
            let (url, resource_type, content_type, served_from_cache) = info;

            let length = event.encoded_data_length.max(0.0) as u64;
            t.inner.bytes_in.fetch_add(length, Ordering::Relaxed);
            *t.inner.by_type_in.entry(resource_type).or_insert(0) += length;

            let wants_api = rpc::is_lookup_url(&url) || rpc::is_search_url(&url);
            let wants_script = rpc::fletch_render_id(&url).is_some();
            if !wants_api && !wants_script {
                continue;
            }

            let body = match fetch_body(&page_for_bodies, &event.request_id).await {
                Ok(body) => body,
                Err(e) => {
                    debug!("response body unavailable for {url}: {e:#}");
                    continue;
                }
            };

            if wants_api {
                match rpc::parse_rpc_json(&body) {
                    Ok(value) => t.record_api(url.clone(), value),
                    Err(e) => warn!("unparseable RPC body from {url}: {e:#}"),
                }
            } else {
                if let Some(capture_cache) = capture.cache.as_ref()
                    && !served_from_cache
                    && is_cacheable(&url, &capture.cacheable_patterns)
                    && let Err(e) = capture_cache
                        .save(&url, body.clone().into_bytes(), content_type, None, None)
                        .await
                {
                    debug!("not caching {url}: {e:#}");
                }
                t.record_script(url, body);
            }
        }
    }));

    let mut failed = page.event_listener::<EventLoadingFailed>().await?;
    let t = tracker.clone();
    handles.push(tokio::spawn(async move {
        while let Some(event) = failed.next().await {
            let key = request_key(event.request_id.inner());
            let url = t
                .inner
                .requests
                .get(&key)
                .map_or_else(String::new, |i| i.url.clone());
            // Canceled loads are routine during navigation teardown.
            if event.canceled.unwrap_or(false) {
                continue;
            }
            t.inner.failures.lock().push(FailedRequest {
                url,
                kind: format!("{:?}", event.r#type),
                message: event.error_text.clone(),
            });
        }
    }));

    Ok(handles)
}

fn request_key(id: &str) -> String {
    id.to_string()
}

fn is_cacheable(url: &str, patterns: &[Regex]) -> bool {
    crate::cache::filename_of(url)
        .is_some_and(|name| patterns.iter().any(|re| re.is_match(&name)))
}

async fn fetch_body(
    page: &Page,
    request_id: &chromiumoxide::cdp::browser_protocol::network::RequestId,
) -> Result<String> {
    let response = page
        .execute(GetResponseBodyParams::new(request_id.clone()))
        .await?;
    if response.base64_encoded {
        let bytes = BASE64_STANDARD.decode(response.body.as_bytes())?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    } else {
        Ok(response.body.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_and_search_separated() {
        let tracker = TrafficTracker::new();
        tracker.record_api(
            "https://site/anji/_/rpc/LookupService/GetCreativeById".to_string(),
            serde_json::json!({"1": {"15": "111122223333"}}),
        );
        tracker.record_api(
            "https://site/anji/_/rpc/SearchService/SearchCreatives".to_string(),
            serde_json::json!({"1": [{"2": "CR1"}]}),
        );

        let lookup = tracker.lookup_response().expect("lookup captured");
        assert_eq!(lookup.real_creative_id().as_deref(), Some("111122223333"));
        let search = tracker.search_response().expect("search captured");
        assert!(search.mentions_creative("CR1"));
    }

    #[test]
    fn latest_lookup_wins() {
        let tracker = TrafficTracker::new();
        let url = "https://site/anji/_/rpc/LookupService/GetCreativeById".to_string();
        tracker.record_api(url.clone(), serde_json::json!({}));
        tracker.record_api(url, serde_json::json!({"1": {"15": "999988887777"}}));
        let lookup = tracker.lookup_response().expect("lookup captured");
        assert!(!lookup.is_empty());
    }

    #[test]
    fn fletch_ids_tracked_from_script_urls() {
        let tracker = TrafficTracker::new();
        tracker.record_script(
            "https://cdn/x.js?fletch-render-42".to_string(),
            "body".to_string(),
        );
        tracker.record_script("https://cdn/other.js".to_string(), "body".to_string());
        let ids = tracker.captured_fletch_ids();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains(&42));
    }

    #[test]
    fn cacheable_requires_versioned_pattern_match() {
        let patterns = vec![Regex::new(r"\.js$").expect("pattern")];
        assert!(is_cacheable("https://cdn/v5/app.js", &patterns));
        assert!(!is_cacheable("https://cdn/v5/style.css", &patterns));
    }
}
