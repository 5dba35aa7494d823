//! Content-readiness polling for the head-of-batch navigation
//!
//! DOM-content-loaded says nothing about whether the creative's RPC
//! round-trip and script fetches happened, so the session polls the
//! traffic record instead of sleeping a fixed interval. Four exits:
//! everything expected arrived, the creative is static, the lookup came
//! back empty (with a short grace period for the search cross-check to
//! land), or the deadline passed.

use log::debug;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

use crate::traffic::TrafficTracker;

/// Why the wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Lookup arrived and every expected script body is captured.
    Ready,
    /// Lookup arrived and declared a static creative.
    Static,
    /// Lookup arrived empty; cross-check grace has elapsed.
    EmptyLookup,
    Timeout,
}

/// Poll captured traffic until the creative's content is accounted for.
pub async fn wait_for_content(
    tracker: &TrafficTracker,
    timeout: Duration,
    poll_interval: Duration,
    crosscheck_grace: Duration,
) -> WaitOutcome {
    let deadline = Instant::now() + timeout;
    let mut empty_seen_at: Option<Instant> = None;

    loop {
        if let Some(lookup) = tracker.lookup_response() {
            if lookup.is_empty() {
                // Give the page's own SearchCreatives call a moment to
                // land before the caller runs the cross-check.
                let seen = *empty_seen_at.get_or_insert_with(Instant::now);
                if tracker.search_response().is_some() || seen.elapsed() >= crosscheck_grace {
                    return WaitOutcome::EmptyLookup;
                }
            } else if lookup.static_asset().is_some() {
                return WaitOutcome::Static;
            } else {
                let expected = lookup.fletch_render_ids();
                let captured = tracker.captured_fletch_ids();
                if is_subset(&expected, &captured) {
                    return WaitOutcome::Ready;
                }
                debug!(
                    "waiting for content: {}/{} script bodies captured",
                    expected.intersection(&captured).count(),
                    expected.len()
                );
            }
        } else {
            debug!("waiting for content: no lookup response yet");
        }

        if Instant::now() + poll_interval > deadline {
            return WaitOutcome::Timeout;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

fn is_subset(expected: &BTreeSet<u64>, captured: &BTreeSet<u64>) -> bool {
    expected.iter().all(|id| captured.contains(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_millis(10);
    const GRACE: Duration = Duration::from_millis(30);

    fn lookup_with_fletch(ids: &[u64]) -> serde_json::Value {
        let urls: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| serde_json::json!({"2": format!("https://cdn/x.js?fletch-render-{id}")}))
            .collect();
        serde_json::json!({"1": {"5": urls, "15": "111122223333"}})
    }

    #[tokio::test]
    async fn times_out_without_traffic() {
        let tracker = TrafficTracker::new();
        let outcome =
            wait_for_content(&tracker, Duration::from_millis(50), POLL, GRACE).await;
        assert_eq!(outcome, WaitOutcome::Timeout);
    }

    #[tokio::test]
    async fn ready_once_expected_scripts_arrive() {
        let tracker = TrafficTracker::new();
        let t = tracker.clone();
        let wait = tokio::spawn(async move {
            wait_for_content(&t, Duration::from_secs(2), POLL, GRACE).await
        });

        tracker.record_api_for_test(
            "https://site/anji/_/rpc/LookupService/GetCreativeById",
            lookup_with_fletch(&[41, 42]),
        );
        tracker.record_script_for_test("https://cdn/x.js?fletch-render-41", "a");
        tokio::time::sleep(Duration::from_millis(30)).await;
        tracker.record_script_for_test("https://cdn/x.js?fletch-render-42", "b");

        assert_eq!(wait.await.expect("wait task"), WaitOutcome::Ready);
    }

    #[tokio::test]
    async fn static_creative_short_circuits() {
        let tracker = TrafficTracker::new();
        tracker.record_api_for_test(
            "https://site/anji/_/rpc/LookupService/GetCreativeById",
            serde_json::json!({"1": {"7": "https://tpc.googlesyndication.com/simgad/1"}}),
        );
        let outcome =
            wait_for_content(&tracker, Duration::from_secs(1), POLL, GRACE).await;
        assert_eq!(outcome, WaitOutcome::Static);
    }

    #[tokio::test]
    async fn empty_lookup_waits_for_crosscheck_grace() {
        let tracker = TrafficTracker::new();
        tracker.record_api_for_test(
            "https://site/anji/_/rpc/LookupService/GetCreativeById",
            serde_json::json!({}),
        );
        let started = std::time::Instant::now();
        let outcome =
            wait_for_content(&tracker, Duration::from_secs(1), POLL, GRACE).await;
        assert_eq!(outcome, WaitOutcome::EmptyLookup);
        assert!(started.elapsed() >= GRACE, "grace period must elapse");
    }

    #[tokio::test]
    async fn empty_lookup_exits_early_when_search_arrives() {
        let tracker = TrafficTracker::new();
        tracker.record_api_for_test(
            "https://site/anji/_/rpc/LookupService/GetCreativeById",
            serde_json::json!({}),
        );
        tracker.record_api_for_test(
            "https://site/anji/_/rpc/SearchService/SearchCreatives",
            serde_json::json!({"1": []}),
        );
        let started = std::time::Instant::now();
        let outcome =
            wait_for_content(&tracker, Duration::from_secs(5), POLL, Duration::from_secs(3)).await;
        assert_eq!(outcome, WaitOutcome::EmptyLookup);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
