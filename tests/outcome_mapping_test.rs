//! Scenario-level checks of the result → queue-state mapping.
//!
//! These mirror the seeded end-to-end scenarios at the layer below the
//! browser: given the result records a session produces in each
//! situation, the queue must receive the right terminal states and
//! annotated messages.

use std::collections::BTreeSet;

use adscrape::classify::BAD_AD_MESSAGE;
use adscrape::extract::{ExtractionMethod, ExtractionOutcome};
use adscrape::queue::{WriteDisposition, disposition_for};
use adscrape::session::{ItemOutcome, pad_results};
use adscrape::validate::{Verdict, validate};

fn success_outcome(videos: &[&str], app_store_id: Option<&str>) -> ItemOutcome {
    ItemOutcome {
        success: true,
        videos: videos.iter().map(|v| (*v).to_string()).collect(),
        app_store_id: app_store_id.map(String::from),
        funded_by: None,
        real_creative_id: Some("111122223333".to_string()),
        method: Some(ExtractionMethod::Api),
        error: None,
    }
}

#[test]
fn video_ad_happy_path_completes() {
    let outcome = success_outcome(&["rkXH2aDmhDQ"], Some("1435281792"));
    let (disposition, message) = disposition_for(&outcome);
    assert_eq!(disposition, WriteDisposition::Completed);
    assert!(message.is_none());
}

#[test]
fn multi_video_happy_path_completes() {
    let outcome = success_outcome(&["C_NGOLQCcBo", "df0Aym2cJDM"], Some("6747917719"));
    assert_eq!(outcome.videos.len(), 2);
    assert_eq!(disposition_for(&outcome).0, WriteDisposition::Completed);
}

#[test]
fn deleted_creative_maps_to_bad_ad() {
    let outcome = ItemOutcome::failure(BAD_AD_MESSAGE);
    let (disposition, message) = disposition_for(&outcome);
    assert_eq!(disposition, WriteDisposition::BadAd);
    assert_eq!(
        message.as_deref(),
        Some("Creative not found in API - broken/deleted creative page")
    );
}

#[test]
fn all_tail_fetches_failing_returns_to_pending() {
    // Every script fetch for the item socket-hung-up: the validator sees
    // three expected bodies and zero observed.
    let expected: BTreeSet<u64> = [1, 2, 3].into_iter().collect();
    let extraction = ExtractionOutcome {
        videos: BTreeSet::new(),
        app_store_id: None,
        funded_by: None,
        real_creative_id: Some("111122223333".to_string()),
        method: ExtractionMethod::Api,
        extraction_success: true,
    };
    let verdict = validate(&expected, &[], extraction);
    let record = ItemOutcome::from_verdict(verdict);

    let (disposition, message) = disposition_for(&record);
    assert_eq!(disposition, WriteDisposition::Retry);
    let message = message.expect("retry carries annotation");
    assert!(message.contains("pending retry"), "got: {message}");
}

#[test]
fn head_failure_strands_no_tail_item() {
    // Navigation blew up before any item was processed: the session pads
    // all twenty records with the head's error, and each pads out to a
    // retry write.
    let mut results: Vec<ItemOutcome> = Vec::new();
    pad_results(
        &mut results,
        20,
        "Batch head gave no session: ERR_TUNNEL_CONNECTION_FAILED during navigation",
    );

    assert_eq!(results.len(), 20);
    for record in &results {
        let (disposition, message) = disposition_for(record);
        assert_eq!(disposition, WriteDisposition::Retry);
        assert!(message.expect("annotated").ends_with(" - pending retry"));
    }
}

#[test]
fn verdict_success_requires_facts_or_static() {
    // A completed row always carries videos, an app-store id, or the
    // static classification.
    let static_record = ItemOutcome {
        success: true,
        videos: Vec::new(),
        app_store_id: None,
        funded_by: Some("Paid for by Example Corp".to_string()),
        real_creative_id: Some("111122223333".to_string()),
        method: Some(ExtractionMethod::Static),
        error: None,
    };
    assert_eq!(disposition_for(&static_record).0, WriteDisposition::Completed);
    assert!(
        !static_record.videos.is_empty()
            || static_record.app_store_id.is_some()
            || static_record.method == Some(ExtractionMethod::Static)
    );

    let verdict = Verdict {
        success: true,
        errors: Vec::new(),
        outcome: ExtractionOutcome {
            videos: BTreeSet::from(["rkXH2aDmhDQ".to_string()]),
            app_store_id: None,
            funded_by: None,
            real_creative_id: Some("111122223333".to_string()),
            method: ExtractionMethod::Api,
            extraction_success: true,
        },
    };
    let record = ItemOutcome::from_verdict(verdict);
    assert!(!record.videos.is_empty() || record.app_store_id.is_some());
}
