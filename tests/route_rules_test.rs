//! Route decision table driven through operator-supplied configuration.

use adscrape::config::ScrapeConfigBuilder;
use adscrape::intercept::{RouteAction, RouteRules, decide};
use chromiumoxide::cdp::browser_protocol::network::ResourceType;

#[test]
fn custom_block_patterns_replace_defaults() {
    let config = ScrapeConfigBuilder::new()
        .blocked_url_patterns(vec![r"adservice\.example\.net".to_string()])
        .build()
        .expect("config builds");
    let rules = RouteRules::from_config(&config);

    assert_eq!(
        decide(
            &ResourceType::Script,
            "https://adservice.example.net/ads.js",
            &rules
        ),
        RouteAction::Block
    );
    // Default tracker patterns were replaced, so analytics now passes
    // (versionless .js is not cache-eligible either).
    assert_eq!(
        decide(
            &ResourceType::Script,
            "https://www.google-analytics.com/analytics.js",
            &rules
        ),
        RouteAction::PassThrough
    );
}

#[test]
fn cacheable_patterns_gate_cache_eligibility() {
    let config = ScrapeConfigBuilder::new()
        .cacheable_script_patterns(vec![r"^content\.js$".to_string()])
        .build()
        .expect("config builds");
    let rules = RouteRules::from_config(&config);

    assert_eq!(
        decide(
            &ResourceType::Script,
            "https://cdn.example.com/build-77/content.js?fletch-render-1",
            &rules
        ),
        RouteAction::Script
    );
    // Other versioned scripts are no longer cache-eligible.
    assert_eq!(
        decide(
            &ResourceType::Script,
            "https://cdn.example.com/build-77/other.js",
            &rules
        ),
        RouteAction::PassThrough
    );
}

#[test]
fn blocked_types_beat_every_other_rule() {
    let config = ScrapeConfigBuilder::new().build().expect("config builds");
    let rules = RouteRules::from_config(&config);

    // Even a versioned cacheable filename is blocked when the browser
    // asks for it as a stylesheet.
    assert_eq!(
        decide(
            &ResourceType::Stylesheet,
            "https://cdn.example.com/build-77/content.js",
            &rules
        ),
        RouteAction::Block
    );
}

#[test]
fn rpc_beats_cacheable_filename_match() {
    // A lookup endpoint whose last path segment happens to match a
    // cacheable pattern must still pass through for capture.
    let config = ScrapeConfigBuilder::new()
        .cacheable_script_patterns(vec![r".*".to_string()])
        .build()
        .expect("config builds");
    let rules = RouteRules::from_config(&config);

    assert_eq!(
        decide(
            &ResourceType::Xhr,
            "https://site/anji/_/rpc/LookupService/GetCreativeById",
            &rules
        ),
        RouteAction::Rpc
    );
}
