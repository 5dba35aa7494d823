//! Regex-based recovery of creative facts from captured payloads
//!
//! Everything here is a pure function over captured bodies. The decoy
//! problem shapes the API: the surface serves script bodies for several
//! co-tenant creatives from the same origin, so a token only counts when
//! it was found inside a script whose `fletch-render` id belongs to the
//! expected set declared by the lookup response.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::rpc::{self, LookupResponse};

lazy_static! {
    /// 11-char YouTube tokens, anchored to known URL/JSON contexts so
    /// arbitrary base64 fragments in minified bundles don't match.
    static ref VIDEO_URL_RE: Regex = Regex::new(
        r"(?:youtube\.com/embed/|youtube\.com/watch\?v=|youtu\.be/|i\.ytimg\.com/vi/)([A-Za-z0-9_-]{11})"
    )
    .expect("video URL regex is valid");
    static ref VIDEO_FIELD_RE: Regex = Regex::new(
        r#""videoId"\s*:\s*"([A-Za-z0-9_-]{11})""#
    )
    .expect("video field regex is valid");

    /// 9-10 digit app-store identifiers adjacent to store URL or product
    /// schema markers.
    static ref APP_STORE_URL_RE: Regex = Regex::new(
        r"(?:itunes|apps)\.apple\.com/[^\s\x22']*?id(\d{9,10})"
    )
    .expect("app-store URL regex is valid");
    static ref APP_STORE_FIELD_RE: Regex = Regex::new(
        r#""appId"\s*:\s*"?(\d{9,10})"#
    )
    .expect("app-store field regex is valid");

    static ref TWELVE_DIGIT_RE: Regex =
        Regex::new(r"\b(\d{12})\b").expect("twelve-digit regex is valid");
}

/// How the creative's identity was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Declared by the lookup API response.
    Api,
    /// Frequency analysis over captured script URLs.
    Frequency,
    /// Static-cached creative; no script bodies involved.
    Static,
}

/// Normalized extractor output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub videos: BTreeSet<String>,
    pub app_store_id: Option<String>,
    pub funded_by: Option<String>,
    pub real_creative_id: Option<String>,
    pub method: ExtractionMethod,
    pub extraction_success: bool,
}

/// True when the script's URL carries an expected fletch-render id.
fn is_expected_script(url: &str, expected: &BTreeSet<u64>) -> bool {
    rpc::fletch_render_id(url).is_some_and(|id| expected.contains(&id))
}

/// Video IDs from script bodies, filtered to expected scripts.
#[must_use]
pub fn video_ids(scripts: &[(String, String)], expected: &BTreeSet<u64>) -> BTreeSet<String> {
    let mut videos = BTreeSet::new();
    for (url, body) in scripts {
        if !is_expected_script(url, expected) {
            continue;
        }
        for re in [&*VIDEO_URL_RE, &*VIDEO_FIELD_RE] {
            for caps in re.captures_iter(body) {
                videos.insert(caps[1].to_string());
            }
        }
    }
    videos
}

/// App-store ID from script bodies, filtered to expected scripts.
#[must_use]
pub fn app_store_id(scripts: &[(String, String)], expected: &BTreeSet<u64>) -> Option<String> {
    for (url, body) in scripts {
        if !is_expected_script(url, expected) {
            continue;
        }
        if let Some(id) = app_store_id_in_text(body) {
            return Some(id);
        }
    }
    None
}

/// App-store ID anywhere in a text payload (used for API-embedded static
/// creatives, where no fletch filtering applies).
#[must_use]
pub fn app_store_id_in_text(text: &str) -> Option<String> {
    for re in [&*APP_STORE_URL_RE, &*APP_STORE_FIELD_RE] {
        if let Some(caps) = re.captures(text) {
            return Some(caps[1].to_string());
        }
    }
    None
}

/// Frequency-analysis fallback for the canonical creative id: the
/// 12-digit token appearing most often across captured script URLs wins.
/// Ties break toward the lexically smallest token for determinism.
#[must_use]
pub fn real_creative_id_by_frequency(script_urls: &[String]) -> Option<String> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for url in script_urls {
        for caps in TWELVE_DIGIT_RE.captures_iter(url) {
            *counts.entry(caps[1].to_string()).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(token, _)| token)
}

/// Run the full extraction pipeline over a lookup response and the
/// script bodies captured for it.
#[must_use]
pub fn extract(lookup: &LookupResponse, scripts: &[(String, String)]) -> ExtractionOutcome {
    let funded_by = lookup.funded_by();

    if lookup.static_asset().is_some() {
        let real_creative_id = lookup.real_creative_id();
        let api_text = lookup.raw().to_string();
        return ExtractionOutcome {
            videos: BTreeSet::new(),
            app_store_id: app_store_id_in_text(&api_text),
            funded_by,
            real_creative_id: real_creative_id.clone(),
            method: ExtractionMethod::Static,
            extraction_success: real_creative_id.is_some(),
        };
    }

    let expected = lookup.fletch_render_ids();

    // API-first identity; frequency analysis only when the API method
    // yields nothing at all.
    let (real_creative_id, method) = match lookup.real_creative_id() {
        Some(id) => (Some(id), ExtractionMethod::Api),
        None => {
            let urls: Vec<String> = scripts.iter().map(|(u, _)| u.clone()).collect();
            (
                real_creative_id_by_frequency(&urls),
                ExtractionMethod::Frequency,
            )
        }
    };

    ExtractionOutcome {
        videos: video_ids(scripts, &expected),
        app_store_id: app_store_id(scripts, &expected),
        funded_by,
        real_creative_id: real_creative_id.clone(),
        method,
        extraction_success: real_creative_id.is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected(ids: &[u64]) -> BTreeSet<u64> {
        ids.iter().copied().collect()
    }

    fn script(fletch: u64, body: &str) -> (String, String) {
        (
            format!("https://cdn.example.com/render/content.js?fletch-render-{fletch}"),
            body.to_string(),
        )
    }

    #[test]
    fn video_ids_recovered_from_expected_scripts() {
        let scripts = vec![script(
            10,
            r#"var u="https://www.youtube.com/embed/rkXH2aDmhDQ?autoplay=1";"#,
        )];
        let videos = video_ids(&scripts, &expected(&[10]));
        assert_eq!(videos.len(), 1);
        assert!(videos.contains("rkXH2aDmhDQ"));
    }

    #[test]
    fn decoy_scripts_are_filtered() {
        // Same body, but the script belongs to a co-tenant creative.
        let scripts = vec![script(99, r#""videoId":"C_NGOLQCcBo""#)];
        assert!(video_ids(&scripts, &expected(&[10])).is_empty());
        assert!(app_store_id(&scripts, &expected(&[10])).is_none());
    }

    #[test]
    fn multiple_videos_across_scripts() {
        let scripts = vec![
            script(1, r#""videoId":"C_NGOLQCcBo""#),
            script(2, "https://i.ytimg.com/vi/df0Aym2cJDM/hqdefault.jpg"),
        ];
        let videos = video_ids(&scripts, &expected(&[1, 2]));
        assert_eq!(
            videos,
            ["C_NGOLQCcBo", "df0Aym2cJDM"]
                .into_iter()
                .map(String::from)
                .collect()
        );
    }

    #[test]
    fn app_store_id_from_store_url() {
        let scripts = vec![script(
            7,
            r#"href="https://apps.apple.com/us/app/example/id1435281792""#,
        )];
        assert_eq!(
            app_store_id(&scripts, &expected(&[7])).as_deref(),
            Some("1435281792")
        );
    }

    #[test]
    fn app_store_id_from_schema_field() {
        assert_eq!(
            app_store_id_in_text(r#"{"appId":"6747917719","os":"ios"}"#).as_deref(),
            Some("6747917719")
        );
        // 8 digits: not an app-store id.
        assert_eq!(app_store_id_in_text(r#"{"appId":"12345678"}"#), None);
    }

    #[test]
    fn frequency_fallback_prefers_most_common() {
        let urls = vec![
            "https://cdn/creative/111122223333/a.js".to_string(),
            "https://cdn/creative/111122223333/b.js".to_string(),
            "https://cdn/creative/999988887777/c.js".to_string(),
        ];
        assert_eq!(
            real_creative_id_by_frequency(&urls).as_deref(),
            Some("111122223333")
        );
        assert_eq!(real_creative_id_by_frequency(&[]), None);
    }

    #[test]
    fn extract_api_first_no_fallback_on_empty_videos() {
        // The API names the creative but the scripts carry no videos:
        // the outcome stays method=Api with empty videos, letting the
        // validator surface the empty case.
        let lookup = LookupResponse::from_value(serde_json::json!({
            "1": {
                "5": [{"2": "https://cdn/x.js?fletch-render-4"}],
                "15": "445566778899"
            }
        }));
        let outcome = extract(&lookup, &[script(4, "no tokens here")]);
        assert_eq!(outcome.method, ExtractionMethod::Api);
        assert_eq!(outcome.real_creative_id.as_deref(), Some("445566778899"));
        assert!(outcome.videos.is_empty());
        assert!(outcome.extraction_success);
    }

    #[test]
    fn extract_static_creative() {
        let lookup = LookupResponse::from_value(serde_json::json!({
            "1": {
                "7": "https://tpc.googlesyndication.com/simgad/5555",
                "12": "Paid for by Example Corp",
                "15": "121212121212"
            }
        }));
        let outcome = extract(&lookup, &[]);
        assert_eq!(outcome.method, ExtractionMethod::Static);
        assert!(outcome.videos.is_empty());
        assert_eq!(outcome.funded_by.as_deref(), Some("Paid for by Example Corp"));
        assert!(outcome.extraction_success);
    }
}
