//! Request/response grammar for the transparency surface RPCs
//!
//! The lookup and search endpoints speak an observational protocol: the
//! envelope is a url-encoded form field wrapping a JSON document whose
//! keys are protobuf-style field numbers. Those numbers were recorded
//! from live traffic and may shift between surface revisions, so they
//! live here, in the `wire` table, and nowhere else in the crate.

use anyhow::{Context, Result, anyhow};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;

/// Lookup RPC path, relative to the surface origin.
pub const LOOKUP_PATH: &str = "/anji/_/rpc/LookupService/GetCreativeById";

/// Search RPC path; its response is consumed only as the bad-ad
/// cross-check, never issued by this crate.
pub const SEARCH_PATH: &str = "/anji/_/rpc/SearchService/SearchCreatives";

/// Observational field numbers for the lookup request/response shape.
///
/// Recorded 2025-05 against the production surface. A surface revision
/// that renumbers fields means editing this table only.
pub mod wire {
    /// Request: advertiser identifier.
    pub const REQ_ADVERTISER_ID: &str = "1";
    /// Request: creative identifier.
    pub const REQ_CREATIVE_ID: &str = "2";
    /// Request: render-options bitmap requesting all creative variants.
    pub const REQ_RENDER_OPTIONS: &str = "5";

    /// Response: the creative envelope.
    pub const CREATIVE: &str = "1";
    /// Response: funding disclosure text inside the creative envelope.
    pub const FUNDED_BY: &str = "12";
    /// Response: canonical (12-digit) creative identifier.
    pub const REAL_CREATIVE_ID: &str = "15";
    /// Response: pre-rendered HTML snippet for static creatives.
    pub const STATIC_HTML: &str = "9";
}

lazy_static! {
    /// `fletch-render-<id>` query token linking an API-declared asset to
    /// its script-body URL.
    static ref FLETCH_RENDER_RE: Regex =
        Regex::new(r"fletch-render-(\d+)").expect("fletch-render regex is valid");
    /// 12-digit canonical creative id.
    static ref REAL_ID_RE: Regex =
        Regex::new(r"\b(\d{12})\b").expect("real-id regex is valid");
    /// Static image payloads are served from the syndication CDN.
    static ref STATIC_IMAGE_RE: Regex =
        Regex::new(r"https?://[^\s\x22]*?/simgad/[^\s\x22]*").expect("simgad regex is valid");
}

/// Full lookup URL on the given surface origin.
#[must_use]
pub fn lookup_url(origin: &str) -> String {
    format!("{}{}", origin.trim_end_matches('/'), LOOKUP_PATH)
}

/// True when `url` targets the lookup RPC (any surface host).
#[must_use]
pub fn is_lookup_url(url: &str) -> bool {
    url.contains(LOOKUP_PATH)
}

/// True when `url` targets the search RPC.
#[must_use]
pub fn is_search_url(url: &str) -> bool {
    url.contains(SEARCH_PATH)
}

/// Extract the fletch-render id from a script URL, if present.
#[must_use]
pub fn fletch_render_id(url: &str) -> Option<u64> {
    FLETCH_RENDER_RE
        .captures(url)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Build the url-encoded lookup request body for one creative.
#[must_use]
pub fn lookup_body(advertiser_id: &str, creative_id: &str) -> String {
    let inner = serde_json::json!({
        wire::REQ_ADVERTISER_ID: advertiser_id,
        wire::REQ_CREATIVE_ID: creative_id,
        wire::REQ_RENDER_OPTIONS: {"2": 1, "3": 1, "4": 1},
    });
    format!("f.req={}", urlencoding::encode(&inner.to_string()))
}

/// Headers every lookup POST must carry, per the surface's CSRF scheme.
#[must_use]
pub fn lookup_headers(origin: &str, referer: &str) -> Vec<(String, String)> {
    vec![
        (
            "content-type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        ),
        ("x-same-domain".to_string(), "1".to_string()),
        (
            "accept-encoding".to_string(),
            "gzip, deflate, br".to_string(),
        ),
        ("origin".to_string(), origin.to_string()),
        ("referer".to_string(), referer.to_string()),
    ]
}

/// Strip the XSSI guard prefix the surface prepends to JSON bodies.
fn strip_xssi_prefix(body: &str) -> &str {
    let trimmed = body.trim_start();
    trimmed
        .strip_prefix(")]}'")
        .map_or(trimmed, str::trim_start)
}

/// Parsed lookup response.
///
/// Field access goes through methods so the observational shape stays in
/// this module; callers never index into the raw document.
#[derive(Debug, Clone)]
pub struct LookupResponse {
    raw: Value,
}

/// Static-creative payload referenced directly by the lookup response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaticAsset {
    /// Pre-rendered image served from the syndication CDN.
    Image(String),
    /// Inline HTML snippet.
    Html,
}

impl LookupResponse {
    /// Parse a lookup response body (XSSI prefix tolerated).
    pub fn from_body(body: &str) -> Result<Self> {
        let raw: Value =
            serde_json::from_str(strip_xssi_prefix(body)).context("invalid lookup JSON")?;
        Ok(Self { raw })
    }

    #[must_use]
    pub fn from_value(raw: Value) -> Self {
        Self { raw }
    }

    #[must_use]
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// An empty lookup means the surface no longer knows the creative.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match &self.raw {
            Value::Null => true,
            Value::Object(map) => !map.contains_key(wire::CREATIVE),
            _ => true,
        }
    }

    #[must_use]
    pub fn creative(&self) -> Option<&Value> {
        self.raw.get(wire::CREATIVE)
    }

    /// Canonical 12-digit creative id.
    ///
    /// The declared field wins; a recursive scan for a 12-digit token is
    /// the fallback for surface revisions that move it.
    #[must_use]
    pub fn real_creative_id(&self) -> Option<String> {
        if let Some(id) = self
            .creative()
            .and_then(|c| c.get(wire::REAL_CREATIVE_ID))
            .and_then(Value::as_str)
            && REAL_ID_RE.is_match(id)
        {
            return Some(id.to_string());
        }
        let mut found = None;
        visit_strings(&self.raw, &mut |s| {
            if found.is_none()
                && let Some(c) = REAL_ID_RE.captures(s)
            {
                found = Some(c[1].to_string());
            }
        });
        found
    }

    /// Fletch-render ids of every asset the creative declares.
    #[must_use]
    pub fn fletch_render_ids(&self) -> BTreeSet<u64> {
        let mut ids = BTreeSet::new();
        visit_strings(&self.raw, &mut |s| {
            for c in FLETCH_RENDER_RE.captures_iter(s) {
                if let Ok(id) = c[1].parse() {
                    ids.insert(id);
                }
            }
        });
        ids
    }

    /// Script-body URLs referenced by the creative, in declaration order.
    #[must_use]
    pub fn script_urls(&self) -> Vec<String> {
        let mut urls = Vec::new();
        visit_strings(&self.raw, &mut |s| {
            if s.starts_with("http")
                && FLETCH_RENDER_RE.is_match(s)
                && !urls.iter().any(|u| u == s)
            {
                urls.push(s.to_string());
            }
        });
        urls
    }

    /// Funding disclosure text, when the surface provides one.
    #[must_use]
    pub fn funded_by(&self) -> Option<String> {
        self.creative()
            .and_then(|c| c.get(wire::FUNDED_BY))
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.is_empty())
    }

    /// Detect a static-cached creative: no dynamic script bodies, payload
    /// embedded directly in the lookup response.
    #[must_use]
    pub fn static_asset(&self) -> Option<StaticAsset> {
        if !self.fletch_render_ids().is_empty() {
            return None;
        }
        let mut image = None;
        visit_strings(&self.raw, &mut |s| {
            if image.is_none()
                && let Some(m) = STATIC_IMAGE_RE.find(s)
            {
                image = Some(m.as_str().to_string());
            }
        });
        if let Some(url) = image {
            return Some(StaticAsset::Image(url));
        }
        if self
            .creative()
            .and_then(|c| c.get(wire::STATIC_HTML))
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty())
        {
            return Some(StaticAsset::Html);
        }
        None
    }
}

/// Parsed search response; the bad-ad cross-check is its only consumer.
#[derive(Debug, Clone)]
pub struct SearchResponse {
    raw: Value,
}

impl SearchResponse {
    pub fn from_body(body: &str) -> Result<Self> {
        let raw: Value =
            serde_json::from_str(strip_xssi_prefix(body)).context("invalid search JSON")?;
        Ok(Self { raw })
    }

    #[must_use]
    pub fn from_value(raw: Value) -> Self {
        Self { raw }
    }

    /// True when any result row names the creative.
    #[must_use]
    pub fn mentions_creative(&self, creative_id: &str) -> bool {
        let mut hit = false;
        visit_strings(&self.raw, &mut |s| {
            if s == creative_id {
                hit = true;
            }
        });
        hit
    }
}

/// Depth-first walk over every string in a JSON document.
fn visit_strings(value: &Value, f: &mut impl FnMut(&str)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => {
            for item in items {
                visit_strings(item, f);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                visit_strings(item, f);
            }
        }
        _ => {}
    }
}

/// Parse a captured RPC body into JSON, tolerating the XSSI prefix.
pub fn parse_rpc_json(body: &str) -> Result<Value> {
    serde_json::from_str(strip_xssi_prefix(body))
        .map_err(|e| anyhow!("unparseable RPC body: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_lookup() -> LookupResponse {
        LookupResponse::from_value(serde_json::json!({
            "1": {
                "1": "AR01",
                "2": "CR11718023440488202241",
                "5": [
                    {"2": "https://displayads-formats.googleusercontent.com/ads/preview/content.js?client=wta&fletch-render-7447479051179393836"},
                    {"2": "https://displayads-formats.googleusercontent.com/ads/preview/content.js?client=wta&fletch-render-9832745098127450981"}
                ],
                "12": "Paid for by Example Corp",
                "15": "771122334455"
            }
        }))
    }

    #[test]
    fn lookup_body_is_url_encoded_envelope() {
        let body = lookup_body("AR01", "CR02");
        assert!(body.starts_with("f.req="));
        let decoded = urlencoding::decode(&body["f.req=".len()..])
            .expect("body should decode");
        let value: Value = serde_json::from_str(&decoded).expect("inner JSON should parse");
        assert_eq!(value[wire::REQ_ADVERTISER_ID], "AR01");
        assert_eq!(value[wire::REQ_CREATIVE_ID], "CR02");
        assert_eq!(value[wire::REQ_RENDER_OPTIONS]["2"], 1);
    }

    #[test]
    fn xssi_prefix_is_stripped() {
        let resp = LookupResponse::from_body(")]}'\n{\"1\":{\"15\":\"112233445566\"}}")
            .expect("prefixed body should parse");
        assert_eq!(resp.real_creative_id().as_deref(), Some("112233445566"));
    }

    #[test]
    fn declared_real_id_wins_over_scan() {
        let resp = sample_lookup();
        assert_eq!(resp.real_creative_id().as_deref(), Some("771122334455"));
    }

    #[test]
    fn fletch_ids_and_script_urls_recovered() {
        let resp = sample_lookup();
        let ids = resp.fletch_render_ids();
        assert!(ids.contains(&7447479051179393836));
        assert!(ids.contains(&9832745098127450981));
        assert_eq!(resp.script_urls().len(), 2);
    }

    #[test]
    fn funded_by_read_from_declared_field() {
        assert_eq!(
            sample_lookup().funded_by().as_deref(),
            Some("Paid for by Example Corp")
        );
    }

    #[test]
    fn empty_lookup_detected() {
        assert!(LookupResponse::from_value(serde_json::json!({})).is_empty());
        assert!(LookupResponse::from_value(Value::Null).is_empty());
        assert!(!sample_lookup().is_empty());
    }

    #[test]
    fn static_image_detected_without_fletch_refs() {
        let resp = LookupResponse::from_value(serde_json::json!({
            "1": {"2": "CR05", "7": "https://tpc.googlesyndication.com/simgad/123456"}
        }));
        assert_eq!(
            resp.static_asset(),
            Some(StaticAsset::Image(
                "https://tpc.googlesyndication.com/simgad/123456".to_string()
            ))
        );
        // A creative with fletch refs is never static.
        assert_eq!(sample_lookup().static_asset(), None);
    }

    #[test]
    fn search_mentions_creative() {
        let resp = SearchResponse::from_value(serde_json::json!({
            "1": [{"2": "CR99"}, {"2": "CR100"}]
        }));
        assert!(resp.mentions_creative("CR99"));
        assert!(!resp.mentions_creative("CR42"));
    }
}
