//! Version-aware cache keys derived from artifact URLs
//!
//! The surface serves its bundles from versioned directories:
//! `<scheme>://<host>/<prefix>/<versioned-dir>/<filename>`. The segment
//! immediately preceding the filename is the build identifier, and the
//! pair (filename, version) is the minimal correct cache key: filename
//! alone risks serving stale bundles, the full URL wastes capacity.
//! Extraction is positional, never a match on a known prefix string, so
//! arbitrary parent-segment naming works.

use url::Url;

/// Why a URL could not be turned into a cache key. Callers branch on
/// this: a save refuses, a load just misses.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid artifact URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("no filename in artifact URL '{0}'")]
    NoFilename(String),
    #[error("no version segment in artifact URL '{0}'")]
    NoVersion(String),
}

/// Cache key for one artifact: URL filename plus the version token from
/// its parent path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionedKey {
    pub filename: String,
    pub version: String,
}

impl VersionedKey {
    /// On-disk object name, `<filename>_v_<version>`.
    #[must_use]
    pub fn object_name(&self) -> String {
        format!("{}_v_{}", self.filename, self.version)
    }

    /// Sidecar metadata document name.
    #[must_use]
    pub fn meta_name(&self) -> String {
        format!("{}.meta", self.object_name())
    }
}

/// Extract the (filename, version) key from an artifact URL.
///
/// # Errors
///
/// Fails when the URL does not parse, has no filename, or has no parent
/// path segment to serve as the version token. Persisting such a URL
/// would produce an un-keyable cache entry, so callers treat this as a
/// refusal, not a fallback.
pub fn versioned_key(url: &str) -> Result<VersionedKey, KeyError> {
    let parsed = Url::parse(url).map_err(|source| KeyError::InvalidUrl {
        url: url.to_string(),
        source,
    })?;
    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    let filename = segments
        .last()
        .copied()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| KeyError::NoFilename(url.to_string()))?;

    let version = if segments.len() >= 2 {
        segments[segments.len() - 2]
    } else {
        return Err(KeyError::NoVersion(url.to_string()));
    };

    Ok(VersionedKey {
        filename: sanitize(filename),
        version: sanitize(version),
    })
}

/// Filename portion alone, for ledger lookups on URLs that may not carry
/// a version.
#[must_use]
pub fn filename_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segments: Vec<String> = parsed
        .path_segments()
        .map(|s| {
            s.filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    segments.last().map(|s| sanitize(s))
}

/// Keep cache object names filesystem-safe regardless of what the CDN
/// puts in a path segment.
fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_immediate_parent_segment() {
        let key = versioned_key("https://cdn.example.com/assets/20250610-abcdef/main.js")
            .expect("versioned URL should key");
        assert_eq!(key.filename, "main.js");
        assert_eq!(key.version, "20250610-abcdef");
        assert_eq!(key.object_name(), "main.js_v_20250610-abcdef");
    }

    #[test]
    fn arbitrary_parent_naming_works() {
        // No prefix matching: any parent segment is accepted as the version.
        let key = versioned_key("https://host/x/y/z/r20240101/bundle.js")
            .expect("deep path should key");
        assert_eq!(key.version, "r20240101");
    }

    #[test]
    fn query_is_ignored() {
        let key = versioned_key("https://host/v77/app.js?fletch-render-123&x=1")
            .expect("query should not affect the key");
        assert_eq!(key.filename, "app.js");
        assert_eq!(key.version, "v77");
    }

    #[test]
    fn missing_version_segment_refused() {
        assert!(versioned_key("https://host/app.js").is_err());
        assert!(versioned_key("https://host/").is_err());
    }

    #[test]
    fn unsafe_characters_sanitized() {
        let key = versioned_key("https://host/a%2Fb/fi:le.js")
            .expect("URL should key after sanitizing");
        assert!(!key.object_name().contains(':'));
        assert!(!key.object_name().contains('/'));
    }

    #[test]
    fn filename_of_handles_versionless_urls() {
        assert_eq!(
            filename_of("https://host/app.js").as_deref(),
            Some("app.js")
        );
        assert_eq!(filename_of("https://host/"), None);
    }
}
