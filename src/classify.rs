//! Ordered rule table mapping raw error strings to retry decisions
//!
//! Errors surface as strings from three runtimes (Chromium net stack,
//! reqwest, tokio timeouts), so classification is textual: a list of
//! (matcher, kind, category) rules evaluated in order, first match wins.
//! The 429 matcher is whole-word on purpose; a substring check used to
//! classify creative id fragments like "1429..." as rate limits.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Suffix appended to messages on rows returned to `pending`.
pub const PENDING_RETRY_SUFFIX: &str = " - pending retry";

/// Prefix for permanently failed rows.
pub const PERMANENT_PREFIX: &str = "PERMANENT ERROR: ";

/// Message recorded when the lookup is empty and the search cross-check
/// agrees the creative is gone.
pub const BAD_AD_MESSAGE: &str = "Creative not found in API - broken/deleted creative page";

/// Tokens indicating a transient network condition, from the Chromium
/// net stack, libc errno names, and the incomplete-artifact validator
/// message.
const NETWORK_TOKENS: &[&str] = &[
    "ERR_PROXY_CONNECTION_FAILED",
    "ERR_EMPTY_RESPONSE",
    "ERR_CONNECTION_RESET",
    "ERR_TIMED_OUT",
    "ERR_CONNECTION_CLOSED",
    "ERR_CONNECTION_REFUSED",
    "ERR_TUNNEL_CONNECTION_FAILED",
    "TimeoutError",
    "Timeout",
    "BrokenPipeError",
    "socket hang up",
    "ECONNRESET",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "script bodies but none received",
];

/// Disposition of a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Row goes back to `pending` for another attempt.
    Retry,
    /// Creative is gone; never retried.
    BadAd,
    /// Permanent failure.
    Failed,
}

/// Classification verdict: `(retry, kind, category)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub retry: bool,
    pub kind: &'static str,
    pub category: ErrorCategory,
}

enum Matcher {
    /// Any of the listed substrings.
    Substrings(&'static [&'static str]),
    Substring(&'static str),
    /// Whole-word regex match.
    Word(Regex),
}

struct Rule {
    matcher: Matcher,
    kind: &'static str,
    category: ErrorCategory,
}

impl Rule {
    fn matches(&self, message: &str) -> bool {
        match &self.matcher {
            Matcher::Substrings(tokens) => tokens.iter().any(|t| message.contains(t)),
            Matcher::Substring(token) => message.contains(token),
            Matcher::Word(re) => re.is_match(message),
        }
    }
}

lazy_static! {
    static ref RULES: Vec<Rule> = vec![
        Rule {
            matcher: Matcher::Substrings(NETWORK_TOKENS),
            kind: "Network/Timeout",
            category: ErrorCategory::Retry,
        },
        Rule {
            matcher: Matcher::Substring("Creative not found in API"),
            kind: "CreativeMissing",
            category: ErrorCategory::BadAd,
        },
        Rule {
            matcher: Matcher::Word(
                Regex::new(r"\b429\b").expect("rate-limit regex is valid")
            ),
            kind: "RateLimit",
            category: ErrorCategory::Retry,
        },
    ];
}

/// Classify a raw error message.
#[must_use]
pub fn classify(message: &str) -> Classification {
    for rule in RULES.iter() {
        if rule.matches(message) {
            return Classification {
                retry: rule.category == ErrorCategory::Retry,
                kind: rule.kind,
                category: rule.category,
            };
        }
    }
    Classification {
        retry: false,
        kind: "Failed",
        category: ErrorCategory::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_tokens_retry() {
        for token in NETWORK_TOKENS {
            let verdict = classify(&format!("navigation failed: {token} while loading"));
            assert_eq!(verdict.category, ErrorCategory::Retry, "token {token}");
            assert!(verdict.retry);
            assert_eq!(verdict.kind, "Network/Timeout");
        }
    }

    #[test]
    fn missing_creative_is_bad_ad() {
        let verdict = classify(BAD_AD_MESSAGE);
        assert_eq!(verdict.category, ErrorCategory::BadAd);
        assert!(!verdict.retry);
        assert_eq!(verdict.kind, "CreativeMissing");
    }

    #[test]
    fn whole_word_429_only() {
        let verdict = classify("upstream returned HTTP 429 too many requests");
        assert_eq!(verdict.category, ErrorCategory::Retry);
        assert_eq!(verdict.kind, "RateLimit");

        // "1429" inside an id must not read as a rate limit.
        let verdict = classify("creative 1429773301 returned malformed payload");
        assert_eq!(verdict.category, ErrorCategory::Failed);
    }

    #[test]
    fn rule_order_network_beats_rate_limit() {
        let verdict = classify("HTTP 429 then ECONNRESET during retry");
        assert_eq!(verdict.kind, "Network/Timeout");
    }

    #[test]
    fn incomplete_artifact_message_is_transient() {
        let verdict = classify("Expected 3 script bodies but none received");
        assert_eq!(verdict.category, ErrorCategory::Retry);
    }

    #[test]
    fn unknown_errors_are_permanent() {
        let verdict = classify("unexpected JSON schema at field 5");
        assert_eq!(verdict.category, ErrorCategory::Failed);
        assert!(!verdict.retry);
        assert_eq!(verdict.kind, "Failed");
    }
}
