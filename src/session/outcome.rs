//! Normalized per-item result records
//!
//! One builder for the record every layer above consumes; field naming
//! is `app_store_id` throughout the crate (the queue writes it to the
//! `appstore_id` column). The padding helper is how the batch-length
//! invariant survives head failures: a session always hands the worker
//! exactly one record per input entry.

use serde::{Deserialize, Serialize};

use crate::extract::ExtractionMethod;
use crate::validate::Verdict;

/// One unit of work handed to a scraping session.
#[derive(Debug, Clone)]
pub struct CreativeTask {
    /// Queue row key.
    pub id: i64,
    pub creative_id: String,
    pub advertiser_id: String,
}

/// Result record for one creative, in batch order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub success: bool,
    pub videos: Vec<String>,
    pub app_store_id: Option<String>,
    pub funded_by: Option<String>,
    pub real_creative_id: Option<String>,
    pub method: Option<ExtractionMethod>,
    pub error: Option<String>,
}

impl ItemOutcome {
    /// Build from a validator verdict; the only success path.
    #[must_use]
    pub fn from_verdict(verdict: Verdict) -> Self {
        let error = if verdict.errors.is_empty() {
            None
        } else {
            Some(verdict.errors.join("; "))
        };
        Self {
            success: verdict.success,
            videos: verdict.outcome.videos.into_iter().collect(),
            app_store_id: verdict.outcome.app_store_id,
            funded_by: verdict.outcome.funded_by,
            real_creative_id: verdict.outcome.real_creative_id,
            method: Some(verdict.outcome.method),
            error,
        }
    }

    /// Error record with no extracted facts.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            videos: Vec::new(),
            app_store_id: None,
            funded_by: None,
            real_creative_id: None,
            method: None,
            error: Some(message.into()),
        }
    }
}

/// Pad `results` with failure records until it covers the whole batch.
pub fn pad_results(results: &mut Vec<ItemOutcome>, batch_len: usize, message: &str) {
    while results.len() < batch_len {
        results.push(ItemOutcome::failure(message));
    }
}
