//! Correlates expected vs. observed artifacts into a success verdict
//!
//! The session layer never decides success on its own; this verdict is
//! the source of truth. Error strings produced here are classifier
//! inputs: the incomplete-artifact wording matches a transient-network
//! rule, since missing script bodies are usually a network condition
//! rather than a property of the creative.

use std::collections::BTreeSet;

use crate::extract::{ExtractionMethod, ExtractionOutcome};
use crate::rpc;

/// Validation result for one creative.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub success: bool,
    pub errors: Vec<String>,
    pub outcome: ExtractionOutcome,
}

/// Validate an extraction against the artifact set the lookup declared.
#[must_use]
pub fn validate(
    expected: &BTreeSet<u64>,
    scripts: &[(String, String)],
    outcome: ExtractionOutcome,
) -> Verdict {
    let mut errors = Vec::new();

    if outcome.real_creative_id.is_none() {
        errors.push("Creative not identified".to_string());
    }

    if outcome.method != ExtractionMethod::Static && !expected.is_empty() {
        let observed: BTreeSet<u64> = scripts
            .iter()
            .filter_map(|(url, _)| rpc::fletch_render_id(url))
            .filter(|id| expected.contains(id))
            .collect();

        if observed.is_empty() {
            errors.push(format!(
                "Expected {} script bodies but none received",
                expected.len()
            ));
        } else if observed.len() < expected.len() {
            errors.push(format!(
                "incomplete: {}/{} received",
                observed.len(),
                expected.len()
            ));
        }
    }

    Verdict {
        success: errors.is_empty(),
        errors,
        outcome,
    }
}
