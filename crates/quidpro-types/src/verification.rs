//! Proof verification results
//!
//! The classifier reports per-action confidences; the verification pipeline
//! derives the `verified` flag from them. Nothing else in the system is
//! allowed to set `verified`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ActionKind;

/// Raw output of the external image classifier for one proof image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierReport {
    /// Per-action confidence in [0, 1]
    pub detected_actions: BTreeMap<ActionKind, f64>,
    /// Whether the screenshot shows the negotiated target content
    pub content_match: bool,
    /// Classifier model version; identical input + version is deterministic
    pub model_version: String,
}

/// Outcome of one verification attempt, as recorded on the request and in
/// the activity ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub detected_actions: BTreeMap<ActionKind, f64>,
    pub content_match: bool,
    /// Derived by the pipeline policy; see `quidpro-verify`
    pub verified: bool,
    /// True when the classifier was unreachable and this is a placeholder
    pub degraded: bool,
    pub model_version: String,
}

impl VerificationResult {
    /// Placeholder result for an unreachable classifier. Counts as a normal
    /// unverified attempt; never aborts the negotiation.
    pub fn degraded() -> Self {
        Self {
            detected_actions: BTreeMap::new(),
            content_match: false,
            verified: false,
            degraded: true,
            model_version: "unavailable".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_result_is_unverified() {
        let result = VerificationResult::degraded();
        assert!(!result.verified);
        assert!(result.degraded);
        assert!(result.detected_actions.is_empty());
    }
}
