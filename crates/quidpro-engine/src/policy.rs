//! Negotiation policy knobs

use std::collections::BTreeSet;

use quidpro_types::ActionKind;
use serde::{Deserialize, Serialize};

/// Policy constants for the negotiation state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginePolicy {
    /// Attempts (nudges or failed proofs) before the exchange is closed
    pub max_attempts: u32,
    /// Actions assumed when a greeting names none we recognize
    pub default_actions: BTreeSet<ActionKind>,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            default_actions: BTreeSet::from([ActionKind::Like, ActionKind::Subscribe]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = EnginePolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.default_actions.contains(&ActionKind::Like));
        assert!(policy.default_actions.contains(&ActionKind::Subscribe));
    }
}
