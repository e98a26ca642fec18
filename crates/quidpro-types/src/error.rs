//! Error taxonomy for QuidPro
//!
//! Domain invariant violations live here. Collaborator-facing failures
//! (transport, classifier, dispatcher) are defined next to their contracts.

use thiserror::Error;

use crate::NegotiationStage;

/// Result type for QuidPro domain operations
pub type Result<T> = std::result::Result<T, QuidProError>;

/// Domain error types
#[derive(Debug, Clone, Error)]
pub enum QuidProError {
    /// Stage change not present in the transition table
    #[error("Invalid transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: NegotiationStage,
        to: NegotiationStage,
    },

    /// Mutation attempted on a terminal request
    #[error("Negotiation {negotiation_id} is terminal ({stage:?}) and immutable")]
    TerminalRequest {
        negotiation_id: String,
        stage: NegotiationStage,
    },

    /// Second reward-sent flip attempted
    #[error("Reward for negotiation {negotiation_id} was already sent")]
    RewardAlreadySent { negotiation_id: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl QuidProError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation can succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}
