//! The negotiation lifecycle
//!
//! A [`NegotiationRequest`] tracks one exchange with one counterparty from
//! first contact to a terminal stage. Stage changes are restricted to the
//! closed transition table in [`NegotiationStage::allows`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{
    ActionKind, ClientId, CounterpartyId, MediaRef, NegotiationId, QuidProError, Result,
    VerificationResult,
};

/// Stage of a negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStage {
    /// First qualifying message seen, request not yet opened
    InitialContact,
    /// Exchange proposed, waiting for a usable target reference
    Negotiating,
    /// Target known, waiting for a proof image
    ProofRequested,
    /// Proof handed to the classifier, outcome pending
    VerifyingProof,
    /// Proof verified, reward owed (or already sent)
    Completed,
    /// Attempts exhausted or force-failed
    Failed,
}

impl NegotiationStage {
    /// Whether this stage admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The closed transition table. Anything not listed here is rejected.
    pub fn allows(&self, next: NegotiationStage) -> bool {
        use NegotiationStage::*;
        matches!(
            (self, next),
            (InitialContact, Negotiating)
                | (Negotiating, Negotiating)
                | (Negotiating, ProofRequested)
                | (Negotiating, Failed)
                | (ProofRequested, VerifyingProof)
                | (ProofRequested, Failed)
                | (VerifyingProof, Completed)
                | (VerifyingProof, ProofRequested)
                | (VerifyingProof, Failed)
        )
    }
}

/// One exchange negotiation with one counterparty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationRequest {
    pub id: NegotiationId,
    pub counterparty: CounterpartyId,
    pub client: ClientId,
    /// Actions the counterparty asked us to perform once their proof checks out
    pub requested_actions: BTreeSet<ActionKind>,
    /// Content the counterparty wants acted on; set once they supply it
    pub target_reference: Option<String>,
    pub stage: NegotiationStage,
    pub attempt_count: u32,
    pub last_proof: Option<MediaRef>,
    pub verification: Option<VerificationResult>,
    pub reward_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NegotiationRequest {
    /// Open a request in `Negotiating` for a counterparty's first contact.
    pub fn open(
        counterparty: CounterpartyId,
        client: ClientId,
        requested_actions: BTreeSet<ActionKind>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: NegotiationId::new(),
            counterparty,
            client,
            requested_actions,
            target_reference: None,
            stage: NegotiationStage::Negotiating,
            attempt_count: 0,
            last_proof: None,
            verification: None,
            reward_sent: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, enforcing the transition table and terminal
    /// immutability.
    pub fn transition(&mut self, next: NegotiationStage) -> Result<()> {
        if self.stage.is_terminal() {
            return Err(QuidProError::TerminalRequest {
                negotiation_id: self.id.to_string(),
                stage: self.stage,
            });
        }
        if !self.stage.allows(next) {
            return Err(QuidProError::InvalidTransition {
                from: self.stage,
                to: next,
            });
        }
        self.stage = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Flip `reward_sent` false→true. A second call is an error; the flag
    /// never reverts.
    pub fn mark_reward_sent(&mut self) -> Result<()> {
        if self.reward_sent {
            return Err(QuidProError::RewardAlreadySent {
                negotiation_id: self.id.to_string(),
            });
        }
        self.reward_sent = true;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a consumed attempt (failed nudge or failed proof).
    pub fn record_attempt(&mut self) {
        self.attempt_count += 1;
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> NegotiationRequest {
        NegotiationRequest::open(
            CounterpartyId::new(),
            ClientId::new(),
            BTreeSet::from([ActionKind::Like, ActionKind::Subscribe]),
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut req = request();
        assert_eq!(req.stage, NegotiationStage::Negotiating);
        req.transition(NegotiationStage::ProofRequested).unwrap();
        req.transition(NegotiationStage::VerifyingProof).unwrap();
        req.transition(NegotiationStage::Completed).unwrap();
        assert!(req.is_terminal());
    }

    #[test]
    fn test_rejects_unlisted_transition() {
        let mut req = request();
        let err = req.transition(NegotiationStage::Completed).unwrap_err();
        assert!(matches!(err, QuidProError::InvalidTransition { .. }));
        assert_eq!(req.stage, NegotiationStage::Negotiating);
    }

    #[test]
    fn test_terminal_is_immutable() {
        let mut req = request();
        req.transition(NegotiationStage::Failed).unwrap();
        let err = req.transition(NegotiationStage::Negotiating).unwrap_err();
        assert!(matches!(err, QuidProError::TerminalRequest { .. }));
    }

    #[test]
    fn test_reward_sent_flips_exactly_once() {
        let mut req = request();
        req.mark_reward_sent().unwrap();
        assert!(req.reward_sent);
        let err = req.mark_reward_sent().unwrap_err();
        assert!(matches!(err, QuidProError::RewardAlreadySent { .. }));
        assert!(req.reward_sent);
    }

    #[test]
    fn test_negotiating_self_loop_allowed() {
        let mut req = request();
        req.transition(NegotiationStage::Negotiating).unwrap();
        assert_eq!(req.stage, NegotiationStage::Negotiating);
    }

    #[test]
    fn test_reverify_path_allowed() {
        let mut req = request();
        req.transition(NegotiationStage::ProofRequested).unwrap();
        req.transition(NegotiationStage::VerifyingProof).unwrap();
        // unverified proof sends the request back for another proof
        req.transition(NegotiationStage::ProofRequested).unwrap();
        assert_eq!(req.stage, NegotiationStage::ProofRequested);
    }
}
