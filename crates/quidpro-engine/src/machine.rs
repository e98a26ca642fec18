//! The negotiation state machine
//!
//! One instance drives every negotiation; all per-exchange state lives on
//! the [`NegotiationRequest`] itself. Operations return a [`Directive`]
//! telling the caller what to do next - the machine never performs I/O.

use quidpro_types::{
    ClientId, CounterpartyId, MediaRef, NegotiationRequest, NegotiationStage, QuidProError,
    VerificationResult,
};
use thiserror::Error;

use crate::extract::{extract_actions, extract_target};
use crate::policy::EnginePolicy;
use crate::templates;

/// Errors from feeding the machine an input its current stage rejects.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Proof submitted while negotiation is in stage {stage:?}")]
    UnexpectedProof { stage: NegotiationStage },

    #[error("Verification verdict applied while negotiation is in stage {stage:?}")]
    UnexpectedVerdict { stage: NegotiationStage },

    #[error("Proof accepted but no target reference was captured")]
    MissingTarget,

    #[error(transparent)]
    Domain(#[from] QuidProError),
}

/// What the caller must do after an input was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Send this text to the counterparty
    Reply(String),
    /// Stage moved to `Completed`: dispatch the reward, then send this text
    Reward { reply: String },
    /// Stage moved to `Failed`: send this closing text, then archive
    Close(String),
    /// Drop the input (mid-verification or terminal request)
    Ignore,
}

/// A proof image handed off for classification.
#[derive(Debug, Clone, PartialEq)]
pub struct ProofJob {
    pub media: MediaRef,
    pub target: String,
}

/// Per-counterparty finite-state logic driving message generation and
/// transition decisions.
#[derive(Debug, Clone, Default)]
pub struct NegotiationStateMachine {
    policy: EnginePolicy,
}

impl NegotiationStateMachine {
    pub fn new(policy: EnginePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &EnginePolicy {
        &self.policy
    }

    /// First qualifying contact: open a request in `Negotiating` and emit
    /// the exchange proposal.
    pub fn open(
        &self,
        counterparty: CounterpartyId,
        client: ClientId,
        text: &str,
    ) -> (NegotiationRequest, String) {
        let mut actions = extract_actions(text);
        if actions.is_empty() {
            actions = self.policy.default_actions.clone();
        }
        let request = NegotiationRequest::open(counterparty, client, actions);
        tracing::debug!(
            negotiation = %request.id,
            actions = ?request.requested_actions,
            "opened negotiation"
        );
        let reply = templates::proposal(&request.requested_actions);
        (request, reply)
    }

    /// A text message arrived for an existing negotiation.
    pub fn advance(
        &self,
        request: &mut NegotiationRequest,
        text: &str,
    ) -> Result<Directive, EngineError> {
        match request.stage {
            NegotiationStage::Negotiating => {
                if let Some(target) = extract_target(text) {
                    request.target_reference = Some(target.clone());
                    request.transition(NegotiationStage::ProofRequested)?;
                    tracing::debug!(negotiation = %request.id, %target, "target captured");
                    Ok(Directive::Reply(templates::proof_instructions(&target)))
                } else {
                    request.record_attempt();
                    if request.attempt_count >= self.policy.max_attempts {
                        request.transition(NegotiationStage::Failed)?;
                        tracing::info!(negotiation = %request.id, "attempts exhausted without target");
                        Ok(Directive::Close(templates::closing()))
                    } else {
                        request.transition(NegotiationStage::Negotiating)?;
                        Ok(Directive::Reply(templates::nudge(
                            request.attempt_count,
                            self.policy.max_attempts,
                        )))
                    }
                }
            }
            NegotiationStage::ProofRequested => {
                Ok(Directive::Reply(templates::proof_reminder()))
            }
            NegotiationStage::VerifyingProof => {
                tracing::debug!(negotiation = %request.id, "message ignored mid-verification");
                Ok(Directive::Ignore)
            }
            _ => Ok(Directive::Ignore),
        }
    }

    /// A proof image arrived. Valid only from `ProofRequested`.
    pub fn accept_proof(
        &self,
        request: &mut NegotiationRequest,
        media: MediaRef,
    ) -> Result<ProofJob, EngineError> {
        if request.stage != NegotiationStage::ProofRequested {
            return Err(EngineError::UnexpectedProof {
                stage: request.stage,
            });
        }
        let target = request
            .target_reference
            .clone()
            .ok_or(EngineError::MissingTarget)?;
        request.last_proof = Some(media.clone());
        request.transition(NegotiationStage::VerifyingProof)?;
        Ok(ProofJob { media, target })
    }

    /// The classifier verdict came back. Valid only from `VerifyingProof`.
    pub fn apply_verification(
        &self,
        request: &mut NegotiationRequest,
        result: VerificationResult,
    ) -> Result<Directive, EngineError> {
        if request.stage != NegotiationStage::VerifyingProof {
            return Err(EngineError::UnexpectedVerdict {
                stage: request.stage,
            });
        }
        let verified = result.verified;
        request.verification = Some(result);
        if verified {
            request.transition(NegotiationStage::Completed)?;
            tracing::info!(negotiation = %request.id, "proof verified, reward owed");
            Ok(Directive::Reward {
                reply: templates::success(&request.requested_actions),
            })
        } else {
            request.record_attempt();
            if request.attempt_count >= self.policy.max_attempts {
                request.transition(NegotiationStage::Failed)?;
                tracing::info!(negotiation = %request.id, "proof attempts exhausted");
                Ok(Directive::Close(templates::closing()))
            } else {
                request.transition(NegotiationStage::ProofRequested)?;
                Ok(Directive::Reply(templates::proof_retry(
                    request.attempt_count,
                    self.policy.max_attempts,
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quidpro_types::ActionKind;
    use std::collections::BTreeMap;

    fn machine() -> NegotiationStateMachine {
        NegotiationStateMachine::default()
    }

    fn unverified() -> VerificationResult {
        VerificationResult {
            detected_actions: BTreeMap::new(),
            content_match: false,
            verified: false,
            degraded: false,
            model_version: "test-1".to_string(),
        }
    }

    fn verified() -> VerificationResult {
        VerificationResult {
            detected_actions: BTreeMap::from([
                (ActionKind::Like, 0.97),
                (ActionKind::Subscribe, 0.93),
            ]),
            content_match: true,
            verified: true,
            degraded: false,
            model_version: "test-1".to_string(),
        }
    }

    #[test]
    fn test_first_contact_opens_negotiating_with_proposal() {
        let (request, reply) = machine().open(
            CounterpartyId::new(),
            ClientId::new(),
            "like4like, here's my channel",
        );
        assert_eq!(request.stage, NegotiationStage::Negotiating);
        assert!(request.requested_actions.contains(&ActionKind::Like));
        assert!(reply.contains("like"));
    }

    #[test]
    fn test_greeting_without_actions_uses_defaults() {
        let (request, _) = machine().open(CounterpartyId::new(), ClientId::new(), "wanna trade?");
        assert_eq!(
            request.requested_actions,
            EnginePolicy::default().default_actions
        );
    }

    #[test]
    fn test_url_moves_to_proof_requested() {
        let m = machine();
        let (mut request, _) = m.open(CounterpartyId::new(), ClientId::new(), "sub4sub");
        let directive = m
            .advance(&mut request, "here: https://videos.example/v/42")
            .unwrap();
        assert_eq!(request.stage, NegotiationStage::ProofRequested);
        assert_eq!(
            request.target_reference.as_deref(),
            Some("https://videos.example/v/42")
        );
        assert!(matches!(directive, Directive::Reply(text) if text.contains("screenshot")));
    }

    #[test]
    fn test_nudges_then_close_without_target() {
        let m = machine();
        let (mut request, _) = m.open(CounterpartyId::new(), ClientId::new(), "like4like");
        for _ in 0..2 {
            let directive = m.advance(&mut request, "soon, promise").unwrap();
            assert!(matches!(directive, Directive::Reply(_)));
        }
        let directive = m.advance(&mut request, "still nothing").unwrap();
        assert!(matches!(directive, Directive::Close(_)));
        assert_eq!(request.stage, NegotiationStage::Failed);
        assert_eq!(request.attempt_count, 3);
    }

    #[test]
    fn test_proof_only_accepted_from_proof_requested() {
        let m = machine();
        let (mut request, _) = m.open(CounterpartyId::new(), ClientId::new(), "like4like");
        let err = m
            .accept_proof(&mut request, MediaRef::new("media-1"))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnexpectedProof { .. }));
    }

    #[test]
    fn test_verified_proof_completes_with_reward() {
        let m = machine();
        let (mut request, _) = m.open(CounterpartyId::new(), ClientId::new(), "like4like");
        m.advance(&mut request, "https://videos.example/v/42").unwrap();
        let job = m.accept_proof(&mut request, MediaRef::new("media-1")).unwrap();
        assert_eq!(job.target, "https://videos.example/v/42");
        assert_eq!(request.stage, NegotiationStage::VerifyingProof);

        let directive = m.apply_verification(&mut request, verified()).unwrap();
        assert_eq!(request.stage, NegotiationStage::Completed);
        assert!(matches!(directive, Directive::Reward { .. }));
        assert!(!request.reward_sent);
    }

    #[test]
    fn test_three_failed_proofs_close_the_exchange() {
        let m = machine();
        let (mut request, _) = m.open(CounterpartyId::new(), ClientId::new(), "like4like");
        m.advance(&mut request, "https://videos.example/v/42").unwrap();

        for round in 1..=3u32 {
            m.accept_proof(&mut request, MediaRef::new(format!("media-{round}")))
                .unwrap();
            let directive = m.apply_verification(&mut request, unverified()).unwrap();
            if round < 3 {
                assert_eq!(request.stage, NegotiationStage::ProofRequested);
                assert!(matches!(directive, Directive::Reply(_)));
            } else {
                assert_eq!(request.stage, NegotiationStage::Failed);
                assert!(matches!(directive, Directive::Close(_)));
            }
        }
        assert_eq!(request.attempt_count, 3);
        assert!(!request.reward_sent);
    }

    #[test]
    fn test_messages_ignored_mid_verification() {
        let m = machine();
        let (mut request, _) = m.open(CounterpartyId::new(), ClientId::new(), "like4like");
        m.advance(&mut request, "https://videos.example/v/42").unwrap();
        m.accept_proof(&mut request, MediaRef::new("media-1")).unwrap();

        let directive = m.advance(&mut request, "did it work??").unwrap();
        assert_eq!(directive, Directive::Ignore);
        assert_eq!(request.stage, NegotiationStage::VerifyingProof);
    }

    #[test]
    fn test_text_while_waiting_for_proof_gets_reminder() {
        let m = machine();
        let (mut request, _) = m.open(CounterpartyId::new(), ClientId::new(), "like4like");
        m.advance(&mut request, "https://videos.example/v/42").unwrap();
        let attempts_before = request.attempt_count;

        let directive = m.advance(&mut request, "ok doing it now").unwrap();
        assert!(matches!(directive, Directive::Reply(text) if text.contains("screenshot")));
        assert_eq!(request.attempt_count, attempts_before);
    }
}
