//! QuidPro Verify - Proof verification pipeline
//!
//! Wraps the external image classifier behind a fixed contract and derives
//! the single `verified` flag nothing else in the system may set. The
//! pipeline never fails a negotiation: an unreachable classifier produces
//! a degraded `verified=false` result that counts as a normal unverified
//! attempt. Every attempt - verified, unverified, or degraded - is
//! appended to the activity ledger with the proof's sha256 digest.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use quidpro_ledger::{ActivityEvent, ActivityLedger};
use quidpro_types::{ClassifierReport, NegotiationRequest, VerificationResult};

/// Classifier-facing failures. The pipeline maps all of these to a
/// degraded result; they never propagate to the negotiation flow.
#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("Classifier unreachable: {0}")]
    Unreachable(String),

    #[error("Classifier returned a malformed report: {0}")]
    Malformed(String),
}

/// External image classifier contract.
///
/// Implementations must be deterministic for identical input and model
/// version. "Model unavailable" is an `Err`, which the pipeline absorbs.
#[async_trait::async_trait]
pub trait ContentVerifier: Send + Sync {
    async fn analyze(
        &self,
        image: &[u8],
        target_reference: &str,
    ) -> Result<ClassifierReport, VerifierError>;
}

/// Policy for deriving `verified` from a classifier report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyPolicy {
    /// Minimum per-action confidence that counts as detected
    pub confidence_threshold: f64,
    /// Requested actions that must clear the threshold (clamped to the
    /// size of the requested set, so single-action exchanges stay
    /// verifiable)
    pub min_verified_actions: usize,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            min_verified_actions: 2,
        }
    }
}

/// sha256 digest of a proof image, hex-encoded.
pub fn proof_digest(image: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(image);
    hex::encode(hasher.finalize())
}

/// The verification pipeline.
pub struct VerificationPipeline {
    verifier: Arc<dyn ContentVerifier>,
    ledger: Arc<dyn ActivityLedger>,
    policy: VerifyPolicy,
}

impl VerificationPipeline {
    pub fn new(
        verifier: Arc<dyn ContentVerifier>,
        ledger: Arc<dyn ActivityLedger>,
        policy: VerifyPolicy,
    ) -> Self {
        Self {
            verifier,
            ledger,
            policy,
        }
    }

    /// Verify a proof image against the request's negotiated target.
    ///
    /// Always returns a result; classifier failures degrade rather than
    /// propagate. The attempt is recorded in the ledger either way.
    pub async fn verify(&self, request: &NegotiationRequest, image: &[u8]) -> VerificationResult {
        let target = request.target_reference.as_deref().unwrap_or_default();
        let digest = proof_digest(image);

        let result = match self.verifier.analyze(image, target).await {
            Ok(report) => self.evaluate(request, report),
            Err(err) => {
                tracing::warn!(
                    negotiation = %request.id,
                    error = %err,
                    "classifier unavailable, recording degraded result"
                );
                VerificationResult::degraded()
            }
        };

        if let Err(err) = self
            .ledger
            .append(
                request.client.clone(),
                request.counterparty.clone(),
                ActivityEvent::VerificationRecorded {
                    negotiation: request.id.clone(),
                    proof_digest: digest,
                    result: result.clone(),
                },
            )
            .await
        {
            tracing::error!(negotiation = %request.id, error = %err, "ledger append failed");
        }

        result
    }

    /// Apply the derivation rule: `content_match` AND enough requested
    /// actions clearing the confidence threshold.
    fn evaluate(&self, request: &NegotiationRequest, report: ClassifierReport) -> VerificationResult {
        let required = self
            .policy
            .min_verified_actions
            .min(request.requested_actions.len().max(1));
        let cleared = request
            .requested_actions
            .iter()
            .filter(|action| {
                report
                    .detected_actions
                    .get(action)
                    .is_some_and(|confidence| *confidence >= self.policy.confidence_threshold)
            })
            .count();

        let verified = report.content_match && cleared >= required;
        tracing::debug!(
            negotiation = %request.id,
            content_match = report.content_match,
            cleared,
            required,
            verified,
            "classifier report evaluated"
        );

        VerificationResult {
            detected_actions: report.detected_actions,
            content_match: report.content_match,
            verified,
            degraded: false,
            model_version: report.model_version,
        }
    }
}

/// Always returns the same report. Deterministic stand-in for tests and
/// simulated runs.
pub struct FixedVerifier {
    report: ClassifierReport,
}

impl FixedVerifier {
    pub fn new(report: ClassifierReport) -> Self {
        Self { report }
    }
}

#[async_trait::async_trait]
impl ContentVerifier for FixedVerifier {
    async fn analyze(
        &self,
        _image: &[u8],
        _target_reference: &str,
    ) -> Result<ClassifierReport, VerifierError> {
        Ok(self.report.clone())
    }
}

/// Replays a queue of reports in order; an exhausted queue behaves like an
/// unreachable classifier.
pub struct ScriptedVerifier {
    reports: Mutex<Vec<ClassifierReport>>,
}

impl ScriptedVerifier {
    pub fn new(reports: Vec<ClassifierReport>) -> Self {
        Self {
            reports: Mutex::new(reports),
        }
    }
}

#[async_trait::async_trait]
impl ContentVerifier for ScriptedVerifier {
    async fn analyze(
        &self,
        _image: &[u8],
        _target_reference: &str,
    ) -> Result<ClassifierReport, VerifierError> {
        let mut reports = self.reports.lock().await;
        if reports.is_empty() {
            return Err(VerifierError::Unreachable("script exhausted".to_string()));
        }
        Ok(reports.remove(0))
    }
}

/// Always unreachable.
pub struct UnreachableVerifier;

#[async_trait::async_trait]
impl ContentVerifier for UnreachableVerifier {
    async fn analyze(
        &self,
        _image: &[u8],
        _target_reference: &str,
    ) -> Result<ClassifierReport, VerifierError> {
        Err(VerifierError::Unreachable("connection refused".to_string()))
    }
}

/// Convenience for building classifier reports in tests and simulations.
pub fn report(
    detected: impl IntoIterator<Item = (quidpro_types::ActionKind, f64)>,
    content_match: bool,
) -> ClassifierReport {
    ClassifierReport {
        detected_actions: BTreeMap::from_iter(detected),
        content_match,
        model_version: "sim-1".to_string(),
    }
}
