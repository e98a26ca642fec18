//! Reward dispatch - the idempotent boundary
//!
//! The dispatcher is NOT assumed idempotent, so at-most-once is enforced
//! here: `reward_sent` flips exactly once, and a request whose dispatch
//! ultimately fails stays `Completed` with the flag unset - failing to
//! reward a valid proof is an operational fault, not a negotiation fault.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;

use quidpro_ledger::{ActivityEvent, ActivityLedger};
use quidpro_types::{ActionKind, NegotiationRequest, NegotiationStage};

use crate::alerts::{Alert, AlertSink};

/// Dispatcher-facing failures.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Dispatcher unavailable: {0}")]
    Unavailable(String),

    #[error("Dispatcher rejected {action} on {target}")]
    Rejected { action: ActionKind, target: String },
}

/// Reciprocal-action dispatcher contract. One call per requested action
/// kind; `Ok(true)` means the action landed.
#[async_trait::async_trait]
pub trait RewardDispatcher: Send + Sync {
    async fn apply(&self, action: ActionKind, target: &str) -> Result<bool, DispatchError>;
}

/// Retry policy for reward dispatch.
#[derive(Debug, Clone)]
pub struct RewardConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Sends the reward for a completed negotiation at most once.
pub struct RewardSender {
    dispatcher: Arc<dyn RewardDispatcher>,
    alerts: Arc<dyn AlertSink>,
    ledger: Arc<dyn ActivityLedger>,
    config: RewardConfig,
}

impl RewardSender {
    pub fn new(
        dispatcher: Arc<dyn RewardDispatcher>,
        alerts: Arc<dyn AlertSink>,
        ledger: Arc<dyn ActivityLedger>,
        config: RewardConfig,
    ) -> Self {
        Self {
            dispatcher,
            alerts,
            ledger,
            config,
        }
    }

    /// Dispatch the reward for `request`. Safe to call repeatedly: once
    /// `reward_sent` is set the dispatcher is never touched again.
    ///
    /// Returns whether the reward is (now or already) sent. In simulated
    /// mode the dispatch is recorded, not performed.
    pub async fn send(&self, request: &mut NegotiationRequest, live: bool) -> bool {
        if request.stage != NegotiationStage::Completed {
            tracing::warn!(
                negotiation = %request.id,
                stage = ?request.stage,
                "reward requested outside Completed, refusing"
            );
            return false;
        }
        if request.reward_sent {
            return true;
        }
        let target = match request.target_reference.clone() {
            Some(target) => target,
            None => {
                tracing::error!(negotiation = %request.id, "completed request with no target");
                return false;
            }
        };

        if !live {
            if request.mark_reward_sent().is_ok() {
                self.record(
                    request,
                    ActivityEvent::Simulated {
                        negotiation: request.id.clone(),
                        description: format!(
                            "reward dispatch of {:?} to {target}",
                            request.requested_actions
                        ),
                    },
                )
                .await;
            }
            return true;
        }

        for attempt in 0..=self.config.max_retries {
            match self.apply_all(request, &target).await {
                Ok(()) => {
                    if request.mark_reward_sent().is_err() {
                        // lost a race we should never be in; the flag wins
                        return true;
                    }
                    self.record(
                        request,
                        ActivityEvent::RewardDispatched {
                            negotiation: request.id.clone(),
                            actions: request.requested_actions.iter().copied().collect(),
                        },
                    )
                    .await;
                    return true;
                }
                Err(err) => {
                    tracing::warn!(
                        negotiation = %request.id,
                        attempt,
                        error = %err,
                        "reward dispatch failed"
                    );
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        self.record(
            request,
            ActivityEvent::RewardFailed {
                negotiation: request.id.clone(),
                reason: "dispatch retries exhausted".to_string(),
            },
        )
        .await;
        self.alerts
            .escalate(Alert::critical(
                format!("reward dispatch exhausted retries for {target}"),
                Some(request.id.clone()),
            ))
            .await;
        false
    }

    async fn apply_all(
        &self,
        request: &NegotiationRequest,
        target: &str,
    ) -> Result<(), DispatchError> {
        for action in &request.requested_actions {
            match self.dispatcher.apply(*action, target).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(DispatchError::Rejected {
                        action: *action,
                        target: target.to_string(),
                    })
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
        (exp + jitter).min(self.config.max_delay)
    }

    async fn record(&self, request: &NegotiationRequest, event: ActivityEvent) {
        if let Err(err) = self
            .ledger
            .append(request.client.clone(), request.counterparty.clone(), event)
            .await
        {
            tracing::error!(negotiation = %request.id, error = %err, "ledger append failed");
        }
    }
}

/// Recording dispatcher for tests and the simulator; optionally fails the
/// first `fail_first` calls to exercise the retry path.
#[derive(Default)]
pub struct RecordingDispatcher {
    calls: Mutex<Vec<(ActionKind, String)>>,
    fail_first: Mutex<u32>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(fail_first: u32) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_first: Mutex::new(fail_first),
        }
    }

    pub async fn calls(&self) -> Vec<(ActionKind, String)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl RewardDispatcher for RecordingDispatcher {
    async fn apply(&self, action: ActionKind, target: &str) -> Result<bool, DispatchError> {
        {
            let mut remaining = self.fail_first.lock().await;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DispatchError::Unavailable("scripted outage".to_string()));
            }
        }
        self.calls
            .lock()
            .await
            .push((action, target.to_string()));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertSeverity, RecordingAlerts};
    use quidpro_ledger::InMemoryLedger;
    use quidpro_types::{ClientId, CounterpartyId};
    use std::collections::BTreeSet;

    fn completed_request() -> NegotiationRequest {
        let mut req = NegotiationRequest::open(
            CounterpartyId::new(),
            ClientId::new(),
            BTreeSet::from([ActionKind::Like, ActionKind::Subscribe]),
        );
        req.target_reference = Some("https://videos.example/v/42".to_string());
        req.transition(NegotiationStage::ProofRequested).unwrap();
        req.transition(NegotiationStage::VerifyingProof).unwrap();
        req.transition(NegotiationStage::Completed).unwrap();
        req
    }

    fn sender(
        dispatcher: Arc<RecordingDispatcher>,
        alerts: Arc<RecordingAlerts>,
    ) -> (RewardSender, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::default());
        (
            RewardSender::new(
                dispatcher,
                alerts,
                ledger.clone(),
                RewardConfig {
                    max_retries: 2,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                },
            ),
            ledger,
        )
    }

    #[tokio::test]
    async fn test_reward_sent_exactly_once() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let alerts = Arc::new(RecordingAlerts::new());
        let (sender, _) = sender(dispatcher.clone(), alerts);
        let mut req = completed_request();

        assert!(sender.send(&mut req, true).await);
        assert!(req.reward_sent);
        // retries are no-ops once the flag is set
        assert!(sender.send(&mut req, true).await);
        assert!(sender.send(&mut req, true).await);

        // one dispatcher call per requested action, no more
        assert_eq!(dispatcher.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_refuses_outside_completed() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let alerts = Arc::new(RecordingAlerts::new());
        let (sender, _) = sender(dispatcher.clone(), alerts);

        let mut req = NegotiationRequest::open(
            CounterpartyId::new(),
            ClientId::new(),
            BTreeSet::from([ActionKind::Like]),
        );
        assert!(!sender.send(&mut req, true).await);
        assert!(dispatcher.calls().await.is_empty());
        assert!(!req.reward_sent);
    }

    #[tokio::test]
    async fn test_transient_outage_is_retried() {
        let dispatcher = Arc::new(RecordingDispatcher::failing(1));
        let alerts = Arc::new(RecordingAlerts::new());
        let (sender, ledger) = sender(dispatcher.clone(), alerts);
        let mut req = completed_request();

        assert!(sender.send(&mut req, true).await);
        assert!(req.reward_sent);
        let entries = ledger.entries_for_counterparty(&req.counterparty).await;
        assert!(entries
            .iter()
            .any(|e| matches!(e.event, ActivityEvent::RewardDispatched { .. })));
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate_and_stay_completed() {
        let dispatcher = Arc::new(RecordingDispatcher::failing(100));
        let alerts = Arc::new(RecordingAlerts::new());
        let (sender, ledger) = sender(dispatcher.clone(), alerts.clone());
        let mut req = completed_request();

        assert!(!sender.send(&mut req, true).await);
        assert_eq!(req.stage, NegotiationStage::Completed);
        assert!(!req.reward_sent);

        let raised = alerts.alerts().await;
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].severity, AlertSeverity::Critical);

        let entries = ledger.entries_for_counterparty(&req.counterparty).await;
        assert!(entries
            .iter()
            .any(|e| matches!(e.event, ActivityEvent::RewardFailed { .. })));
    }

    #[tokio::test]
    async fn test_simulated_mode_never_touches_dispatcher() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let alerts = Arc::new(RecordingAlerts::new());
        let (sender, ledger) = sender(dispatcher.clone(), alerts);
        let mut req = completed_request();

        assert!(sender.send(&mut req, false).await);
        assert!(req.reward_sent);
        assert!(dispatcher.calls().await.is_empty());

        let entries = ledger.entries_for_counterparty(&req.counterparty).await;
        assert!(entries
            .iter()
            .any(|e| matches!(e.event, ActivityEvent::Simulated { .. })));
    }
}
