//! Negotiation manager
//!
//! Owns the map of active negotiations keyed by counterparty. Every
//! request mutation happens while holding that counterparty's lock; the
//! lock is released during classifier calls so a shutdown drain can still
//! reach the entry. All outbound actions - messages and rewards alike -
//! pass through the rate limiter first; denied actions land in a deferred
//! outbox and are retried, never dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use quidpro_engine::{is_exchange_greeting, Directive, EnginePolicy, NegotiationStateMachine, ProofJob};
use quidpro_ledger::{ActivityEvent, ActivityLedger};
use quidpro_throttle::{RateLimiter, ThrottleConfig};
use quidpro_types::{
    AccountAgeTier, ClientId, ClientProfile, CounterpartyId, NegotiationId, NegotiationRequest,
    NegotiationStage, VerificationResult,
};
use quidpro_verify::{
    proof_digest, ContentVerifier, VerificationPipeline, VerifyPolicy,
};

use crate::alerts::AlertSink;
use crate::reward::{RewardConfig, RewardDispatcher, RewardSender};
use crate::transport::{ChatTransport, InboundMessage};

/// Manager configuration.
#[derive(Clone)]
pub struct ManagerConfig {
    /// Start in live mode (default: simulated)
    pub live: bool,
    /// Upper bound on one download-and-classify pass
    pub verify_timeout: Duration,
    pub engine: EnginePolicy,
    pub verify: VerifyPolicy,
    pub throttle: ThrottleConfig,
    pub reward: RewardConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            live: false,
            verify_timeout: Duration::from_secs(8),
            engine: EnginePolicy::default(),
            verify: VerifyPolicy::default(),
            throttle: ThrottleConfig::default(),
            reward: RewardConfig::default(),
        }
    }
}

/// An action the throttle (or a retriable transport fault) pushed back.
#[derive(Debug, Clone)]
enum DeferredAction {
    Message {
        client: ClientId,
        counterparty: CounterpartyId,
        text: String,
    },
    Reward {
        counterparty: CounterpartyId,
    },
}

/// Decrements the in-flight verification counter even if the holding
/// future is dropped.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owns all active negotiations and drives them through the state machine.
pub struct NegotiationManager {
    machine: NegotiationStateMachine,
    pipeline: VerificationPipeline,
    limiter: RateLimiter,
    ledger: Arc<dyn ActivityLedger>,
    transport: Arc<dyn ChatTransport>,
    rewards: RewardSender,
    verify_timeout: Duration,
    profiles: DashMap<ClientId, ClientProfile>,
    requests: DashMap<CounterpartyId, Arc<Mutex<NegotiationRequest>>>,
    archive: Mutex<Vec<NegotiationRequest>>,
    live: AtomicBool,
    verifying: Arc<AtomicUsize>,
    outbox: Mutex<VecDeque<DeferredAction>>,
}

impl NegotiationManager {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        verifier: Arc<dyn ContentVerifier>,
        dispatcher: Arc<dyn RewardDispatcher>,
        alerts: Arc<dyn AlertSink>,
        ledger: Arc<dyn ActivityLedger>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            machine: NegotiationStateMachine::new(config.engine),
            pipeline: VerificationPipeline::new(verifier, ledger.clone(), config.verify),
            limiter: RateLimiter::new(config.throttle),
            rewards: RewardSender::new(dispatcher, alerts, ledger.clone(), config.reward),
            ledger,
            transport,
            verify_timeout: config.verify_timeout,
            profiles: DashMap::new(),
            requests: DashMap::new(),
            archive: Mutex::new(Vec::new()),
            live: AtomicBool::new(config.live),
            verifying: Arc::new(AtomicUsize::new(0)),
            outbox: Mutex::new(VecDeque::new()),
        }
    }

    /// Register a client account before routing its messages.
    pub fn register_client(&self, profile: ClientProfile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    /// The live-mode switch. Off means transport sends and reward
    /// dispatches are recorded in the ledger instead of performed.
    pub fn set_live(&self, live: bool) {
        tracing::info!(live, "live mode switched");
        self.live.store(live, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// In-flight verification count, used by the shutdown drain.
    pub fn verifying_in_flight(&self) -> usize {
        self.verifying.load(Ordering::SeqCst)
    }

    /// Current state of a counterparty's negotiation, if any.
    pub async fn request_snapshot(&self, counterparty: &CounterpartyId) -> Option<NegotiationRequest> {
        let slot = self.requests.get(counterparty).map(|e| e.value().clone())?;
        let request = slot.lock().await;
        Some(request.clone())
    }

    /// Terminal requests displaced by a later first contact.
    pub async fn archived(&self) -> Vec<NegotiationRequest> {
        self.archive.lock().await.clone()
    }

    /// Route one inbound message. All faults are handled here; a bad
    /// message or counterparty never poisons the calling client task.
    pub async fn handle_message(&self, message: InboundMessage) {
        let Some(tier) = self
            .profiles
            .get(&message.client)
            .map(|p| p.age_tier(Utc::now()))
        else {
            tracing::warn!(client = %message.client, "message for unregistered client dropped");
            return;
        };

        let existing = self
            .requests
            .get(&message.counterparty)
            .map(|e| e.value().clone());

        match existing {
            Some(slot) => self.handle_for_existing(slot, message, tier).await,
            None => self.open_if_greeting(message, tier).await,
        }
    }

    async fn handle_for_existing(
        &self,
        slot: Arc<Mutex<NegotiationRequest>>,
        message: InboundMessage,
        tier: AccountAgeTier,
    ) {
        let mut request = slot.lock().await;

        if request.is_terminal() {
            // archive the closed exchange and start over on a fresh greeting
            let is_greeting = message
                .text
                .as_deref()
                .map(is_exchange_greeting)
                .unwrap_or(false);
            if !is_greeting {
                tracing::debug!(counterparty = %message.counterparty, "message for archived exchange ignored");
                return;
            }
            self.archive.lock().await.push(request.clone());
            let text = message.text.as_deref().unwrap_or_default();
            let (fresh, reply) =
                self.machine
                    .open(message.counterparty.clone(), message.client.clone(), text);
            let negotiation = fresh.id.clone();
            let actions = fresh.requested_actions.iter().copied().collect();
            *request = fresh;
            drop(request);
            self.record(
                &message.client,
                &message.counterparty,
                ActivityEvent::RequestOpened {
                    negotiation: negotiation.clone(),
                    requested_actions: actions,
                },
            )
            .await;
            self.record(
                &message.client,
                &message.counterparty,
                ActivityEvent::ProposalSent { negotiation },
            )
            .await;
            self.send_gated(&message.client, &message.counterparty, reply, tier)
                .await;
            return;
        }

        if let Some(media) = message.media.clone() {
            let job = match self.machine.accept_proof(&mut request, media) {
                Ok(job) => job,
                Err(err) => {
                    tracing::debug!(
                        counterparty = %message.counterparty,
                        error = %err,
                        "proof image ignored"
                    );
                    return;
                }
            };
            let snapshot = request.clone();
            drop(request);

            // classify without the lock so drain/force-fail can reach the entry
            let result = {
                let _guard = InFlightGuard::enter(&self.verifying);
                self.run_verification(&snapshot, &job).await
            };

            let mut request = slot.lock().await;
            match self.machine.apply_verification(&mut request, result) {
                Ok(Directive::Reward { reply }) => {
                    self.record(
                        &request.client,
                        &request.counterparty,
                        ActivityEvent::Completed {
                            negotiation: request.id.clone(),
                        },
                    )
                    .await;
                    self.dispatch_reward(&mut request, tier).await;
                    let (client, counterparty) = (request.client.clone(), request.counterparty.clone());
                    drop(request);
                    self.send_gated(&client, &counterparty, reply, tier).await;
                }
                Ok(Directive::Reply(reply)) => {
                    let (client, counterparty) = (request.client.clone(), request.counterparty.clone());
                    drop(request);
                    self.send_gated(&client, &counterparty, reply, tier).await;
                }
                Ok(Directive::Close(reply)) => {
                    self.record(
                        &request.client,
                        &request.counterparty,
                        ActivityEvent::Failed {
                            negotiation: request.id.clone(),
                            reason: "proof attempts exhausted".to_string(),
                        },
                    )
                    .await;
                    let (client, counterparty) = (request.client.clone(), request.counterparty.clone());
                    drop(request);
                    self.send_gated(&client, &counterparty, reply, tier).await;
                }
                Ok(Directive::Ignore) => {}
                Err(err) => {
                    // force-failed while we were classifying; the verdict is moot
                    tracing::debug!(
                        counterparty = %message.counterparty,
                        error = %err,
                        "verification verdict discarded"
                    );
                }
            }
            return;
        }

        if let Some(text) = message.text.as_deref() {
            let had_target = request.target_reference.is_some();
            match self.machine.advance(&mut request, text) {
                Ok(Directive::Reply(reply)) => {
                    if !had_target && request.target_reference.is_some() {
                        self.record(
                            &request.client,
                            &request.counterparty,
                            ActivityEvent::TargetCaptured {
                                negotiation: request.id.clone(),
                                target: request.target_reference.clone().unwrap_or_default(),
                            },
                        )
                        .await;
                    } else if request.stage == NegotiationStage::Negotiating {
                        self.record(
                            &request.client,
                            &request.counterparty,
                            ActivityEvent::NudgeSent {
                                negotiation: request.id.clone(),
                                attempt: request.attempt_count,
                            },
                        )
                        .await;
                    }
                    let (client, counterparty) = (request.client.clone(), request.counterparty.clone());
                    drop(request);
                    self.send_gated(&client, &counterparty, reply, tier).await;
                }
                Ok(Directive::Close(reply)) => {
                    self.record(
                        &request.client,
                        &request.counterparty,
                        ActivityEvent::Failed {
                            negotiation: request.id.clone(),
                            reason: "no target supplied".to_string(),
                        },
                    )
                    .await;
                    let (client, counterparty) = (request.client.clone(), request.counterparty.clone());
                    drop(request);
                    self.send_gated(&client, &counterparty, reply, tier).await;
                }
                Ok(Directive::Reward { .. }) => {
                    // advance never completes an exchange
                    tracing::error!(counterparty = %message.counterparty, "unexpected reward directive");
                }
                Ok(Directive::Ignore) => {}
                Err(err) => {
                    tracing::debug!(counterparty = %message.counterparty, error = %err, "message rejected");
                }
            }
        }
    }

    async fn open_if_greeting(&self, message: InboundMessage, tier: AccountAgeTier) {
        let Some(text) = message.text.as_deref() else {
            tracing::debug!(counterparty = %message.counterparty, "media without an active exchange ignored");
            return;
        };
        if !is_exchange_greeting(text) {
            tracing::debug!(counterparty = %message.counterparty, "non-exchange message ignored");
            return;
        }

        let (request, reply) =
            self.machine
                .open(message.counterparty.clone(), message.client.clone(), text);
        let negotiation = request.id.clone();
        let actions = request.requested_actions.iter().copied().collect();
        let slot = Arc::new(Mutex::new(request));
        if self
            .requests
            .insert(message.counterparty.clone(), slot)
            .is_some()
        {
            tracing::warn!(counterparty = %message.counterparty, "concurrent open replaced an entry");
        }

        self.record(
            &message.client,
            &message.counterparty,
            ActivityEvent::RequestOpened {
                negotiation: negotiation.clone(),
                requested_actions: actions,
            },
        )
        .await;
        self.record(
            &message.client,
            &message.counterparty,
            ActivityEvent::ProposalSent { negotiation },
        )
        .await;
        self.send_gated(&message.client, &message.counterparty, reply, tier)
            .await;
    }

    async fn run_verification(
        &self,
        snapshot: &NegotiationRequest,
        job: &ProofJob,
    ) -> VerificationResult {
        let work = async {
            match self.transport.download_media(&job.media).await {
                Ok(bytes) => {
                    self.record(
                        &snapshot.client,
                        &snapshot.counterparty,
                        ActivityEvent::ProofReceived {
                            negotiation: snapshot.id.clone(),
                            proof_digest: proof_digest(&bytes),
                        },
                    )
                    .await;
                    self.pipeline.verify(snapshot, &bytes).await
                }
                Err(err) => {
                    tracing::warn!(
                        negotiation = %snapshot.id,
                        error = %err,
                        "proof download failed, treating as unverified"
                    );
                    VerificationResult::degraded()
                }
            }
        };

        match tokio::time::timeout(self.verify_timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(negotiation = %snapshot.id, "verification timed out");
                VerificationResult::degraded()
            }
        }
    }

    async fn dispatch_reward(&self, request: &mut NegotiationRequest, tier: AccountAgeTier) {
        if self.limiter.allow(&request.client, tier).await {
            self.rewards.send(request, self.is_live()).await;
        } else {
            self.record(
                &request.client,
                &request.counterparty,
                ActivityEvent::ActionDeferred {
                    negotiation: request.id.clone(),
                    description: "reward dispatch".to_string(),
                },
            )
            .await;
            self.outbox.lock().await.push_back(DeferredAction::Reward {
                counterparty: request.counterparty.clone(),
            });
        }
    }

    /// Gate an outbound text through the throttle, the live switch, and
    /// the transport, deferring whenever any of them says not now.
    async fn send_gated(
        &self,
        client: &ClientId,
        counterparty: &CounterpartyId,
        text: String,
        tier: AccountAgeTier,
    ) {
        if !self.limiter.allow(client, tier).await {
            if let Some(negotiation) = self.negotiation_id(counterparty).await {
                self.record(
                    client,
                    counterparty,
                    ActivityEvent::ActionDeferred {
                        negotiation,
                        description: "outbound message".to_string(),
                    },
                )
                .await;
            }
            self.outbox.lock().await.push_back(DeferredAction::Message {
                client: client.clone(),
                counterparty: counterparty.clone(),
                text,
            });
            return;
        }
        self.send_now(client, counterparty, text).await;
    }

    async fn send_now(&self, client: &ClientId, counterparty: &CounterpartyId, text: String) {
        if !self.is_live() {
            if let Some(negotiation) = self.negotiation_id(counterparty).await {
                self.record(
                    client,
                    counterparty,
                    ActivityEvent::Simulated {
                        negotiation,
                        description: "outbound message".to_string(),
                    },
                )
                .await;
            }
            return;
        }
        match self.transport.send(client, counterparty, &text).await {
            Ok(()) => {}
            Err(err) if err.is_retriable() => {
                tracing::warn!(counterparty = %counterparty, error = %err, "send deferred");
                self.outbox.lock().await.push_back(DeferredAction::Message {
                    client: client.clone(),
                    counterparty: counterparty.clone(),
                    text,
                });
            }
            Err(err) => {
                tracing::error!(counterparty = %counterparty, error = %err, "send aborted");
            }
        }
    }

    /// Retry deferred actions. Called periodically by the coordinator.
    pub async fn drain_outbox(&self) {
        let pending: Vec<DeferredAction> = {
            let mut outbox = self.outbox.lock().await;
            outbox.drain(..).collect()
        };
        if pending.is_empty() {
            return;
        }
        tracing::debug!(count = pending.len(), "draining deferred actions");

        for action in pending {
            match action {
                DeferredAction::Message {
                    client,
                    counterparty,
                    text,
                } => {
                    let Some(tier) = self.profiles.get(&client).map(|p| p.age_tier(Utc::now()))
                    else {
                        continue;
                    };
                    if self.limiter.allow(&client, tier).await {
                        self.send_now(&client, &counterparty, text).await;
                    } else {
                        self.outbox.lock().await.push_back(DeferredAction::Message {
                            client,
                            counterparty,
                            text,
                        });
                    }
                }
                DeferredAction::Reward { counterparty } => {
                    let Some(slot) = self.requests.get(&counterparty).map(|e| e.value().clone())
                    else {
                        continue;
                    };
                    let mut request = slot.lock().await;
                    let Some(tier) = self
                        .profiles
                        .get(&request.client)
                        .map(|p| p.age_tier(Utc::now()))
                    else {
                        continue;
                    };
                    if self.limiter.allow(&request.client, tier).await {
                        self.rewards.send(&mut request, self.is_live()).await;
                    } else {
                        self.outbox.lock().await.push_back(DeferredAction::Reward {
                            counterparty: counterparty.clone(),
                        });
                    }
                }
            }
        }
    }

    /// Force-fail every request still mid-verification. Called by the
    /// coordinator when the drain timeout expires.
    pub async fn force_fail_pending(&self) {
        let slots: Vec<(CounterpartyId, Arc<Mutex<NegotiationRequest>>)> = self
            .requests
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (counterparty, slot) in slots {
            let mut request = slot.lock().await;
            if request.stage != NegotiationStage::VerifyingProof {
                continue;
            }
            if request.transition(NegotiationStage::Failed).is_ok() {
                tracing::warn!(counterparty = %counterparty, "in-flight verification force-failed");
                self.record(
                    &request.client,
                    &counterparty,
                    ActivityEvent::ForceFailed {
                        negotiation: request.id.clone(),
                    },
                )
                .await;
            }
        }
    }

    async fn negotiation_id(&self, counterparty: &CounterpartyId) -> Option<NegotiationId> {
        let slot = self.requests.get(counterparty).map(|e| e.value().clone())?;
        let request = slot.lock().await;
        Some(request.id.clone())
    }

    async fn record(&self, client: &ClientId, counterparty: &CounterpartyId, event: ActivityEvent) {
        if let Err(err) = self
            .ledger
            .append(client.clone(), counterparty.clone(), event)
            .await
        {
            tracing::error!(counterparty = %counterparty, error = %err, "ledger append failed");
        }
    }
}
