//! QuidPro Ledger - Append-only activity record
//!
//! Every negotiation event lands here: proposals, nudges, captured targets,
//! verification attempts, reward dispatches, failures. The log is
//! append-only and hash-chained so an export can be audited (or replayed
//! for offline classifier retraining) after the fact.
//!
//! Raw proof images are never stored - only their sha256 digest travels
//! with the verification record. Retention is bounded: once `max_entries`
//! is exceeded the oldest entries are evicted, and chain verification
//! re-anchors at the oldest retained entry.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use quidpro_types::{
    ActionKind, ClientId, CounterpartyId, LedgerEntryId, NegotiationId, VerificationResult,
};

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger append failed: {0}")]
    Append(String),
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Everything worth recording about an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityEvent {
    RequestOpened {
        negotiation: NegotiationId,
        requested_actions: Vec<ActionKind>,
    },
    ProposalSent {
        negotiation: NegotiationId,
    },
    NudgeSent {
        negotiation: NegotiationId,
        attempt: u32,
    },
    TargetCaptured {
        negotiation: NegotiationId,
        target: String,
    },
    ProofReceived {
        negotiation: NegotiationId,
        proof_digest: String,
    },
    VerificationRecorded {
        negotiation: NegotiationId,
        proof_digest: String,
        result: VerificationResult,
    },
    RewardDispatched {
        negotiation: NegotiationId,
        actions: Vec<ActionKind>,
    },
    RewardFailed {
        negotiation: NegotiationId,
        reason: String,
    },
    ActionDeferred {
        negotiation: NegotiationId,
        description: String,
    },
    Completed {
        negotiation: NegotiationId,
    },
    Failed {
        negotiation: NegotiationId,
        reason: String,
    },
    /// Shutdown drain gave up on an in-flight verification
    ForceFailed {
        negotiation: NegotiationId,
    },
    /// Live mode was off; the action was recorded instead of dispatched
    Simulated {
        negotiation: NegotiationId,
        description: String,
    },
}

/// One ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub sequence: u64,
    /// Hash of the previous entry ("0" for the genesis entry)
    pub previous_hash: String,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub client: ClientId,
    pub counterparty: CounterpartyId,
    pub event: ActivityEvent,
}

impl LedgerEntry {
    /// Compute the chained hash of this entry.
    pub fn compute_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let event_json = serde_json::to_string(&self.event).unwrap_or_default();
        let content = format!(
            "{}:{}:{}:{}",
            self.previous_hash,
            self.sequence,
            self.timestamp.timestamp_millis(),
            event_json
        );
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn verify(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

/// Append-only activity log.
#[async_trait::async_trait]
pub trait ActivityLedger: Send + Sync {
    /// Append an event. Appends serialize under a single writer; two
    /// concurrent appends never interleave.
    async fn append(
        &self,
        client: ClientId,
        counterparty: CounterpartyId,
        event: ActivityEvent,
    ) -> LedgerResult<LedgerEntryId>;

    /// All retained entries for a counterparty, oldest first.
    async fn entries_for_counterparty(&self, counterparty: &CounterpartyId) -> Vec<LedgerEntry>;

    /// All retained entries for a client, oldest first.
    async fn entries_for_client(&self, client: &ClientId) -> Vec<LedgerEntry>;

    /// Verify hash continuity across all retained entries.
    async fn verify_chain(&self) -> bool;

    /// Export every retained entry, oldest first.
    async fn export(&self) -> Vec<LedgerEntry>;
}

struct LedgerState {
    entries: VecDeque<LedgerEntry>,
    last_hash: String,
    sequence: u64,
}

/// In-memory ledger with bounded retention.
pub struct InMemoryLedger {
    state: Arc<Mutex<LedgerState>>,
    max_entries: usize,
}

impl InMemoryLedger {
    pub fn new(max_entries: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState {
                entries: VecDeque::new(),
                last_hash: "0".to_string(),
                sequence: 0,
            })),
            max_entries,
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait::async_trait]
impl ActivityLedger for InMemoryLedger {
    async fn append(
        &self,
        client: ClientId,
        counterparty: CounterpartyId,
        event: ActivityEvent,
    ) -> LedgerResult<LedgerEntryId> {
        let mut state = self.state.lock().await;
        state.sequence += 1;

        let mut entry = LedgerEntry {
            id: LedgerEntryId::new(),
            sequence: state.sequence,
            previous_hash: state.last_hash.clone(),
            hash: String::new(),
            timestamp: Utc::now(),
            client,
            counterparty,
            event,
        };
        entry.hash = entry.compute_hash();
        state.last_hash = entry.hash.clone();

        let id = entry.id.clone();
        state.entries.push_back(entry);
        if state.entries.len() > self.max_entries {
            state.entries.pop_front();
        }
        Ok(id)
    }

    async fn entries_for_counterparty(&self, counterparty: &CounterpartyId) -> Vec<LedgerEntry> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .filter(|e| &e.counterparty == counterparty)
            .cloned()
            .collect()
    }

    async fn entries_for_client(&self, client: &ClientId) -> Vec<LedgerEntry> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .filter(|e| &e.client == client)
            .cloned()
            .collect()
    }

    async fn verify_chain(&self) -> bool {
        let state = self.state.lock().await;
        let mut previous: Option<&str> = None;
        for entry in &state.entries {
            if !entry.verify() {
                return false;
            }
            // The oldest retained entry anchors the chain after eviction.
            if let Some(prev_hash) = previous {
                if entry.previous_hash != prev_hash {
                    return false;
                }
            }
            previous = Some(&entry.hash);
        }
        true
    }

    async fn export(&self) -> Vec<LedgerEntry> {
        let state = self.state.lock().await;
        state.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> (ClientId, CounterpartyId, NegotiationId) {
        (ClientId::new(), CounterpartyId::new(), NegotiationId::new())
    }

    #[tokio::test]
    async fn test_append_builds_verifiable_chain() {
        let ledger = InMemoryLedger::default();
        let (client, cpty, nego) = keys();

        ledger
            .append(
                client.clone(),
                cpty.clone(),
                ActivityEvent::RequestOpened {
                    negotiation: nego.clone(),
                    requested_actions: vec![ActionKind::Like],
                },
            )
            .await
            .unwrap();
        ledger
            .append(
                client.clone(),
                cpty.clone(),
                ActivityEvent::Completed { negotiation: nego },
            )
            .await
            .unwrap();

        assert!(ledger.verify_chain().await);
        let entries = ledger.export().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].previous_hash, "0");
        assert_eq!(entries[1].previous_hash, entries[0].hash);
    }

    #[tokio::test]
    async fn test_tampering_breaks_verification() {
        let ledger = InMemoryLedger::default();
        let (client, cpty, nego) = keys();
        ledger
            .append(
                client,
                cpty,
                ActivityEvent::Completed { negotiation: nego },
            )
            .await
            .unwrap();

        {
            let mut state = ledger.state.lock().await;
            state.entries[0].sequence = 99;
        }
        assert!(!ledger.verify_chain().await);
    }

    #[tokio::test]
    async fn test_bounded_retention_evicts_oldest() {
        let ledger = InMemoryLedger::new(3);
        let (client, cpty, nego) = keys();

        for attempt in 0..5u32 {
            ledger
                .append(
                    client.clone(),
                    cpty.clone(),
                    ActivityEvent::NudgeSent {
                        negotiation: nego.clone(),
                        attempt,
                    },
                )
                .await
                .unwrap();
        }

        let entries = ledger.export().await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].sequence, 3);
        // chain stays verifiable from the oldest retained entry
        assert!(ledger.verify_chain().await);
    }

    #[tokio::test]
    async fn test_concurrent_appends_do_not_interleave() {
        let ledger = Arc::new(InMemoryLedger::default());
        let (client, cpty, nego) = keys();

        let mut handles = Vec::new();
        for attempt in 0..50u32 {
            let ledger = ledger.clone();
            let client = client.clone();
            let cpty = cpty.clone();
            let nego = nego.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .append(
                        client,
                        cpty,
                        ActivityEvent::NudgeSent {
                            negotiation: nego,
                            attempt,
                        },
                    )
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(ledger.verify_chain().await);
        let entries = ledger.export().await;
        assert_eq!(entries.len(), 50);
        let sequences: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        assert_eq!(sequences, sorted);
    }

    #[tokio::test]
    async fn test_per_counterparty_query() {
        let ledger = InMemoryLedger::default();
        let client = ClientId::new();
        let cpty_a = CounterpartyId::new();
        let cpty_b = CounterpartyId::new();

        ledger
            .append(
                client.clone(),
                cpty_a.clone(),
                ActivityEvent::Completed {
                    negotiation: NegotiationId::new(),
                },
            )
            .await
            .unwrap();
        ledger
            .append(
                client.clone(),
                cpty_b.clone(),
                ActivityEvent::Failed {
                    negotiation: NegotiationId::new(),
                    reason: "attempts exhausted".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(ledger.entries_for_counterparty(&cpty_a).await.len(), 1);
        assert_eq!(ledger.entries_for_counterparty(&cpty_b).await.len(), 1);
        assert_eq!(ledger.entries_for_client(&client).await.len(), 2);
    }
}
