//! Chat transport contract
//!
//! One connection per client account. The transport delivers a client's
//! inbound messages in platform order over an mpsc channel; the engine
//! guarantees nothing about ordering across clients or counterparties.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use quidpro_types::{ClientId, ClientProfile, CounterpartyId, MediaRef};

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Platform rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("No permission to message this counterparty")]
    NoPermission,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying the same call can succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Network(_))
    }
}

/// One message received on a client's connection.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub client: ClientId,
    pub counterparty: CounterpartyId,
    pub text: Option<String>,
    pub media: Option<MediaRef>,
}

impl InboundMessage {
    pub fn text(client: ClientId, counterparty: CounterpartyId, text: impl Into<String>) -> Self {
        Self {
            client,
            counterparty,
            text: Some(text.into()),
            media: None,
        }
    }

    pub fn image(client: ClientId, counterparty: CounterpartyId, media: MediaRef) -> Self {
        Self {
            client,
            counterparty,
            text: None,
            media: Some(media),
        }
    }
}

/// Chat platform binding.
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync {
    /// Open the client's connection and return its inbound stream.
    async fn connect(
        &self,
        client: &ClientProfile,
    ) -> Result<mpsc::Receiver<InboundMessage>, TransportError>;

    /// Send a text message to a counterparty.
    async fn send(
        &self,
        client: &ClientId,
        counterparty: &CounterpartyId,
        text: &str,
    ) -> Result<(), TransportError>;

    /// Resolve a media handle to raw bytes.
    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, TransportError>;
}

/// Outbound message captured by [`ScriptedTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub client: ClientId,
    pub counterparty: CounterpartyId,
    pub text: String,
}

/// In-memory transport for tests and the simulator.
///
/// Each client's scripted inbound messages are delivered on connect, in
/// order. Outbound sends are recorded; media handles resolve against a
/// preloaded byte map.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<ClientId, Vec<InboundMessage>>>,
    media: Mutex<HashMap<MediaRef, Vec<u8>>>,
    sent: Mutex<Vec<SentMessage>>,
    // keeps scripted channels open so client tasks idle instead of
    // spinning through reconnects
    open_senders: Mutex<Vec<mpsc::Sender<InboundMessage>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a client's inbound script, delivered on its next connect.
    pub async fn script(&self, client: &ClientId, messages: Vec<InboundMessage>) {
        self.scripts
            .lock()
            .await
            .entry(client.clone())
            .or_default()
            .extend(messages);
    }

    /// Preload bytes behind a media handle.
    pub async fn load_media(&self, media: MediaRef, bytes: Vec<u8>) {
        self.media.lock().await.insert(media, bytes);
    }

    /// Everything sent so far.
    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl ChatTransport for ScriptedTransport {
    async fn connect(
        &self,
        client: &ClientProfile,
    ) -> Result<mpsc::Receiver<InboundMessage>, TransportError> {
        let script = self
            .scripts
            .lock()
            .await
            .remove(&client.id)
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(script.len().max(1));
        for message in script {
            tx.send(message)
                .await
                .map_err(|_| TransportError::Closed)?;
        }
        self.open_senders.lock().await.push(tx);
        Ok(rx)
    }

    async fn send(
        &self,
        client: &ClientId,
        counterparty: &CounterpartyId,
        text: &str,
    ) -> Result<(), TransportError> {
        self.sent.lock().await.push(SentMessage {
            client: client.clone(),
            counterparty: counterparty.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, TransportError> {
        self.media
            .lock()
            .await
            .get(media)
            .cloned()
            .ok_or_else(|| TransportError::Network(format!("unknown media handle {media}")))
    }
}
