//! Operator escalation contract
//!
//! Only two faults escalate past logs: exhausted reward-dispatch retries
//! and exhausted negotiations the operator asked to hear about. Everything
//! else stays local to its component.

use tokio::sync::Mutex;

use quidpro_types::NegotiationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// One operator-facing escalation.
#[derive(Debug, Clone)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub message: String,
    pub negotiation: Option<NegotiationId>,
}

impl Alert {
    pub fn critical(message: impl Into<String>, negotiation: Option<NegotiationId>) -> Self {
        Self {
            severity: AlertSeverity::Critical,
            message: message.into(),
            negotiation,
        }
    }
}

/// Operational alert channel (pager, ops chat, ...).
#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn escalate(&self, alert: Alert);
}

/// Discards alerts after logging them.
pub struct NullAlerts;

#[async_trait::async_trait]
impl AlertSink for NullAlerts {
    async fn escalate(&self, alert: Alert) {
        tracing::error!(severity = ?alert.severity, message = %alert.message, "operator alert");
    }
}

/// Captures alerts for assertions.
#[derive(Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl AlertSink for RecordingAlerts {
    async fn escalate(&self, alert: Alert) {
        self.alerts.lock().await.push(alert);
    }
}
