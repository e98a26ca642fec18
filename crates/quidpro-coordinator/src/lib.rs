//! QuidPro Coordinator - Orchestration layer
//!
//! Two pieces live here:
//!
//! - [`NegotiationManager`] owns the map of active negotiations, serializes
//!   access per counterparty, applies the state machine, and gates every
//!   outbound action through the rate limiter.
//! - [`MultiClientCoordinator`] runs N chat accounts concurrently, routing
//!   each account's inbound messages to the manager while keeping failure
//!   domains isolated.
//!
//! The external collaborator contracts ([`ChatTransport`],
//! [`RewardDispatcher`], [`AlertSink`]) and their null/fake implementations
//! are defined here too.

pub mod alerts;
pub mod coordinator;
pub mod manager;
pub mod reward;
pub mod transport;

pub use alerts::{Alert, AlertSeverity, AlertSink, NullAlerts, RecordingAlerts};
pub use coordinator::{CoordinatorConfig, MultiClientCoordinator};
pub use manager::{ManagerConfig, NegotiationManager};
pub use reward::{
    DispatchError, RecordingDispatcher, RewardConfig, RewardDispatcher, RewardSender,
};
pub use transport::{
    ChatTransport, InboundMessage, ScriptedTransport, SentMessage, TransportError,
};
