//! QuidPro Types - Canonical domain types for the exchange engine
//!
//! This crate contains all foundational types for QuidPro with zero
//! dependencies on other quidpro crates:
//!
//! - Identity types (`CounterpartyId`, `ClientId`, `NegotiationId`, ...)
//! - The exchange action vocabulary (`ActionKind`)
//! - The negotiation lifecycle (`NegotiationStage`, `NegotiationRequest`)
//! - Client account profiles and age tiers
//! - Proof verification results
//! - The error taxonomy
//!
//! # Lifecycle Invariants
//!
//! 1. At most one non-terminal [`NegotiationRequest`] per counterparty
//! 2. `reward_sent` flips false→true exactly once and never reverts
//! 3. A request in a terminal stage is immutable
//! 4. Stage changes must appear in the closed transition table

pub mod action;
pub mod error;
pub mod identity;
pub mod negotiation;
pub mod profile;
pub mod verification;

pub use action::*;
pub use error::*;
pub use identity::*;
pub use negotiation::*;
pub use profile::*;
pub use verification::*;
