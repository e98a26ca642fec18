//! QuidPro Engine - Negotiation state machine
//!
//! Pure transition logic for one exchange negotiation. The engine decides
//! what to say and which stage to move to; it performs no I/O. Callers
//! (the manager) own locking, throttling, verification, and dispatch.

pub mod extract;
pub mod machine;
pub mod policy;
pub mod templates;

pub use extract::{extract_actions, extract_target, is_exchange_greeting};
pub use machine::{Directive, EngineError, NegotiationStateMachine, ProofJob};
pub use policy::EnginePolicy;
