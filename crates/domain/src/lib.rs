// ============================================================================
// Domain Layer - Business Logic and Models
// ============================================================================
//
// This crate contains the core domain logic for the realtime voice gateway,
// organized into:
// - envelope: the bit-exact wire message shape, serialize/deserialize
// - auth: token verification and the guest-token grammar
// - state_machine: the conversation state machine and its transition table
// - models: Session/Turn/TokenPayload domain records
// - errors: shared error types
//
// The domain layer is technology-agnostic: no I/O, no sockets, no database
// handles. Everything here is pure enough to unit test without a runtime.

pub mod auth;
pub mod envelope;
pub mod errors;
pub mod models;
pub mod state_machine;

pub use auth::{GuestTokenError, TokenError, TokenPayload, TokenVerifier};
pub use envelope::{EnvelopeError, MessageEnvelope};
pub use errors::DomainError;
pub use models::{Session, Turn, TurnCosts, TurnLatencies};
pub use state_machine::{ConversationState, StateMachineError};
