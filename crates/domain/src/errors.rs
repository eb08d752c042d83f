use thiserror::Error;

/// Umbrella error for callers that cross multiple domain modules
/// (the Gateway Server and Message Router sit above all of them).
#[derive(Error, Debug)]
pub enum DomainError {
    #[error(transparent)]
    Envelope(#[from] crate::envelope::EnvelopeError),

    #[error(transparent)]
    Token(#[from] crate::auth::TokenError),

    #[error(transparent)]
    StateMachine(#[from] crate::state_machine::StateMachineError),
}
