//! Conversation State Machine (spec §4.C). Pure: no session handle, no side
//! effects. The Session Store (services::session) is the only caller allowed
//! to apply a transition to stored state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationState {
    Idle,
    Listening,
    Processing,
    Speaking,
    Interrupted,
    Error,
}

impl ConversationState {
    pub const ALL: [ConversationState; 6] = [
        ConversationState::Idle,
        ConversationState::Listening,
        ConversationState::Processing,
        ConversationState::Speaking,
        ConversationState::Interrupted,
        ConversationState::Error,
    ];

    /// The transition table from spec §4.C, encoded directly so the table in
    /// this file and the table in the spec can be diffed by eye.
    fn allowed_targets(self) -> &'static [ConversationState] {
        use ConversationState::*;
        match self {
            Idle => &[Listening, Error],
            Listening => &[Idle, Processing, Interrupted, Error],
            Processing => &[Idle, Speaking, Interrupted, Error],
            Speaking => &[Idle, Interrupted, Error],
            Interrupted => &[Idle, Listening, Error],
            Error => &[Idle],
        }
    }

    pub fn can_transition(self, to: ConversationState) -> bool {
        self.allowed_targets().contains(&to)
    }

    pub fn valid_next_states(self) -> Vec<ConversationState> {
        self.allowed_targets().to_vec()
    }

    pub fn transition(self, to: ConversationState) -> Result<ConversationState, StateMachineError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(StateMachineError::InvalidTransition { from: self, to })
        }
    }

    pub fn as_wire_str(self) -> &'static str {
        match self {
            ConversationState::Idle => "IDLE",
            ConversationState::Listening => "LISTENING",
            ConversationState::Processing => "PROCESSING",
            ConversationState::Speaking => "SPEAKING",
            ConversationState::Interrupted => "INTERRUPTED",
            ConversationState::Error => "ERROR",
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConversationState,
        to: ConversationState,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConversationState::*;

    /// Spec §4.C table, transcribed as an exhaustive truth table so any
    /// accidental drift between `allowed_targets` and the spec is caught.
    fn expected(from: ConversationState, to: ConversationState) -> bool {
        matches!(
            (from, to),
            (Idle, Listening)
                | (Idle, Error)
                | (Listening, Idle)
                | (Listening, Processing)
                | (Listening, Interrupted)
                | (Listening, Error)
                | (Processing, Idle)
                | (Processing, Speaking)
                | (Processing, Interrupted)
                | (Processing, Error)
                | (Speaking, Idle)
                | (Speaking, Interrupted)
                | (Speaking, Error)
                | (Interrupted, Idle)
                | (Interrupted, Listening)
                | (Interrupted, Error)
                | (Error, Idle)
        )
    }

    #[test]
    fn table_matches_spec_exhaustively() {
        for &from in ConversationState::ALL.iter() {
            for &to in ConversationState::ALL.iter() {
                assert_eq!(
                    from.can_transition(to),
                    expected(from, to),
                    "mismatch for {from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn transition_returns_target_iff_allowed() {
        assert_eq!(Idle.transition(Listening), Ok(Listening));
        let err = Idle.transition(Speaking).unwrap_err();
        assert!(err.to_string().contains("Invalid state transition"));
    }

    #[test]
    fn error_state_can_only_return_to_idle() {
        assert_eq!(Error.valid_next_states(), vec![Idle]);
    }

    #[test]
    fn no_self_transitions() {
        for &s in ConversationState::ALL.iter() {
            assert!(!s.can_transition(s), "{s:?} should not self-transition");
        }
    }
}
