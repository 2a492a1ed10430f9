use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    Validating,
    Executing,
    CheckingResult,
    DecidingRetry,
    Adjusting,
    DoneSuccess,
    DoneFailure,
}

impl LoopState {
    pub const INITIAL: Self = Self::Validating;

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "VALIDATING",
            Self::Executing => "EXECUTING",
            Self::CheckingResult => "CHECKING_RESULT",
            Self::DecidingRetry => "DECIDING_RETRY",
            Self::Adjusting => "ADJUSTING",
            Self::DoneSuccess => "DONE_SUCCESS",
            Self::DoneFailure => "DONE_FAILURE",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::DoneSuccess | Self::DoneFailure)
    }

    // Every non-terminal state may jump to DONE_FAILURE when the caller
    // cancels or the deadline passes mid-attempt.
    pub fn can_transition_to(self, next: Self) -> bool {
        use LoopState::{
            Adjusting, CheckingResult, DecidingRetry, DoneFailure, DoneSuccess, Executing,
            Validating,
        };

        matches!(
            (self, next),
            (Validating, Executing)
                | (Validating, DecidingRetry)
                | (Executing, CheckingResult)
                | (Executing, DecidingRetry)
                | (CheckingResult, DoneSuccess)
                | (CheckingResult, DecidingRetry)
                | (DecidingRetry, Adjusting)
                | (DecidingRetry, DoneFailure)
                | (Adjusting, Validating)
        ) || (!self.is_terminal() && next == DoneFailure)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::LoopState;

    #[test]
    fn loop_state_transitions_are_constrained() {
        assert!(LoopState::Validating.can_transition_to(LoopState::Executing));
        assert!(LoopState::Validating.can_transition_to(LoopState::DecidingRetry));
        assert!(LoopState::CheckingResult.can_transition_to(LoopState::DoneSuccess));
        assert!(LoopState::DecidingRetry.can_transition_to(LoopState::Adjusting));
        assert!(LoopState::Adjusting.can_transition_to(LoopState::Validating));
        assert!(LoopState::Executing.can_transition_to(LoopState::DoneFailure));

        assert!(!LoopState::Validating.can_transition_to(LoopState::DoneSuccess));
        assert!(!LoopState::Executing.can_transition_to(LoopState::DoneSuccess));
        assert!(!LoopState::Adjusting.can_transition_to(LoopState::Executing));
        assert!(!LoopState::DoneSuccess.can_transition_to(LoopState::Validating));
        assert!(!LoopState::DoneFailure.can_transition_to(LoopState::DoneFailure));
    }

    #[test]
    fn only_done_states_are_terminal() {
        assert!(LoopState::DoneSuccess.is_terminal());
        assert!(LoopState::DoneFailure.is_terminal());
        assert!(!LoopState::INITIAL.is_terminal());
        assert_eq!(LoopState::CheckingResult.to_string(), "CHECKING_RESULT");
    }
}
