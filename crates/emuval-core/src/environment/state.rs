//! Environment state machine.
//!
//! ```text
//! CREATING -> HEALTHY -> IN_USE -> TEARING_DOWN -> GONE
//!     \          \          \           ^
//!      +----------+----------+-> FAILED-+
//! ```
//!
//! `TEARING_DOWN` is reachable from every live state so cleanup never
//! depends on how far the validation got.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentState {
    Creating,
    Healthy,
    InUse,
    TearingDown,
    Gone,
    Failed,
}

impl EnvironmentState {
    pub fn can_transition_to(self, next: EnvironmentState) -> bool {
        use EnvironmentState::*;
        match (self, next) {
            (Creating, Healthy) | (Healthy, InUse) | (TearingDown, Gone) => true,
            (Creating | Healthy | InUse, Failed) => true,
            (Creating | Healthy | InUse | Failed, TearingDown) => true,
            _ => false,
        }
    }

    /// The environment process may still exist.
    pub fn is_live(self) -> bool {
        !matches!(self, EnvironmentState::Gone)
    }
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvironmentState::Creating => "CREATING",
            EnvironmentState::Healthy => "HEALTHY",
            EnvironmentState::InUse => "IN_USE",
            EnvironmentState::TearingDown => "TEARING_DOWN",
            EnvironmentState::Gone => "GONE",
            EnvironmentState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::EnvironmentState::*;

    #[test]
    fn test_happy_path_is_legal() {
        let path = [Creating, Healthy, InUse, TearingDown, Gone];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_teardown_reachable_from_every_live_state() {
        for state in [Creating, Healthy, InUse, Failed] {
            assert!(state.can_transition_to(TearingDown), "{state}");
        }
    }

    #[test]
    fn test_failed_routes_only_through_teardown() {
        assert!(!Failed.can_transition_to(Gone));
        assert!(!Failed.can_transition_to(Healthy));
    }

    #[test]
    fn test_gone_is_terminal() {
        for next in [Creating, Healthy, InUse, TearingDown, Failed, Gone] {
            assert!(!Gone.can_transition_to(next));
        }
        assert!(!Gone.is_live());
    }

    #[test]
    fn test_skipping_states_is_illegal() {
        assert!(!Creating.can_transition_to(InUse));
        assert!(!Healthy.can_transition_to(Gone));
        assert!(!TearingDown.can_transition_to(Failed));
    }
}
