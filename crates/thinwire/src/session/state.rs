//! Session lifecycle states and the transition table.

use std::fmt;

/// Lifecycle state of a [`Session`](super::Session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Negotiating,
    Authenticating,
    Ready,
    Executing,
    Closing,
    Closed,
    Error,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{
            Authenticating, Closed, Closing, Disconnected, Error, Executing, Negotiating, Ready,
        };
        matches!(
            (self, next),
            (Disconnected, Negotiating)
                | (Negotiating, Authenticating)
                | (Authenticating, Ready)
                | (Ready, Executing)
                | (Executing, Ready)
                | (Ready | Disconnected, Closing)
                | (Closing | Error, Closed)
                | (
                    Disconnected
                        | Negotiating
                        | Authenticating
                        | Ready
                        | Executing
                        | Closing,
                    Error
                )
        )
    }

    /// Ready to accept a request.
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// A request is outstanding or the session is still opening.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(
            self,
            Self::Negotiating | Self::Authenticating | Self::Executing | Self::Closing
        )
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Negotiating => "negotiating",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;
    use super::*;

    const ALL: [SessionState; 8] = [
        Disconnected,
        Negotiating,
        Authenticating,
        Ready,
        Executing,
        Closing,
        Closed,
        Error,
    ];

    #[test]
    fn test_happy_path() {
        let path = [Disconnected, Negotiating, Authenticating, Ready, Executing, Ready];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(Ready.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
    }

    #[test]
    fn test_no_going_back() {
        assert!(!Ready.can_transition_to(Authenticating));
        assert!(!Authenticating.can_transition_to(Negotiating));
        assert!(!Executing.can_transition_to(Closing));
        assert!(!Error.can_transition_to(Ready));
    }

    #[test]
    fn test_closed_is_final() {
        for next in ALL {
            assert!(!Closed.can_transition_to(next), "closed -> {next}");
        }
    }

    #[test]
    fn test_error_reachable_from_live_states() {
        for state in ALL {
            let expected = !matches!(state, Closed | Error);
            assert_eq!(state.can_transition_to(Error), expected, "{state} -> error");
        }
        assert!(Error.can_transition_to(Closed));
    }

    #[test]
    fn test_predicates() {
        assert!(Ready.is_usable());
        assert!(Executing.is_busy());
        assert!(!Ready.is_busy());
        assert!(Error.is_terminal());
        assert!(!Closing.is_terminal());
    }
}
