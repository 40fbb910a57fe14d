//! Socket connection state machine.

use serde::Serialize;

/// Connection state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketState {
    Unconnected,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl SocketState {
    /// Move to `next` unless that would go backwards. Returns whether the state changed.
    pub fn advance(&mut self, next: SocketState) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }

    /// New operations are accepted in this state.
    pub fn accepts_operations(self) -> bool {
        self < SocketState::Disconnecting
    }

    pub fn is_terminal(self) -> bool {
        self == SocketState::Disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_transitions() {
        let mut state = SocketState::Unconnected;
        assert!(state.advance(SocketState::Connecting));
        assert!(state.advance(SocketState::Connected));
        assert!(!state.advance(SocketState::Connecting));
        assert_eq!(state, SocketState::Connected);
        assert!(state.advance(SocketState::Disconnected));
        assert!(!state.advance(SocketState::Disconnected));
        assert!(state.is_terminal());
    }

    #[test]
    fn test_any_state_can_fail_directly() {
        let mut state = SocketState::Unconnected;
        assert!(state.advance(SocketState::Disconnected));
    }

    #[test]
    fn test_accepts_operations() {
        assert!(SocketState::Unconnected.accepts_operations());
        assert!(SocketState::Connecting.accepts_operations());
        assert!(SocketState::Connected.accepts_operations());
        assert!(!SocketState::Disconnecting.accepts_operations());
        assert!(!SocketState::Disconnected.accepts_operations());
    }
}
