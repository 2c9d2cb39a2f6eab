//! Connection state machine.

use crate::error::{ReplicaError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of the connection to one relay.
///
/// ```text
/// Disconnected -> Handshaking -> Authenticated -> Syncing <-> Idle
///       ^                                                      |
///       +--------------------- error / close / timeout --------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Handshaking,
    Authenticated,
    Syncing,
    Idle,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Handshaking)
                | (Handshaking, Authenticated)
                | (Authenticated, Syncing)
                | (Syncing, Idle)
                | (Idle, Syncing)
        )
    }

    /// Move to `next`, rejecting transitions the protocol does not allow.
    pub fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(ReplicaError::InvalidState {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    /// Handshake done and not torn down since.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Authenticated | ConnectionState::Syncing | ConnectionState::Idle
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Syncing => "syncing",
            ConnectionState::Idle => "idle",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn happy_path() {
        let mut state = ConnectionState::default();
        for next in [Handshaking, Authenticated, Syncing, Idle, Syncing, Idle] {
            state.transition(next).unwrap();
        }
        assert!(state.is_connected());
    }

    #[test]
    fn any_state_can_disconnect() {
        for from in [Disconnected, Handshaking, Authenticated, Syncing, Idle] {
            assert!(from.can_transition_to(Disconnected));
        }
    }

    #[test]
    fn rejects_skipping_handshake() {
        let mut state = Disconnected;
        let err = state.transition(Syncing).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid state transition: disconnected -> syncing"
        );
        assert_eq!(state, Disconnected);

        assert!(!Idle.can_transition_to(Handshaking));
        assert!(!Authenticated.can_transition_to(Idle));
    }
}
