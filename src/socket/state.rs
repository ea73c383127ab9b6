//! Socket lifecycle state machine

use crate::{Error, Result};

/// Socket state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Created, not yet connecting
    Created,

    /// Outbound connect (and TLS handshake, if secure-pending) in progress
    Connecting,

    /// Plaintext stream established
    Connected,

    /// In-place TLS handshake in progress over the existing stream
    UpgradingToSecure,

    /// TLS-encrypted stream established
    Secure,

    /// Closed normally or by the owner
    Closed,

    /// Terminated by a failure
    Errored,
}

impl SocketState {
    /// Check if transition is valid
    pub fn can_transition_to(&self, next: SocketState) -> bool {
        use SocketState::*;

        matches!(
            (self, next),
            (Created, Connecting)
                | (Connecting, Connected)
                | (Connecting, Secure)
                | (Connected, UpgradingToSecure)
                | (UpgradingToSecure, Secure)
                | (Created | Connecting | Connected | UpgradingToSecure | Secure, Closed)
                | (Created | Connecting | Connected | UpgradingToSecure | Secure, Errored)
        )
    }

    /// Transition to new state
    pub fn transition(&mut self, next: SocketState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                expected: format!("valid transition from {}", self),
                actual: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    /// Whether the socket has terminated
    pub fn is_terminal(&self) -> bool {
        matches!(self, SocketState::Closed | SocketState::Errored)
    }
}

impl std::fmt::Display for SocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::UpgradingToSecure => write!(f, "upgrading_to_secure"),
            Self::Secure => write!(f, "secure"),
            Self::Closed => write!(f, "closed"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_lifecycle() {
        let mut state = SocketState::Created;
        assert!(state.transition(SocketState::Connecting).is_ok());
        assert!(state.transition(SocketState::Connected).is_ok());
        assert!(state.transition(SocketState::Closed).is_ok());
        assert!(state.is_terminal());
    }

    #[test]
    fn test_upgrade_lifecycle() {
        let mut state = SocketState::Connected;
        assert!(state.transition(SocketState::UpgradingToSecure).is_ok());
        assert!(state.transition(SocketState::Secure).is_ok());
        assert!(!state.is_terminal());
    }

    #[test]
    fn test_secure_pending_skips_connected() {
        let mut state = SocketState::Connecting;
        assert!(state.transition(SocketState::Secure).is_ok());
    }

    #[test]
    fn test_upgrade_only_once() {
        let mut state = SocketState::Secure;
        assert!(state.transition(SocketState::UpgradingToSecure).is_err());
        assert_eq!(state, SocketState::Secure);
    }

    #[test]
    fn test_upgrade_requires_connected() {
        for from in [SocketState::Created, SocketState::Connecting] {
            let mut state = from;
            assert!(state.transition(SocketState::UpgradingToSecure).is_err());
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for from in [SocketState::Closed, SocketState::Errored] {
            let mut state = from;
            assert!(state.transition(SocketState::Closed).is_err());
            assert!(state.transition(SocketState::Connecting).is_err());
        }
    }

    #[test]
    fn test_close_from_any_live_state() {
        for from in [
            SocketState::Created,
            SocketState::Connecting,
            SocketState::Connected,
            SocketState::UpgradingToSecure,
            SocketState::Secure,
        ] {
            let mut state = from;
            assert!(state.transition(SocketState::Closed).is_ok(), "{}", from);
        }
    }
}
