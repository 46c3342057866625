use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

/// Lifecycle state of one logical session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Idle, nothing negotiated
    Ready,
    /// Local invitation sent, waiting for the remote answer
    Offered,
    /// Remote invitation received, waiting for the local decision
    Pending,
    /// Both sides agreed, media negotiation not started yet
    Matched,
    /// Offer/answer and ICE in progress
    Connecting,
    /// ICE connected or completed
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Ready => write!(f, "ready"),
            SessionState::Offered => write!(f, "offered"),
            SessionState::Pending => write!(f, "pending"),
            SessionState::Matched => write!(f, "matched"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
        }
    }
}

/// Inputs of the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Local side sends an invitation
    Invite,
    /// Remote invitation arrived. `accept_remote` is the glare decision used
    /// when a local invitation is outstanding.
    ReceiveInvite { accept_remote: bool },
    /// Local side accepts the remote invitation
    Accept,
    /// Local side denies the remote invitation
    Deny,
    /// Remote side accepted our invitation
    RemoteAccepted,
    /// Remote side denied our invitation
    RemoteDenied,
    /// First offer created or received
    NegotiationStarted,
    /// ICE reported connected or completed
    IceConnected,
    /// ICE reported closed or failed
    IceClosed,
    /// Local stop
    Stop,
    /// Remote side closed the session
    RemoteStopped,
}

/// Which edge set applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionVariant {
    /// Symmetric session with invitation and glare handling
    P2P,
    /// Server-authoritative session: ready, connecting, connected
    Conference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event {event:?} is not valid in state {from}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub event: SessionEvent,
}

/// Session lifecycle state machine
///
/// Events that are not valid in the current state leave it untouched and
/// return [`InvalidTransition`], so late or duplicated signaling messages
/// are harmless.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    variant: SessionVariant,
    state: SessionState,
}

impl SessionStateMachine {
    pub fn new(variant: SessionVariant) -> Self {
        Self {
            variant,
            state: SessionState::Ready,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn variant(&self) -> SessionVariant {
        self.variant
    }

    /// Whether the engine connection is being negotiated or is up
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            SessionState::Connecting | SessionState::Connected
        )
    }

    /// Apply `event`, returning the new state
    pub fn transition(&mut self, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
        let next = match self.variant {
            SessionVariant::P2P => Self::p2p_edge(self.state, event),
            SessionVariant::Conference => Self::conference_edge(self.state, event),
        };

        match next {
            Some(next) => {
                if next != self.state {
                    debug!("Session state {} -> {} on {:?}", self.state, next, event);
                }
                self.state = next;
                Ok(next)
            }
            None => {
                warn!("Ignoring {:?} in session state {}", event, self.state);
                Err(InvalidTransition {
                    from: self.state,
                    event,
                })
            }
        }
    }

    fn p2p_edge(state: SessionState, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (state, event) {
            (S::Ready | S::Offered, E::Invite) => Some(S::Offered),
            (S::Ready | S::Pending, E::ReceiveInvite { .. }) => Some(S::Pending),
            (S::Offered, E::ReceiveInvite { accept_remote: true }) => Some(S::Matched),
            (S::Offered, E::ReceiveInvite { accept_remote: false }) => Some(S::Offered),
            (S::Pending, E::Accept) => Some(S::Matched),
            (S::Pending, E::Deny) => Some(S::Ready),
            (S::Offered | S::Matched, E::RemoteAccepted) => Some(S::Matched),
            (S::Offered, E::RemoteDenied) => Some(S::Ready),
            (S::Matched, E::NegotiationStarted) => Some(S::Connecting),
            (S::Connecting | S::Connected, E::NegotiationStarted) => Some(state),
            (S::Connecting | S::Connected, E::IceConnected) => Some(S::Connected),
            (S::Connecting | S::Connected, E::IceClosed) => Some(S::Ready),
            (S::Offered | S::Matched | S::Connecting | S::Connected, E::Stop) => Some(S::Ready),
            (S::Pending | S::Matched | S::Connecting | S::Connected, E::RemoteStopped) => {
                Some(S::Ready)
            }
            _ => None,
        }
    }

    fn conference_edge(state: SessionState, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (state, event) {
            (S::Ready, E::NegotiationStarted) => Some(S::Connecting),
            (S::Connecting | S::Connected, E::NegotiationStarted) => Some(state),
            (S::Connecting | S::Connected, E::IceConnected) => Some(S::Connected),
            (S::Connecting | S::Connected, E::IceClosed) => Some(S::Ready),
            (S::Connecting | S::Connected, E::Stop) => Some(S::Ready),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2p_in(path: &[SessionEvent]) -> SessionStateMachine {
        let mut machine = SessionStateMachine::new(SessionVariant::P2P);
        for event in path {
            machine.transition(*event).unwrap();
        }
        machine
    }

    #[test]
    fn test_inviter_path() {
        let machine = p2p_in(&[
            SessionEvent::Invite,
            SessionEvent::RemoteAccepted,
            SessionEvent::NegotiationStarted,
            SessionEvent::IceConnected,
        ]);
        assert_eq!(machine.state(), SessionState::Connected);
    }

    #[test]
    fn test_invitee_path() {
        let mut machine = p2p_in(&[SessionEvent::ReceiveInvite {
            accept_remote: false,
        }]);
        assert_eq!(machine.state(), SessionState::Pending);
        assert_eq!(
            machine.transition(SessionEvent::Deny),
            Ok(SessionState::Ready)
        );
    }

    #[test]
    fn test_invitation_glare() {
        let mut loser = p2p_in(&[SessionEvent::Invite]);
        assert_eq!(
            loser.transition(SessionEvent::ReceiveInvite { accept_remote: true }),
            Ok(SessionState::Matched)
        );

        let mut winner = p2p_in(&[SessionEvent::Invite]);
        assert_eq!(
            winner.transition(SessionEvent::ReceiveInvite {
                accept_remote: false
            }),
            Ok(SessionState::Offered)
        );
    }

    #[test]
    fn test_unlisted_events_are_rejected_without_change() {
        let mut machine = SessionStateMachine::new(SessionVariant::P2P);
        let err = machine.transition(SessionEvent::IceConnected).unwrap_err();
        assert_eq!(err.from, SessionState::Ready);
        assert_eq!(machine.state(), SessionState::Ready);

        assert!(machine.transition(SessionEvent::Stop).is_err());
        assert!(machine.transition(SessionEvent::Accept).is_err());
        assert_eq!(machine.state(), SessionState::Ready);
    }

    #[test]
    fn test_connected_only_after_ice() {
        let mut machine = p2p_in(&[SessionEvent::Invite, SessionEvent::RemoteAccepted]);
        assert!(machine.transition(SessionEvent::IceConnected).is_err());
        machine.transition(SessionEvent::NegotiationStarted).unwrap();
        assert_eq!(machine.state(), SessionState::Connecting);
        machine.transition(SessionEvent::IceConnected).unwrap();
        assert_eq!(machine.state(), SessionState::Connected);
    }

    #[test]
    fn test_ice_closed_is_idempotent() {
        let mut machine = p2p_in(&[
            SessionEvent::Invite,
            SessionEvent::RemoteAccepted,
            SessionEvent::NegotiationStarted,
            SessionEvent::IceConnected,
        ]);
        assert_eq!(
            machine.transition(SessionEvent::IceClosed),
            Ok(SessionState::Ready)
        );
        assert!(machine.transition(SessionEvent::IceClosed).is_err());
    }

    #[test]
    fn test_conference_variant() {
        let mut machine = SessionStateMachine::new(SessionVariant::Conference);
        assert!(machine.transition(SessionEvent::Invite).is_err());
        machine.transition(SessionEvent::NegotiationStarted).unwrap();
        assert!(machine.is_active());
        machine.transition(SessionEvent::IceConnected).unwrap();
        assert_eq!(machine.state(), SessionState::Connected);
        machine.transition(SessionEvent::Stop).unwrap();
        assert_eq!(machine.state(), SessionState::Ready);
    }
}
