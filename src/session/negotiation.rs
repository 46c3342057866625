use std::fmt;

use tracing::{debug, warn};

/// Renegotiation handshake state of a P2P session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No renegotiation in progress
    None,
    /// Local request sent, waiting for the remote side
    Sent,
    /// Remote side accepted our request and will offer
    Received,
    /// We accepted the remote request and are the offerer
    Accepted,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::None => write!(f, "none"),
            NegotiationState::Sent => write!(f, "sent"),
            NegotiationState::Received => write!(f, "received"),
            NegotiationState::Accepted => write!(f, "accepted"),
        }
    }
}

/// What the channel should do after a negotiation input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationAction {
    /// Send a negotiation-needed request to the remote side
    SendRequest,
    /// Send negotiation-accepted, then create an offer
    AcceptAndOffer,
    /// Nothing to do until the remote side acts
    Wait,
    /// Duplicate or late input
    Ignore,
}

/// Glare-free renegotiation between two peers
///
/// Renegotiation is requested over signaling instead of by creating an
/// offer. When both sides ask at once, the side whose id sorts after the
/// other's accepts and becomes the offerer; both sides reach the same
/// decision from the two ids alone.
#[derive(Debug, Clone)]
pub struct NegotiationCoordinator {
    local_id: String,
    remote_id: String,
    state: NegotiationState,
    /// Local renegotiation wanted while another one was running
    local_need: bool,
    /// Remote request that arrived while another round was running
    remote_need: bool,
    creating_offer: bool,
    offer_deferred: bool,
}

impl NegotiationCoordinator {
    pub fn new(local_id: impl Into<String>, remote_id: impl Into<String>) -> Self {
        let local_id = local_id.into();
        let remote_id = remote_id.into();
        if local_id == remote_id {
            warn!("Local and remote ids are both {}, glare cannot be resolved", local_id);
        }
        Self {
            local_id,
            remote_id,
            state: NegotiationState::None,
            local_need: false,
            remote_need: false,
            creating_offer: false,
            offer_deferred: false,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Whether the local side wins a simultaneous renegotiation
    pub fn local_is_offerer(&self) -> bool {
        self.local_id > self.remote_id
    }

    /// Invitation glare: the invitation of the larger id wins, so the local
    /// side gives up its own invitation when the remote id is larger
    pub fn accepts_remote_invitation(&self) -> bool {
        self.remote_id > self.local_id
    }

    /// The local engine wants to renegotiate
    pub fn on_renegotiation_needed(&mut self) -> NegotiationAction {
        match self.state {
            NegotiationState::None => {
                self.state = NegotiationState::Sent;
                NegotiationAction::SendRequest
            }
            NegotiationState::Sent => NegotiationAction::Wait,
            NegotiationState::Received | NegotiationState::Accepted => {
                debug!("Renegotiation needed during {} negotiation, deferring", self.state);
                self.local_need = true;
                NegotiationAction::Wait
            }
        }
    }

    /// The remote side asked to renegotiate
    pub fn on_remote_negotiation_request(&mut self) -> NegotiationAction {
        match self.state {
            NegotiationState::None => {
                self.state = NegotiationState::Accepted;
                NegotiationAction::AcceptAndOffer
            }
            NegotiationState::Sent if self.local_is_offerer() => {
                debug!(
                    "Negotiation glare with {}, local side offers",
                    self.remote_id
                );
                self.state = NegotiationState::Accepted;
                NegotiationAction::AcceptAndOffer
            }
            NegotiationState::Sent => {
                debug!(
                    "Negotiation glare with {}, remote side offers",
                    self.remote_id
                );
                NegotiationAction::Wait
            }
            NegotiationState::Received | NegotiationState::Accepted => {
                if self.remote_need {
                    return NegotiationAction::Ignore;
                }
                debug!("Remote renegotiation request during {} round, deferring", self.state);
                self.remote_need = true;
                NegotiationAction::Wait
            }
        }
    }

    /// The remote side accepted our request and will send an offer
    pub fn on_remote_negotiation_accepted(&mut self) -> NegotiationAction {
        match self.state {
            NegotiationState::Sent => {
                self.state = NegotiationState::Received;
                NegotiationAction::Wait
            }
            state => {
                warn!("Unexpected negotiation-accepted in state {}", state);
                NegotiationAction::Ignore
            }
        }
    }

    /// The engine returned to stable; the running round is over
    pub fn on_stable(&mut self) -> NegotiationAction {
        if matches!(self.state, NegotiationState::Sent) {
            // Our request is still unanswered; a stable transition from some
            // other exchange does not complete it
            return NegotiationAction::Wait;
        }
        self.state = NegotiationState::None;
        if std::mem::take(&mut self.remote_need) {
            // Serving the remote request also covers a local need
            self.local_need = false;
            self.state = NegotiationState::Accepted;
            return NegotiationAction::AcceptAndOffer;
        }
        if std::mem::take(&mut self.local_need) {
            self.state = NegotiationState::Sent;
            return NegotiationAction::SendRequest;
        }
        NegotiationAction::Wait
    }

    /// Forget any running round, e.g. when the connection is replaced
    pub fn reset(&mut self) {
        self.state = NegotiationState::None;
        self.local_need = false;
        self.remote_need = false;
        self.creating_offer = false;
        self.offer_deferred = false;
    }

    /// Claim the single offer slot. Returns false and remembers the request
    /// if an offer is already being created.
    pub fn try_begin_offer(&mut self) -> bool {
        if self.creating_offer {
            self.offer_deferred = true;
            return false;
        }
        self.creating_offer = true;
        true
    }

    pub fn is_creating_offer(&self) -> bool {
        self.creating_offer
    }

    /// The offer was applied or abandoned. Returns whether a deferred offer
    /// request should be replayed.
    pub fn offer_settled(&mut self) -> bool {
        self.creating_offer = false;
        std::mem::take(&mut self.offer_deferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Both sides request at once, then each processes the other's request
    fn simultaneous(a: &str, b: &str) -> (NegotiationAction, NegotiationAction) {
        let mut side_a = NegotiationCoordinator::new(a, b);
        let mut side_b = NegotiationCoordinator::new(b, a);
        assert_eq!(side_a.on_renegotiation_needed(), NegotiationAction::SendRequest);
        assert_eq!(side_b.on_renegotiation_needed(), NegotiationAction::SendRequest);
        (
            side_a.on_remote_negotiation_request(),
            side_b.on_remote_negotiation_request(),
        )
    }

    #[test]
    fn test_glare_larger_id_offers() {
        let (a, b) = simultaneous("alice", "bob");
        assert_eq!(a, NegotiationAction::Wait);
        assert_eq!(b, NegotiationAction::AcceptAndOffer);
    }

    #[test]
    fn test_glare_is_deterministic() {
        for _ in 0..3 {
            assert_eq!(
                simultaneous("alice", "bob"),
                (NegotiationAction::Wait, NegotiationAction::AcceptAndOffer)
            );
            assert_eq!(
                simultaneous("bob", "alice"),
                (NegotiationAction::AcceptAndOffer, NegotiationAction::Wait)
            );
        }
    }

    #[test]
    fn test_full_round_after_glare() {
        let mut alice = NegotiationCoordinator::new("alice", "bob");
        let mut bob = NegotiationCoordinator::new("bob", "alice");
        alice.on_renegotiation_needed();
        bob.on_renegotiation_needed();
        alice.on_remote_negotiation_request();
        bob.on_remote_negotiation_request();
        assert_eq!(bob.state(), NegotiationState::Accepted);

        // Bob's acceptance answers Alice's request
        assert_eq!(alice.on_remote_negotiation_accepted(), NegotiationAction::Wait);
        assert_eq!(alice.state(), NegotiationState::Received);

        assert_eq!(alice.on_stable(), NegotiationAction::Wait);
        assert_eq!(bob.on_stable(), NegotiationAction::Wait);
        assert_eq!(alice.state(), NegotiationState::None);
        assert_eq!(bob.state(), NegotiationState::None);
    }

    #[test]
    fn test_uncontested_request_is_accepted() {
        let mut side = NegotiationCoordinator::new("alice", "bob");
        assert_eq!(
            side.on_remote_negotiation_request(),
            NegotiationAction::AcceptAndOffer
        );
        // A request arriving mid-round is served once the round completes
        assert_eq!(side.on_remote_negotiation_request(), NegotiationAction::Wait);
        assert_eq!(side.on_remote_negotiation_request(), NegotiationAction::Ignore);
        assert_eq!(side.on_stable(), NegotiationAction::AcceptAndOffer);
        assert_eq!(side.state(), NegotiationState::Accepted);
        assert_eq!(side.on_stable(), NegotiationAction::Wait);
    }

    #[test]
    fn test_need_during_round_is_replayed_on_stable() {
        let mut side = NegotiationCoordinator::new("alice", "bob");
        side.on_remote_negotiation_request();
        assert_eq!(side.on_renegotiation_needed(), NegotiationAction::Wait);
        assert_eq!(side.on_stable(), NegotiationAction::SendRequest);
        assert_eq!(side.state(), NegotiationState::Sent);
    }

    #[test]
    fn test_stable_does_not_complete_outstanding_request() {
        let mut side = NegotiationCoordinator::new("alice", "bob");
        side.on_renegotiation_needed();
        assert_eq!(side.on_stable(), NegotiationAction::Wait);
        assert_eq!(side.state(), NegotiationState::Sent);
    }

    #[test]
    fn test_unexpected_accept_is_ignored() {
        let mut side = NegotiationCoordinator::new("alice", "bob");
        assert_eq!(
            side.on_remote_negotiation_accepted(),
            NegotiationAction::Ignore
        );
        assert_eq!(side.state(), NegotiationState::None);
    }

    #[test]
    fn test_single_offer_slot() {
        let mut side = NegotiationCoordinator::new("alice", "bob");
        assert!(side.try_begin_offer());
        assert!(!side.try_begin_offer());
        assert!(side.offer_settled());
        assert!(!side.is_creating_offer());
        assert!(side.try_begin_offer());
        assert!(!side.offer_settled());
    }

    #[test]
    fn test_invitation_glare_rule() {
        assert!(NegotiationCoordinator::new("alice", "bob").accepts_remote_invitation());
        assert!(!NegotiationCoordinator::new("bob", "alice").accepts_remote_invitation());
    }
}
