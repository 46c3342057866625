//! Peer-connection channels
//!
//! A channel owns one engine connection and drives it through the session
//! state machine. [`ConferencePeerConnectionChannel`] carries a single
//! publication or subscription against a conference server;
//! [`P2PPeerConnectionChannel`] carries a whole session with one remote peer.

mod base;
mod conference;
mod p2p;
mod pending;

use std::sync::Arc;

pub use conference::{ConferenceChannelObserver, ConferencePeerConnectionChannel};
pub use p2p::{P2PChannelObserver, P2PPeerConnectionChannel};
pub use pending::{pending, Pending, Responder};

pub(crate) use base::PeerConnectionChannel;

use crate::error::SessionError;
use crate::media::{PeerConnectionEvent, SdpType, SessionDescription};

/// Receiver of engine callbacks and engine-step completions
///
/// Every method runs on the channel's media context.
pub(crate) trait MediaHandler: Send + Sync + 'static {
    fn core(&self) -> &PeerConnectionChannel;

    fn on_engine_event(self: Arc<Self>, event: PeerConnectionEvent);

    /// The factory could not create a connection
    fn on_peer_connection_failed(self: Arc<Self>, error: SessionError);

    /// A local description was applied and must be sent
    fn send_local_description(self: Arc<Self>, description: SessionDescription);

    fn on_remote_description_set(self: Arc<Self>, _sdp_type: SdpType) {}

    /// Creating or applying a description failed
    fn on_negotiation_failed(self: Arc<Self>, error: SessionError);
}
