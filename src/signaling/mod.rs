//! Signaling boundary
//!
//! The wire transport is not part of this crate. Channels talk to it through
//! [`ConferenceSignaling`] (conference server) or [`P2PSignalingSender`]
//! (relay to a remote peer). Every call is awaited on the channel's
//! signaling outbox, so messages of one channel leave in order.

pub mod conference;
pub mod memory;
pub mod p2p;

use async_trait::async_trait;

use crate::error::Result;

pub use conference::{
    ConferenceSignal, ControlOperation, InitializationRequest, PublishOptions, SdpMessage,
    SignalingPayload, StreamEvent, SubscribeRequest, TrackKind,
};
pub use memory::{MemoryHub, SignalingReceiver};
pub use p2p::{P2PMessage, RemoteCapabilities, SignalData, StreamTypeInfo, UserAgent};

/// Transport to a conference server
#[async_trait]
pub trait ConferenceSignaling: Send + Sync {
    /// Announce a publication or subscription. Resolves with the session id
    /// assigned by the server.
    async fn send_initialization(&self, request: InitializationRequest) -> Result<String>;

    async fn send_sdp(&self, message: SdpMessage) -> Result<()>;

    async fn send_stream_event(&self, event: StreamEvent, session_id: &str) -> Result<()>;

    /// Control a publication
    async fn send_stream_control_message(
        &self,
        session_id: &str,
        action: TrackKind,
        operation: ControlOperation,
    ) -> Result<()>;

    /// Control a subscription
    async fn send_subscription_control_message(
        &self,
        session_id: &str,
        action: TrackKind,
        operation: ControlOperation,
    ) -> Result<()>;
}

/// Transport to a remote peer, usually a relay server
#[async_trait]
pub trait P2PSignalingSender: Send + Sync {
    async fn send_signaling_message(&self, message: String, remote_id: &str) -> Result<()>;
}
