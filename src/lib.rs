//! rtc-session - session and negotiation layer for real-time media
//!
//! This crate drives peer connections for conference (publish/subscribe
//! against a media server) and P2P sessions. It owns the session state
//! machines, glare-free renegotiation, ICE candidate ordering and the
//! event delivery to the application. Signaling transport and the media
//! engine are injected through traits.

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod session;
pub mod signaling;
pub mod stream;

pub use channel::{
    ConferenceChannelObserver, ConferencePeerConnectionChannel, P2PChannelObserver,
    P2PPeerConnectionChannel, Pending,
};
pub use client::PeerClient;
pub use config::ChannelConfig;
pub use error::{Result, SessionError};
pub use events::EventQueue;
pub use media::{MediaFactory, MediaStream, PeerConnection, PeerConnectionFactory};
pub use session::{SessionState, SessionStateMachine};
pub use stream::{LocalStream, RemoteStream, StreamSource};
