//! Media engine boundary
//!
//! The session layer never touches SDP, codecs or ICE itself. It drives an
//! engine through the [`PeerConnection`] trait and receives engine callbacks
//! as [`PeerConnectionEvent`]s through an [`EngineEventSink`].

pub mod loopback;
#[cfg(feature = "webrtc-engine")]
pub mod webrtc_engine;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, trace};

use crate::channel::MediaHandler;
use crate::config::ChannelConfig;
use crate::error::{Result, SessionError};
use crate::events::TaskQueue;

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Pranswer => write!(f, "pranswer"),
            SdpType::Answer => write!(f, "answer"),
            SdpType::Rollback => write!(f, "rollback"),
        }
    }
}

/// Session description as exchanged through signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment", skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: impl Into<String>, sdp_mline_index: u16) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some(sdp_mid.into()),
            sdp_mline_index: Some(sdp_mline_index),
            username_fragment: None,
        }
    }
}

/// Offer/answer phase of one engine connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingState::Stable => write!(f, "stable"),
            SignalingState::HaveLocalOffer => write!(f, "have-local-offer"),
            SignalingState::HaveRemoteOffer => write!(f, "have-remote-offer"),
            SignalingState::HaveLocalPranswer => write!(f, "have-local-pranswer"),
            SignalingState::HaveRemotePranswer => write!(f, "have-remote-pranswer"),
            SignalingState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IceConnectionState::New => write!(f, "new"),
            IceConnectionState::Checking => write!(f, "checking"),
            IceConnectionState::Connected => write!(f, "connected"),
            IceConnectionState::Completed => write!(f, "completed"),
            IceConnectionState::Disconnected => write!(f, "disconnected"),
            IceConnectionState::Failed => write!(f, "failed"),
            IceConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Track inside a [`MediaStream`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Engine-level media stream handle
///
/// Cheap to clone. `native` carries engine-specific payload (for example the
/// webrtc-rs local tracks); engines that do not need it leave it empty.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
    native: Option<Arc<dyn Any + Send + Sync>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
            native: None,
        }
    }

    /// Stream with one audio and one video track named after the stream
    pub fn audio_video(id: impl Into<String>) -> Self {
        let id = id.into();
        let tracks = vec![
            MediaTrack {
                id: format!("{}-audio", id),
                kind: MediaKind::Audio,
            },
            MediaTrack {
                id: format!("{}-video", id),
                kind: MediaKind::Video,
            },
        ];
        Self::new(id, tracks)
    }

    pub fn with_native(mut self, native: Arc<dyn Any + Send + Sync>) -> Self {
        self.native = Some(native);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == MediaKind::Audio)
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == MediaKind::Video)
    }

    /// Engine payload, if it has the requested type
    pub fn native<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.native.as_ref().and_then(|n| n.downcast_ref::<T>())
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks)
            .field("native", &self.native.is_some())
            .finish()
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.tracks == other.tracks
    }
}

/// One report inside a [`ConnectionStats`] snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub values: BTreeMap<String, serde_json::Value>,
}

/// Stats snapshot of one connection, opaque to the session layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    pub reports: Vec<StatsReport>,
}

/// Offer constraints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfferOptions {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
    pub ice_restart: bool,
}

/// Callbacks raised by the media engine
#[derive(Debug, Clone)]
pub enum PeerConnectionEvent {
    SignalingChange(SignalingState),
    IceConnectionChange(IceConnectionState),
    IceGatheringChange(IceGatheringState),
    IceCandidate(IceCandidate),
    AddStream(MediaStream),
    RemoveStream(MediaStream),
    RenegotiationNeeded,
    DataChannelOpen(String),
    DataChannelMessage { label: String, message: String },
}

/// One engine connection
///
/// Every call is issued from the owning channel's media context, one at a
/// time. Implementations report callbacks through the [`EngineEventSink`]
/// they were created with.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_stream(&self, stream: &MediaStream) -> Result<()>;

    async fn remove_stream(&self, stream: &MediaStream) -> Result<()>;

    async fn create_data_channel(&self, label: &str) -> Result<()>;

    async fn send_data(&self, label: &str, message: &str) -> Result<()>;

    /// Cap the send bitrate of every sender of `kind`
    ///
    /// Returns the number of senders updated. Only meaningful once a local
    /// description is applied.
    async fn set_max_bitrate(&self, kind: MediaKind, bps: u64) -> Result<usize>;

    async fn get_stats(&self, stream: Option<&MediaStream>) -> Result<ConnectionStats>;

    fn signaling_state(&self) -> SignalingState;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn remote_description(&self) -> Option<SessionDescription>;

    async fn close(&self) -> Result<()>;
}

/// Engine backend that creates connections
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// One-time engine initialization
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn create_peer_connection(
        &self,
        config: &ChannelConfig,
        events: EngineEventSink,
    ) -> Result<Arc<dyn PeerConnection>>;
}

/// Explicitly initialized engine factory shared by channels
pub struct MediaFactory {
    backend: Arc<dyn PeerConnectionFactory>,
    initialized: AtomicBool,
}

impl MediaFactory {
    pub fn new(backend: Arc<dyn PeerConnectionFactory>) -> Self {
        Self {
            backend,
            initialized: AtomicBool::new(false),
        }
    }

    /// Initialize the backend. Repeated calls are no-ops.
    pub fn init(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        self.backend.initialize()?;
        self.initialized.store(true, Ordering::Release);
        info!("Media engine initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub async fn create_peer_connection(
        &self,
        config: &ChannelConfig,
        events: EngineEventSink,
    ) -> Result<Arc<dyn PeerConnection>> {
        if !self.is_initialized() {
            return Err(SessionError::InvalidState(
                "Media factory used before init()".to_string(),
            ));
        }
        self.backend.create_peer_connection(config, events).await
    }
}

enum SinkTarget {
    Channel {
        media: TaskQueue,
        handler: Weak<dyn MediaHandler>,
        generation: u64,
    },
    Sender(mpsc::UnboundedSender<PeerConnectionEvent>),
}

/// Where an engine reports its callbacks
///
/// For a channel, every event becomes a task on the channel's media context,
/// ordered with the engine operations posted there.
#[derive(Clone)]
pub struct EngineEventSink {
    target: Arc<SinkTarget>,
}

impl EngineEventSink {
    pub(crate) fn for_channel(
        media: TaskQueue,
        handler: Weak<dyn MediaHandler>,
        generation: u64,
    ) -> Self {
        Self {
            target: Arc::new(SinkTarget::Channel {
                media,
                handler,
                generation,
            }),
        }
    }

    /// Sink that forwards events into a plain channel
    pub fn from_sender(tx: mpsc::UnboundedSender<PeerConnectionEvent>) -> Self {
        Self {
            target: Arc::new(SinkTarget::Sender(tx)),
        }
    }

    pub fn emit(&self, event: PeerConnectionEvent) {
        match self.target.as_ref() {
            SinkTarget::Channel {
                media,
                handler,
                generation,
            } => {
                let handler = handler.clone();
                let generation = *generation;
                media.post(async move {
                    let Some(handler) = handler.upgrade() else {
                        return;
                    };
                    // Callbacks of a replaced connection are stale
                    if handler.core().is_current(generation) {
                        handler.on_engine_event(event);
                    } else {
                        trace!("Dropping stale engine event {:?}", event);
                    }
                });
            }
            SinkTarget::Sender(tx) => {
                let _ = tx.send(event);
            }
        }
    }
}

impl fmt::Debug for EngineEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target.as_ref() {
            SinkTarget::Channel { media, .. } => write!(f, "EngineEventSink({})", media.name()),
            SinkTarget::Sender(_) => write!(f, "EngineEventSink(sender)"),
        }
    }
}
