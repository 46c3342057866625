//! webrtc-rs backed media engine
//!
//! Local media is handed in as [`WebRtcTracks`] inside the
//! [`MediaStream`] native payload. Remote tracks are grouped by their
//! stream id; webrtc-rs has no track-removed callback, so remote streams
//! are only ever reported as added.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use super::{
    ConnectionStats, EngineEventSink, IceCandidate, IceConnectionState, IceGatheringState,
    MediaKind, MediaStream, MediaTrack, OfferOptions, PeerConnection, PeerConnectionEvent,
    PeerConnectionFactory, SdpType, SessionDescription, SignalingState, StatsReport,
};
use crate::config::ChannelConfig;
use crate::error::{Result, SessionError};

/// Native payload of a local [`MediaStream`] for this engine
pub struct WebRtcTracks(pub Vec<Arc<dyn TrackLocal + Send + Sync>>);

fn engine_error(what: &str, e: impl std::fmt::Display) -> SessionError {
    SessionError::MediaEngine(format!("{}: {}", what, e))
}

/// Factory for webrtc-rs connections
pub struct WebRtcFactory {
    api: Mutex<Option<Arc<API>>>,
}

impl WebRtcFactory {
    pub fn new() -> Self {
        Self {
            api: Mutex::new(None),
        }
    }

    fn build_api() -> Result<API> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| engine_error("Failed to register codecs", e))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| engine_error("Failed to register interceptors", e))?;

        Ok(APIBuilder::new()
            .with_setting_engine(SettingEngine::default())
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

impl Default for WebRtcFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    fn initialize(&self) -> Result<()> {
        let mut api = self.api.lock();
        if api.is_none() {
            *api = Some(Arc::new(Self::build_api()?));
            info!("webrtc-rs engine initialized");
        }
        Ok(())
    }

    async fn create_peer_connection(
        &self,
        config: &ChannelConfig,
        events: EngineEventSink,
    ) -> Result<Arc<dyn PeerConnection>> {
        let api = self.api.lock().clone().ok_or_else(|| {
            SessionError::InvalidState("webrtc-rs engine is not initialized".to_string())
        })?;

        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect();
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| engine_error("Failed to create peer connection", e))?;

        let connection = Arc::new(WebRtcPeerConnection {
            pc: Arc::new(pc),
            events,
            senders: Mutex::new(HashMap::new()),
            data_channels: Arc::new(Mutex::new(HashMap::new())),
        });
        connection.setup_event_handlers();
        Ok(connection)
    }
}

type DataChannels = Arc<Mutex<HashMap<String, Arc<RTCDataChannel>>>>;

/// One webrtc-rs peer connection
pub struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    events: EngineEventSink,
    senders: Mutex<HashMap<String, Vec<Arc<RTCRtpSender>>>>,
    data_channels: DataChannels,
}

impl WebRtcPeerConnection {
    fn setup_event_handlers(&self) {
        let events = self.events.clone();
        self.pc
            .on_signaling_state_change(Box::new(move |s: RTCSignalingState| {
                if let Some(state) = map_signaling_state(s) {
                    events.emit(PeerConnectionEvent::SignalingChange(state));
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                let state = match s {
                    RTCIceConnectionState::New => Some(IceConnectionState::New),
                    RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
                    RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
                    RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
                    RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
                    RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
                    RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
                    _ => None,
                };
                if let Some(state) = state {
                    events.emit(PeerConnectionEvent::IceConnectionChange(state));
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc
            .on_ice_gathering_state_change(Box::new(move |s: RTCIceGathererState| {
                let state = match s {
                    RTCIceGathererState::New => Some(IceGatheringState::New),
                    RTCIceGathererState::Gathering => Some(IceGatheringState::Gathering),
                    RTCIceGathererState::Complete => Some(IceGatheringState::Complete),
                    _ => None,
                };
                if let Some(state) = state {
                    events.emit(PeerConnectionEvent::IceGatheringChange(state));
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                // None marks the end of gathering
                if let Some(init) = candidate.and_then(|c| c.to_json().ok()) {
                    trace!("ICE candidate: {}", init.candidate);
                    events.emit(PeerConnectionEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            events.emit(PeerConnectionEvent::RenegotiationNeeded);
            Box::pin(async {})
        }));

        let events = self.events.clone();
        let remote_streams: Arc<Mutex<HashMap<String, Vec<MediaTrack>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            let stream_id = track.stream_id();
            let first = {
                let mut streams = remote_streams.lock();
                let tracks = streams.entry(stream_id.clone()).or_default();
                tracks.push(MediaTrack {
                    id: track.id(),
                    kind,
                });
                tracks.len() == 1
            };
            if first {
                debug!("Remote stream {} started", stream_id);
                let tracks = remote_streams
                    .lock()
                    .get(&stream_id)
                    .cloned()
                    .unwrap_or_default();
                events.emit(PeerConnectionEvent::AddStream(MediaStream::new(
                    stream_id, tracks,
                )));
            }
            Box::pin(async {})
        }));

        let events = self.events.clone();
        let channels = self.data_channels.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();
                let channels = channels.clone();
                Box::pin(async move {
                    debug!("Remote data channel {}", dc.label());
                    watch_data_channel(&dc, events, channels);
                })
            }));
    }
}

fn watch_data_channel(dc: &Arc<RTCDataChannel>, events: EngineEventSink, channels: DataChannels) {
    let label = dc.label().to_string();

    let open_events = events.clone();
    let open_label = label.clone();
    let open_dc = dc.clone();
    dc.on_open(Box::new(move || {
        channels.lock().insert(open_label.clone(), open_dc);
        open_events.emit(PeerConnectionEvent::DataChannelOpen(open_label));
        Box::pin(async {})
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        match String::from_utf8(msg.data.to_vec()) {
            Ok(message) => events.emit(PeerConnectionEvent::DataChannelMessage {
                label: label.clone(),
                message,
            }),
            Err(_) => warn!("Dropping binary message on data channel {}", label),
        }
        Box::pin(async {})
    }));
}

fn map_signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    match state {
        RTCSignalingState::Stable => Some(SignalingState::Stable),
        RTCSignalingState::HaveLocalOffer => Some(SignalingState::HaveLocalOffer),
        RTCSignalingState::HaveRemoteOffer => Some(SignalingState::HaveRemoteOffer),
        RTCSignalingState::HaveLocalPranswer => Some(SignalingState::HaveLocalPranswer),
        RTCSignalingState::HaveRemotePranswer => Some(SignalingState::HaveRemotePranswer),
        RTCSignalingState::Closed => Some(SignalingState::Closed),
        _ => None,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(SessionError::Unsupported(
                "Rollback descriptions are not supported".to_string(),
            ))
        }
    };
    parsed.map_err(|e| SessionError::InvalidArgument(format!("Invalid SDP: {}", e)))
}

fn from_rtc_description(description: RTCSessionDescription) -> Option<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => return None,
    };
    Some(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: options.ice_restart,
                ..Default::default()
            }))
            .await
            .map_err(|e| engine_error("Failed to create offer", e))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| engine_error("Failed to create answer", e))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| engine_error("Failed to set local description", e))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| engine_error("Failed to set remote description", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| engine_error("Failed to add ICE candidate", e))
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<()> {
        let Some(tracks) = stream.native::<WebRtcTracks>() else {
            return Err(SessionError::InvalidArgument(format!(
                "Stream {} carries no webrtc-rs tracks",
                stream.id()
            )));
        };
        let mut added = Vec::with_capacity(tracks.0.len());
        for track in &tracks.0 {
            let sender = self
                .pc
                .add_track(track.clone())
                .await
                .map_err(|e| engine_error("Failed to add track", e))?;
            added.push(sender);
        }
        info!("Added {} tracks of stream {}", added.len(), stream.id());
        self.senders.lock().insert(stream.id().to_string(), added);
        Ok(())
    }

    async fn remove_stream(&self, stream: &MediaStream) -> Result<()> {
        let Some(senders) = self.senders.lock().remove(stream.id()) else {
            return Err(SessionError::InvalidArgument(format!(
                "Stream {} was not added",
                stream.id()
            )));
        };
        for sender in senders {
            self.pc
                .remove_track(&sender)
                .await
                .map_err(|e| engine_error("Failed to remove track", e))?;
        }
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<()> {
        if self.data_channels.lock().contains_key(label) {
            return Ok(());
        }
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(|e| engine_error("Failed to create data channel", e))?;
        watch_data_channel(&dc, self.events.clone(), self.data_channels.clone());
        info!("Data channel '{}' created", label);
        Ok(())
    }

    async fn send_data(&self, label: &str, message: &str) -> Result<()> {
        let dc = self.data_channels.lock().get(label).cloned();
        let Some(dc) = dc else {
            return Err(SessionError::InvalidState(format!(
                "Data channel {} is not open",
                label
            )));
        };
        dc.send_text(message.to_string())
            .await
            .map_err(|e| engine_error("Failed to send data", e))?;
        Ok(())
    }

    async fn set_max_bitrate(&self, kind: MediaKind, bps: u64) -> Result<usize> {
        // webrtc-rs exposes no per-sender encoding parameters
        debug!("Ignoring {:?} bitrate cap of {} bps", kind, bps);
        Ok(0)
    }

    async fn get_stats(&self, stream: Option<&MediaStream>) -> Result<ConnectionStats> {
        if let Some(stream) = stream {
            trace!("Collecting connection-wide stats for stream {}", stream.id());
        }
        let report = self.pc.get_stats().await;
        let reports = report
            .reports
            .into_iter()
            .map(|(id, entry)| {
                let value = serde_json::to_value(&entry).unwrap_or_default();
                let kind = value
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let values = match value {
                    serde_json::Value::Object(map) => map.into_iter().collect(),
                    _ => BTreeMap::new(),
                };
                StatsReport { id, kind, values }
            })
            .collect();
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Ok(ConnectionStats {
            timestamp_ms,
            reports,
        })
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state()).unwrap_or(SignalingState::Stable)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .and_then(from_rtc_description)
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.pc
            .remote_description()
            .await
            .and_then(from_rtc_description)
    }

    async fn close(&self) -> Result<()> {
        self.data_channels.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| engine_error("Failed to close peer connection", e))
    }
}
