//! In-memory scripted media engine
//!
//! Implements the offer/answer state machine of a real engine without any
//! network or codec work. Descriptions are plain text listing the local
//! streams (`a=msid:`) and data channels (`a=data:`), so two loopback
//! connections exchanging descriptions see each other's streams appear.
//! ICE "connects" as soon as both descriptions are applied.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    ConnectionStats, EngineEventSink, IceCandidate, IceConnectionState, IceGatheringState,
    MediaKind, MediaStream, MediaTrack, OfferOptions, PeerConnection, PeerConnectionEvent,
    PeerConnectionFactory, SdpType, SessionDescription, SignalingState, StatsReport,
};
use crate::config::ChannelConfig;
use crate::error::{Result, SessionError};

/// Engine operations that can be made to fail once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopbackOp {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
    AddStream,
    GetStats,
    SendData,
}

/// Loopback engine behaviour
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Candidates emitted after each local description
    pub candidates_per_description: usize,
    /// Report ICE connected once both descriptions are applied
    pub auto_connect: bool,
    /// Raise renegotiation-needed when streams or data channels change
    pub renegotiation_events: bool,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            candidates_per_description: 2,
            auto_connect: true,
            renegotiation_events: true,
        }
    }
}

/// Factory for [`LoopbackPeerConnection`]s
///
/// Keeps every connection it created so tests can inspect and poke them.
pub struct LoopbackFactory {
    options: LoopbackOptions,
    connections: Mutex<Vec<Arc<LoopbackPeerConnection>>>,
    next_id: AtomicUsize,
    init_calls: AtomicUsize,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::with_options(LoopbackOptions::default())
    }

    pub fn with_options(options: LoopbackOptions) -> Self {
        Self {
            options,
            connections: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            init_calls: AtomicUsize::new(0),
        }
    }

    pub fn connections(&self) -> Vec<Arc<LoopbackPeerConnection>> {
        self.connections.lock().clone()
    }

    pub fn last_connection(&self) -> Option<Arc<LoopbackPeerConnection>> {
        self.connections.lock().last().cloned()
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackFactory {
    fn initialize(&self) -> Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_peer_connection(
        &self,
        config: &ChannelConfig,
        events: EngineEventSink,
    ) -> Result<Arc<dyn PeerConnection>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Creating loopback connection {} with {} ICE servers",
            id,
            config.ice_servers.len()
        );
        let pc = Arc::new(LoopbackPeerConnection::new(id, self.options.clone(), events));
        self.connections.lock().push(pc.clone());
        Ok(pc)
    }
}

#[derive(Debug)]
struct LoopbackState {
    signaling: SignalingState,
    ice: IceConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    local_streams: Vec<MediaStream>,
    remote_streams: BTreeMap<String, MediaStream>,
    data_channels: Vec<String>,
    open_channels: HashSet<String>,
    added_candidates: Vec<IceCandidate>,
    sent_data: Vec<(String, String)>,
    bitrates: HashMap<MediaKind, u64>,
    failures: HashSet<LoopbackOp>,
    description_version: u32,
    ice_generation: u32,
    candidate_seq: u32,
}

/// Scripted engine connection
pub struct LoopbackPeerConnection {
    id: usize,
    options: LoopbackOptions,
    events: EngineEventSink,
    state: Mutex<LoopbackState>,
}

impl LoopbackPeerConnection {
    fn new(id: usize, options: LoopbackOptions, events: EngineEventSink) -> Self {
        Self {
            id,
            options,
            events,
            state: Mutex::new(LoopbackState {
                signaling: SignalingState::Stable,
                ice: IceConnectionState::New,
                local: None,
                remote: None,
                local_streams: Vec::new(),
                remote_streams: BTreeMap::new(),
                data_channels: Vec::new(),
                open_channels: HashSet::new(),
                added_candidates: Vec::new(),
                sent_data: Vec::new(),
                bitrates: HashMap::new(),
                failures: HashSet::new(),
                description_version: 0,
                ice_generation: 0,
                candidate_seq: 0,
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Make the next call of `op` fail
    pub fn fail_next(&self, op: LoopbackOp) {
        self.state.lock().failures.insert(op);
    }

    /// Raise an arbitrary engine callback
    pub fn inject(&self, event: PeerConnectionEvent) {
        self.events.emit(event);
    }

    /// Deliver an inbound data channel message
    pub fn deliver_data(&self, label: &str, message: &str) {
        self.events.emit(PeerConnectionEvent::DataChannelMessage {
            label: label.to_string(),
            message: message.to_string(),
        });
    }

    pub fn ice_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().signaling == SignalingState::Closed
    }

    pub fn local_stream_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .local_streams
            .iter()
            .map(|s| s.id().to_string())
            .collect()
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().added_candidates.clone()
    }

    pub fn sent_data(&self) -> Vec<(String, String)> {
        self.state.lock().sent_data.clone()
    }

    pub fn max_bitrate(&self, kind: MediaKind) -> Option<u64> {
        self.state.lock().bitrates.get(&kind).copied()
    }

    fn check(&self, state: &mut LoopbackState, op: LoopbackOp) -> Result<()> {
        if state.signaling == SignalingState::Closed {
            return Err(SessionError::MediaEngine(format!(
                "{:?} on closed connection {}",
                op, self.id
            )));
        }
        if state.failures.remove(&op) {
            return Err(SessionError::MediaEngine(format!("{:?} failed", op)));
        }
        Ok(())
    }

    fn emit_all(&self, events: Vec<PeerConnectionEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    fn render_sdp(&self, state: &LoopbackState, sdp_type: SdpType) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=loopback-{}\r\na=ice-ufrag:lb{}g{}\r\n",
            self.id, state.description_version, sdp_type, self.id, state.ice_generation
        );
        for stream in &state.local_streams {
            for track in stream.tracks() {
                let kind = match track.kind {
                    MediaKind::Audio => "audio",
                    MediaKind::Video => "video",
                };
                sdp.push_str(&format!("a=msid:{} {} {}\r\n", stream.id(), track.id, kind));
            }
        }
        for label in &state.data_channels {
            sdp.push_str(&format!("a=data:{}\r\n", label));
        }
        sdp
    }

    fn gather_candidates(&self, state: &mut LoopbackState, events: &mut Vec<PeerConnectionEvent>) {
        if self.options.candidates_per_description == 0 {
            return;
        }
        events.push(PeerConnectionEvent::IceGatheringChange(
            IceGatheringState::Gathering,
        ));
        for _ in 0..self.options.candidates_per_description {
            state.candidate_seq += 1;
            let candidate = IceCandidate::new(
                format!(
                    "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                    state.candidate_seq,
                    40000 + state.candidate_seq
                ),
                "0",
                0,
            );
            events.push(PeerConnectionEvent::IceCandidate(candidate));
        }
        events.push(PeerConnectionEvent::IceGatheringChange(
            IceGatheringState::Complete,
        ));
    }

    fn sync_remote_streams(&self, state: &mut LoopbackState, events: &mut Vec<PeerConnectionEvent>) {
        let sdp = state.remote.as_ref().map(|d| d.sdp.clone()).unwrap_or_default();
        let advertised = parse_streams(&sdp);

        let gone: Vec<String> = state
            .remote_streams
            .keys()
            .filter(|id| !advertised.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(stream) = state.remote_streams.remove(&id) {
                events.push(PeerConnectionEvent::RemoveStream(stream));
            }
        }
        for (id, stream) in advertised {
            if !state.remote_streams.contains_key(&id) {
                state.remote_streams.insert(id, stream.clone());
                events.push(PeerConnectionEvent::AddStream(stream));
            }
        }
    }

    fn maybe_connect(&self, state: &mut LoopbackState, events: &mut Vec<PeerConnectionEvent>) {
        if !self.options.auto_connect
            || state.signaling != SignalingState::Stable
            || state.local.is_none()
            || state.remote.is_none()
        {
            return;
        }
        if matches!(
            state.ice,
            IceConnectionState::New | IceConnectionState::Checking
        ) {
            state.ice = IceConnectionState::Connected;
            events.push(PeerConnectionEvent::IceConnectionChange(
                IceConnectionState::Checking,
            ));
            events.push(PeerConnectionEvent::IceConnectionChange(
                IceConnectionState::Connected,
            ));
        }
        self.open_data_channels(state, events);
    }

    fn open_data_channels(&self, state: &mut LoopbackState, events: &mut Vec<PeerConnectionEvent>) {
        if !matches!(
            state.ice,
            IceConnectionState::Connected | IceConnectionState::Completed
        ) {
            return;
        }
        let remote_sdp = state.remote.as_ref().map(|d| d.sdp.clone()).unwrap_or_default();
        let mut labels: Vec<String> = state.data_channels.clone();
        labels.extend(parse_data_channels(&remote_sdp));
        for label in labels {
            if state.open_channels.insert(label.clone()) {
                events.push(PeerConnectionEvent::DataChannelOpen(label));
            }
        }
    }

    fn set_signaling(
        state: &mut LoopbackState,
        next: SignalingState,
        events: &mut Vec<PeerConnectionEvent>,
    ) {
        if state.signaling != next {
            state.signaling = next;
            events.push(PeerConnectionEvent::SignalingChange(next));
        }
    }
}

fn parse_streams(sdp: &str) -> BTreeMap<String, MediaStream> {
    let mut tracks: BTreeMap<String, Vec<MediaTrack>> = BTreeMap::new();
    for line in sdp.lines() {
        let Some(rest) = line.strip_prefix("a=msid:") else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let (Some(stream_id), Some(track_id), Some(kind)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let kind = match kind {
            "audio" => MediaKind::Audio,
            "video" => MediaKind::Video,
            _ => continue,
        };
        tracks.entry(stream_id.to_string()).or_default().push(MediaTrack {
            id: track_id.to_string(),
            kind,
        });
    }
    tracks
        .into_iter()
        .map(|(id, tracks)| (id.clone(), MediaStream::new(id, tracks)))
        .collect()
}

fn parse_data_channels(sdp: &str) -> Vec<String> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix("a=data:"))
        .map(|label| label.trim().to_string())
        .collect()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[async_trait]
impl PeerConnection for LoopbackPeerConnection {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        self.check(&mut state, LoopbackOp::CreateOffer)?;
        if options.ice_restart {
            state.ice_generation += 1;
        }
        state.description_version += 1;
        let mut sdp = self.render_sdp(&state, SdpType::Offer);
        if options.offer_to_receive_audio {
            sdp.push_str("a=recv:audio\r\n");
        }
        if options.offer_to_receive_video {
            sdp.push_str("a=recv:video\r\n");
        }
        trace!("Loopback {} created offer v{}", self.id, state.description_version);
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        self.check(&mut state, LoopbackOp::CreateAnswer)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(SessionError::MediaEngine(format!(
                "Cannot create answer in state {}",
                state.signaling
            )));
        }
        state.description_version += 1;
        Ok(SessionDescription::answer(
            self.render_sdp(&state, SdpType::Answer),
        ))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            self.check(&mut state, LoopbackOp::SetLocalDescription)?;
            let next = match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (sdp_type, current) => {
                    return Err(SessionError::MediaEngine(format!(
                        "Cannot set local {} in state {}",
                        sdp_type, current
                    )))
                }
            };
            state.local = Some(description);
            Self::set_signaling(&mut state, next, &mut events);
            self.gather_candidates(&mut state, &mut events);
            self.maybe_connect(&mut state, &mut events);
        }
        self.emit_all(events);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            self.check(&mut state, LoopbackOp::SetRemoteDescription)?;
            let next = match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    SignalingState::HaveRemoteOffer
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (sdp_type, current) => {
                    return Err(SessionError::MediaEngine(format!(
                        "Cannot set remote {} in state {}",
                        sdp_type, current
                    )))
                }
            };
            state.remote = Some(description);
            Self::set_signaling(&mut state, next, &mut events);
            self.sync_remote_streams(&mut state, &mut events);
            self.maybe_connect(&mut state, &mut events);
        }
        self.emit_all(events);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        self.check(&mut state, LoopbackOp::AddIceCandidate)?;
        if state.remote.is_none() {
            return Err(SessionError::MediaEngine(
                "Cannot add ICE candidate before remote description".to_string(),
            ));
        }
        state.added_candidates.push(candidate);
        Ok(())
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<()> {
        {
            let mut state = self.state.lock();
            self.check(&mut state, LoopbackOp::AddStream)?;
            if state.local_streams.iter().any(|s| s.id() == stream.id()) {
                return Err(SessionError::MediaEngine(format!(
                    "Stream {} already added",
                    stream.id()
                )));
            }
            state.local_streams.push(stream.clone());
        }
        if self.options.renegotiation_events {
            self.events.emit(PeerConnectionEvent::RenegotiationNeeded);
        }
        Ok(())
    }

    async fn remove_stream(&self, stream: &MediaStream) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.signaling == SignalingState::Closed {
                return Ok(());
            }
            let before = state.local_streams.len();
            state.local_streams.retain(|s| s.id() != stream.id());
            if state.local_streams.len() == before {
                return Err(SessionError::MediaEngine(format!(
                    "Stream {} was not added",
                    stream.id()
                )));
            }
        }
        if self.options.renegotiation_events {
            self.events.emit(PeerConnectionEvent::RenegotiationNeeded);
        }
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.signaling == SignalingState::Closed {
                return Err(SessionError::MediaEngine(
                    "Cannot create data channel on closed connection".to_string(),
                ));
            }
            if state.data_channels.iter().any(|l| l == label) {
                return Ok(());
            }
            let first = state.data_channels.is_empty();
            state.data_channels.push(label.to_string());
            if first && self.options.renegotiation_events {
                events.push(PeerConnectionEvent::RenegotiationNeeded);
            } else if state.remote.as_ref().is_some_and(|d| d.sdp.contains("a=data:")) {
                self.open_data_channels(&mut state, &mut events);
            }
        }
        self.emit_all(events);
        Ok(())
    }

    async fn send_data(&self, label: &str, message: &str) -> Result<()> {
        let mut state = self.state.lock();
        self.check(&mut state, LoopbackOp::SendData)?;
        if !state.open_channels.contains(label) {
            return Err(SessionError::MediaEngine(format!(
                "Data channel {} is not open",
                label
            )));
        }
        state.sent_data.push((label.to_string(), message.to_string()));
        Ok(())
    }

    async fn set_max_bitrate(&self, kind: MediaKind, bps: u64) -> Result<usize> {
        let mut state = self.state.lock();
        let senders = state
            .local_streams
            .iter()
            .flat_map(|s| s.tracks())
            .filter(|t| t.kind == kind)
            .count();
        if senders > 0 {
            state.bitrates.insert(kind, bps);
        }
        Ok(senders)
    }

    async fn get_stats(&self, stream: Option<&MediaStream>) -> Result<ConnectionStats> {
        let mut state = self.state.lock();
        self.check(&mut state, LoopbackOp::GetStats)?;

        let mut reports = vec![StatsReport {
            id: format!("pc-{}", self.id),
            kind: "peer-connection".to_string(),
            values: BTreeMap::from([
                (
                    "signalingState".to_string(),
                    serde_json::Value::from(state.signaling.to_string()),
                ),
                (
                    "iceConnectionState".to_string(),
                    serde_json::Value::from(state.ice.to_string()),
                ),
            ]),
        }];

        let streams = state
            .local_streams
            .iter()
            .chain(state.remote_streams.values())
            .filter(|s| stream.map_or(true, |wanted| wanted.id() == s.id()));
        for s in streams {
            for track in s.tracks() {
                reports.push(StatsReport {
                    id: track.id.clone(),
                    kind: "track".to_string(),
                    values: BTreeMap::from([
                        ("streamId".to_string(), serde_json::Value::from(s.id())),
                        (
                            "kind".to_string(),
                            serde_json::to_value(track.kind).unwrap_or_default(),
                        ),
                    ]),
                });
            }
        }

        Ok(ConnectionStats {
            timestamp_ms: now_ms(),
            reports,
        })
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    async fn close(&self) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.signaling == SignalingState::Closed {
                return Ok(());
            }
            Self::set_signaling(&mut state, SignalingState::Closed, &mut events);
            state.ice = IceConnectionState::Closed;
            state.open_channels.clear();
            events.push(PeerConnectionEvent::IceConnectionChange(
                IceConnectionState::Closed,
            ));
        }
        debug!("Loopback connection {} closed", self.id);
        self.emit_all(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn connection() -> (
        Arc<dyn PeerConnection>,
        mpsc::UnboundedReceiver<PeerConnectionEvent>,
    ) {
        let factory = LoopbackFactory::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let pc = factory
            .create_peer_connection(&ChannelConfig::default(), EngineEventSink::from_sender(tx))
            .await
            .unwrap();
        (pc, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerConnectionEvent>) -> Vec<PeerConnectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_offer_answer_reaches_connected() {
        let (offerer, mut offerer_rx) = connection().await;
        let (answerer, mut answerer_rx) = connection().await;

        offerer
            .add_stream(&MediaStream::audio_video("cam"))
            .await
            .unwrap();
        let offer = offerer.create_offer(OfferOptions::default()).await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(offerer.signaling_state(), SignalingState::HaveLocalOffer);

        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        assert_eq!(offerer.signaling_state(), SignalingState::Stable);
        assert_eq!(answerer.signaling_state(), SignalingState::Stable);

        let offerer_events = drain(&mut offerer_rx);
        assert!(offerer_events
            .iter()
            .any(|e| matches!(e, PeerConnectionEvent::RenegotiationNeeded)));
        assert!(offerer_events.iter().any(|e| matches!(
            e,
            PeerConnectionEvent::IceConnectionChange(IceConnectionState::Connected)
        )));

        let added: Vec<String> = drain(&mut answerer_rx)
            .into_iter()
            .filter_map(|e| match e {
                PeerConnectionEvent::AddStream(s) => Some(s.id().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(added, vec!["cam"]);
    }

    #[tokio::test]
    async fn test_invalid_transitions_fail() {
        let (pc, _rx) = connection().await;
        assert!(pc.create_answer().await.is_err());
        assert!(pc
            .set_remote_description(SessionDescription::answer("v=0"))
            .await
            .is_err());
        assert!(pc
            .add_ice_candidate(IceCandidate::new("candidate:1", "0", 0))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_fail_next_and_close() {
        let factory = LoopbackFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        factory
            .create_peer_connection(&ChannelConfig::default(), EngineEventSink::from_sender(tx))
            .await
            .unwrap();
        let lb = factory.last_connection().unwrap();

        lb.fail_next(LoopbackOp::CreateOffer);
        assert!(lb.create_offer(OfferOptions::default()).await.is_err());
        assert!(lb.create_offer(OfferOptions::default()).await.is_ok());

        lb.close().await.unwrap();
        assert!(lb.is_closed());
        assert!(lb.close().await.is_ok());
        assert!(lb.get_stats(None).await.is_err());
    }

    #[tokio::test]
    async fn test_bitrate_counts_senders() {
        let (pc, _rx) = connection().await;
        assert_eq!(pc.set_max_bitrate(MediaKind::Video, 1024).await.unwrap(), 0);
        pc.add_stream(&MediaStream::audio_video("s")).await.unwrap();
        assert_eq!(pc.set_max_bitrate(MediaKind::Video, 2048).await.unwrap(), 1);
    }
}
