use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::base::{self, PeerConnectionChannel};
use super::pending::{pending, Pending, Responder};
use super::MediaHandler;
use crate::config::ChannelConfig;
use crate::error::SessionError;
use crate::events::{EventQueue, ObserverList};
use crate::media::{
    ConnectionStats, IceCandidate, IceConnectionState, MediaFactory, MediaStream, OfferOptions,
    PeerConnectionEvent, SdpType, SessionDescription, SignalingState,
};
use crate::session::{
    NegotiationAction, NegotiationCoordinator, SessionEvent, SessionState, SessionStateMachine,
    SessionVariant,
};
use crate::signaling::{
    P2PMessage, P2PSignalingSender, RemoteCapabilities, SignalData, StreamTypeInfo, UserAgent,
};
use crate::stream::{LocalStream, RemoteStream, RemoteStreamKind, StreamSource};

/// Label of the data channel carrying [`P2PPeerConnectionChannel::send`]
pub const DATA_CHANNEL_LABEL: &str = "message";

/// Largest message accepted by [`P2PPeerConnectionChannel::send`]
pub const MAX_MESSAGE_LENGTH: usize = 0xFFFF;

/// Session events of one P2P channel
///
/// Every callback runs on the channel's event queue.
pub trait P2PChannelObserver: Send + Sync {
    fn on_invited(&self, _remote_id: &str) {}
    fn on_accepted(&self, _remote_id: &str) {}
    fn on_denied(&self, _remote_id: &str) {}
    /// ICE connected for the first time in this session
    fn on_started(&self, _remote_id: &str) {}
    fn on_stopped(&self, _remote_id: &str) {}
    fn on_stream_added(&self, _stream: &RemoteStream) {}
    fn on_stream_removed(&self, _stream: &RemoteStream) {}
    fn on_data(&self, _remote_id: &str, _message: &str) {}
    /// A published stream broke after the session was established
    fn on_stream_error(&self, _remote_id: &str, _stream_id: &str, _error: &SessionError) {}
}

struct P2PState {
    session: SessionStateMachine,
    negotiation: NegotiationCoordinator,
    remote_caps: RemoteCapabilities,
    is_caller: bool,
    initial_negotiation_done: bool,
    remote_description_set: bool,
    /// A local offer was wanted while signaling was not stable
    replay_offer: bool,
    pending_remote_offer: Option<SessionDescription>,
    pending_remote_candidates: Vec<IceCandidate>,
    pending_publish: Vec<(LocalStream, Responder<()>)>,
    pending_unpublish: Vec<(LocalStream, Responder<()>)>,
    published: Vec<LocalStream>,
    remote_sources: HashMap<String, RemoteStreamKind>,
    remote_streams: HashMap<String, RemoteStream>,
    pending_messages: Vec<(String, Responder<()>)>,
    data_channel_requested: bool,
    data_channel_open: bool,
    /// Bumped on every ICE transition; a reconnect timer only fires if it
    /// still matches
    ice_epoch: u64,
}

/// Everything a finished session leaves behind
struct Teardown {
    responders: Vec<Responder<()>>,
    published: Vec<String>,
    remote_streams: Vec<RemoteStream>,
}

impl P2PState {
    fn new(local_id: &str, remote_id: &str) -> Self {
        Self {
            session: SessionStateMachine::new(SessionVariant::P2P),
            negotiation: NegotiationCoordinator::new(local_id, remote_id),
            remote_caps: RemoteCapabilities::default(),
            is_caller: false,
            initial_negotiation_done: false,
            remote_description_set: false,
            replay_offer: false,
            pending_remote_offer: None,
            pending_remote_candidates: Vec::new(),
            pending_publish: Vec::new(),
            pending_unpublish: Vec::new(),
            published: Vec::new(),
            remote_sources: HashMap::new(),
            remote_streams: HashMap::new(),
            pending_messages: Vec::new(),
            data_channel_requested: false,
            data_channel_open: false,
            ice_epoch: 0,
        }
    }

    fn is_published(&self, stream_id: &str) -> bool {
        self.published.iter().any(|s| s.id() == stream_id)
    }

    /// Forget the session, keeping the state machine and capabilities
    fn reset(&mut self) -> Teardown {
        let mut responders: Vec<Responder<()>> = Vec::new();
        responders.extend(self.pending_publish.drain(..).map(|(_, r)| r));
        responders.extend(self.pending_unpublish.drain(..).map(|(_, r)| r));
        responders.extend(self.pending_messages.drain(..).map(|(_, r)| r));

        self.negotiation.reset();
        self.is_caller = false;
        self.initial_negotiation_done = false;
        self.remote_description_set = false;
        self.replay_offer = false;
        self.pending_remote_offer = None;
        self.pending_remote_candidates.clear();
        self.remote_sources.clear();
        self.data_channel_requested = false;
        self.data_channel_open = false;
        self.ice_epoch += 1;

        Teardown {
            responders,
            published: self.published.drain(..).map(|s| s.id().to_string()).collect(),
            remote_streams: self.remote_streams.drain().map(|(_, s)| s).collect(),
        }
    }
}

/// Session with one remote peer
///
/// Covers the invitation handshake, the initial offer/answer made by the
/// side whose invitation was accepted, glare-free renegotiation for stream
/// changes, and a data channel for text messages.
pub struct P2PPeerConnectionChannel {
    core: PeerConnectionChannel,
    local_id: String,
    remote_id: String,
    sender: Arc<dyn P2PSignalingSender>,
    user_agent: UserAgent,
    state: Mutex<P2PState>,
    observers: ObserverList<dyn P2PChannelObserver>,
}

impl P2PPeerConnectionChannel {
    pub fn new(
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        config: ChannelConfig,
        factory: Arc<MediaFactory>,
        sender: Arc<dyn P2PSignalingSender>,
        events: EventQueue,
    ) -> Arc<Self> {
        let local_id = local_id.into();
        let remote_id = remote_id.into();
        let label = format!("p2p-{}", remote_id);
        Arc::new(Self {
            core: PeerConnectionChannel::new(label, config, factory, events),
            state: Mutex::new(P2PState::new(&local_id, &remote_id)),
            local_id,
            remote_id,
            sender,
            user_agent: UserAgent::default(),
            observers: ObserverList::new(),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn P2PChannelObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn P2PChannelObserver>) {
        self.observers.remove(observer);
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn session_state(&self) -> SessionState {
        self.state.lock().session.state()
    }

    pub fn remote_capabilities(&self) -> RemoteCapabilities {
        self.state.lock().remote_caps
    }

    pub fn published_stream_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .published
            .iter()
            .map(|s| s.id().to_string())
            .collect()
    }

    pub fn remote_streams(&self) -> Vec<RemoteStream> {
        self.state.lock().remote_streams.values().cloned().collect()
    }

    /// Invite the remote peer
    pub fn invite(self: &Arc<Self>) -> Pending<()> {
        if let Err(e) = self.state.lock().session.transition(SessionEvent::Invite) {
            return self.invalid_state(format!("Cannot invite in state {}.", e.from));
        }
        info!("{}: inviting {}", self.core.label(), self.remote_id);
        // Clears whatever the remote side may still hold for us
        drop(self.send_message(P2PMessage::Closed));
        self.send_message(P2PMessage::Invitation {
            ua: Some(self.user_agent.clone()),
        })
    }

    /// Accept the remote invitation
    pub fn accept(self: &Arc<Self>) -> Pending<()> {
        {
            let mut st = self.state.lock();
            if let Err(e) = st.session.transition(SessionEvent::Accept) {
                drop(st);
                return self.invalid_state(format!("Cannot accept in state {}.", e.from));
            }
            st.is_caller = false;
        }
        base::ensure_peer_connection(self);
        self.send_message(P2PMessage::Accepted {
            ua: Some(self.user_agent.clone()),
        })
    }

    /// Deny the remote invitation
    pub fn deny(&self) -> Pending<()> {
        if let Err(e) = self.state.lock().session.transition(SessionEvent::Deny) {
            return self.invalid_state(format!("Cannot deny in state {}.", e.from));
        }
        self.send_message(P2PMessage::Denied)
    }

    /// End the session and tell the remote peer
    pub fn stop(self: &Arc<Self>) -> Pending<()> {
        let teardown = {
            let mut st = self.state.lock();
            if let Err(e) = st.session.transition(SessionEvent::Stop) {
                drop(st);
                return self.invalid_state(format!("No session to stop in state {}.", e.from));
            }
            st.reset()
        };
        info!("{}: stopping session", self.core.label());
        self.finish(
            teardown,
            SessionError::Aborted("Session stopped.".to_string()),
            false,
        );
        self.send_message(P2PMessage::Closed)
    }

    /// Publish `stream` to the remote peer
    ///
    /// Queued until signaling is stable; resolves once the stream is on the
    /// connection.
    pub fn publish(self: &Arc<Self>, stream: LocalStream) -> Pending<()> {
        let events = self.core.events();
        if stream.media_stream().is_none() {
            return Pending::failed(
                events,
                SessionError::InvalidArgument("Cannot publish a stream without media.".to_string()),
            );
        }
        let (responder, pending) = pending(events);
        {
            let mut st = self.state.lock();
            let check = if !matches!(
                st.session.state(),
                SessionState::Matched | SessionState::Connecting | SessionState::Connected
            ) {
                Err(SessionError::InvalidState(format!(
                    "Cannot publish in state {}.",
                    st.session.state()
                )))
            } else if st.is_published(stream.id())
                || st.pending_publish.iter().any(|(s, _)| s.id() == stream.id())
            {
                Err(SessionError::InvalidArgument(
                    "The stream is already published.".to_string(),
                ))
            } else if !st.pending_publish.is_empty() {
                Err(SessionError::Busy("Another stream is being published.".to_string()))
            } else if !st.remote_caps.multiple_streams && !st.published.is_empty() {
                Err(SessionError::Unsupported(
                    "The remote endpoint accepts a single stream only.".to_string(),
                ))
            } else {
                Ok(())
            };
            if let Err(e) = check {
                drop(st);
                responder.fail(e);
                return pending;
            }
            st.pending_publish.push((stream, responder));
        }
        self.drain_pending_streams();
        pending
    }

    /// Stop publishing `stream`
    pub fn unpublish(self: &Arc<Self>, stream: &LocalStream) -> Pending<()> {
        let (responder, pending) = pending(self.core.events());
        {
            let mut st = self.state.lock();
            let check = if !st.remote_caps.stream_removable {
                Err(SessionError::Unsupported(
                    "The remote endpoint cannot remove streams.".to_string(),
                ))
            } else if !st.is_published(stream.id()) {
                Err(SessionError::InvalidArgument(
                    "The stream is not published.".to_string(),
                ))
            } else if st.pending_unpublish.iter().any(|(s, _)| s.id() == stream.id()) {
                Err(SessionError::Busy(
                    "The stream is already being unpublished.".to_string(),
                ))
            } else {
                Ok(())
            };
            if let Err(e) = check {
                drop(st);
                responder.fail(e);
                return pending;
            }
            st.pending_unpublish.push((stream.clone(), responder));
        }
        self.drain_pending_streams();
        pending
    }

    /// Send a text message over the data channel, opening it if needed
    pub fn send(self: &Arc<Self>, message: impl Into<String>) -> Pending<()> {
        let message = message.into();
        let events = self.core.events();
        if message.len() > MAX_MESSAGE_LENGTH {
            return Pending::failed(
                events,
                SessionError::InvalidArgument("Message is too long.".to_string()),
            );
        }
        let (responder, pending) = pending(events);

        let mut create_channel = false;
        let ready = {
            let mut st = self.state.lock();
            if !matches!(
                st.session.state(),
                SessionState::Matched | SessionState::Connecting | SessionState::Connected
            ) {
                drop(st);
                responder.fail(SessionError::InvalidState(
                    "Cannot send a message without a session.".to_string(),
                ));
                return pending;
            }
            if st.data_channel_open {
                Some((message, responder))
            } else {
                st.pending_messages.push((message, responder));
                if !st.data_channel_requested {
                    st.data_channel_requested = true;
                    create_channel = true;
                }
                None
            }
        };

        if let Some((message, responder)) = ready {
            self.send_data(message, responder);
        } else if create_channel {
            base::ensure_peer_connection(self);
            base::post_media(self, "create data channel", |this, pc| async move {
                if let Err(e) = pc.create_data_channel(DATA_CHANNEL_LABEL).await {
                    warn!("{}: failed to create data channel: {}", this.core.label(), e);
                    let failed: Vec<_> = {
                        let mut st = this.state.lock();
                        st.data_channel_requested = false;
                        st.pending_messages.drain(..).map(|(_, r)| r).collect()
                    };
                    for responder in failed {
                        responder.fail(e.clone());
                    }
                }
            });
        }
        pending
    }

    /// Engine statistics of the whole connection
    ///
    /// Needs a stream in either direction.
    pub fn get_connection_stats(self: &Arc<Self>) -> Pending<ConnectionStats> {
        let events = self.core.events();
        let has_stream = {
            let st = self.state.lock();
            st.session.is_active() && (!st.published.is_empty() || !st.remote_streams.is_empty())
        };
        if !has_stream {
            return Pending::failed(
                events,
                SessionError::InvalidState("No published or received stream.".to_string()),
            );
        }
        let (responder, pending) = pending(events);
        base::get_connection_stats(self, None, responder);
        pending
    }

    /// Handle a message the remote peer sent through the relay
    pub fn on_incoming_signaling_message(self: &Arc<Self>, message: &str) {
        let message = match P2PMessage::parse(message) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}: ignoring malformed message: {}", self.core.label(), e);
                return;
            }
        };
        trace!("{}: received {}", self.core.label(), message.type_name());

        match message {
            P2PMessage::Invitation { ua } => self.on_invitation(ua),
            P2PMessage::Accepted { ua } => self.on_acceptance(ua),
            P2PMessage::Denied => self.on_denied(),
            P2PMessage::Closed => self.on_remote_stopped(),
            P2PMessage::Signal { data } => self.on_signal(data),
            P2PMessage::NegotiationNeeded => {
                let action = {
                    let mut st = self.state.lock();
                    if !st.session.is_active() {
                        warn!("{}: negotiation request without a session", self.core.label());
                        return;
                    }
                    st.negotiation.on_remote_negotiation_request()
                };
                self.perform(action);
            }
            P2PMessage::NegotiationAccepted => {
                self.state.lock().negotiation.on_remote_negotiation_accepted();
            }
            P2PMessage::StreamType { data } => {
                let kind = if data.source == "screen" {
                    RemoteStreamKind::Screen
                } else {
                    RemoteStreamKind::Camera
                };
                self.state.lock().remote_sources.insert(data.stream_id, kind);
            }
        }
    }

    fn on_invitation(self: &Arc<Self>, ua: Option<UserAgent>) {
        let (previous, next) = {
            let mut st = self.state.lock();
            if let Some(ua) = &ua {
                st.remote_caps = RemoteCapabilities::from_user_agent(ua);
            }
            let accept_remote = st.negotiation.accepts_remote_invitation();
            let previous = st.session.state();
            match st.session.transition(SessionEvent::ReceiveInvite { accept_remote }) {
                Ok(next) => {
                    if next == SessionState::Matched {
                        st.is_caller = false;
                    }
                    (previous, next)
                }
                Err(_) => return,
            }
        };

        match (previous, next) {
            (SessionState::Offered, SessionState::Matched) => {
                info!(
                    "{}: both sides invited, accepting the invitation of {}",
                    self.core.label(),
                    self.remote_id
                );
                base::ensure_peer_connection(self);
                drop(self.send_message(P2PMessage::Accepted {
                    ua: Some(self.user_agent.clone()),
                }));
                let remote_id = self.remote_id.clone();
                self.notify(move |o| o.on_accepted(&remote_id));
            }
            (SessionState::Offered, _) => {
                debug!("{}: both sides invited, keeping our invitation", self.core.label());
            }
            _ => {
                let remote_id = self.remote_id.clone();
                self.notify(move |o| o.on_invited(&remote_id));
            }
        }
    }

    fn on_acceptance(self: &Arc<Self>, ua: Option<UserAgent>) {
        {
            let mut st = self.state.lock();
            if let Some(ua) = &ua {
                st.remote_caps = RemoteCapabilities::from_user_agent(ua);
            }
            if st.session.transition(SessionEvent::RemoteAccepted).is_err() {
                return;
            }
            st.is_caller = true;
            let _ = st.session.transition(SessionEvent::NegotiationStarted);
        }
        info!("{}: {} accepted, creating offer", self.core.label(), self.remote_id);
        let remote_id = self.remote_id.clone();
        self.notify(move |o| o.on_accepted(&remote_id));

        base::ensure_peer_connection(self);
        self.create_offer();
    }

    fn on_denied(&self) {
        if self
            .state
            .lock()
            .session
            .transition(SessionEvent::RemoteDenied)
            .is_err()
        {
            return;
        }
        let remote_id = self.remote_id.clone();
        self.notify(move |o| o.on_denied(&remote_id));
    }

    fn on_remote_stopped(&self) {
        let teardown = {
            let mut st = self.state.lock();
            if st.session.transition(SessionEvent::RemoteStopped).is_err() {
                return;
            }
            st.reset()
        };
        info!("{}: {} stopped the session", self.core.label(), self.remote_id);
        self.finish(
            teardown,
            SessionError::Aborted("Remote side stopped the session.".to_string()),
            false,
        );
    }

    fn on_signal(self: &Arc<Self>, data: SignalData) {
        match data {
            SignalData::Offer { sdp } => {
                {
                    let mut st = self.state.lock();
                    match st.session.state() {
                        SessionState::Matched => {
                            let _ = st.session.transition(SessionEvent::NegotiationStarted);
                        }
                        SessionState::Connecting | SessionState::Connected => {}
                        state => {
                            warn!("{}: ignoring offer in state {}", self.core.label(), state);
                            return;
                        }
                    }
                }
                base::ensure_peer_connection(self);
                let offer = SessionDescription::offer(sdp);
                base::post_media(self, "apply remote offer", move |this, pc| async move {
                    let busy = pc.signaling_state() != SignalingState::Stable
                        || this.state.lock().negotiation.is_creating_offer();
                    if busy {
                        debug!("{}: holding remote offer until stable", this.core.label());
                        this.state.lock().pending_remote_offer = Some(offer);
                        return;
                    }
                    base::apply_remote_description(this, pc, offer).await;
                });
            }
            SignalData::Answer { sdp } => {
                let answer = SessionDescription::answer(sdp);
                base::post_media(self, "apply remote answer", move |this, pc| async move {
                    if pc.signaling_state() != SignalingState::HaveLocalOffer {
                        warn!(
                            "{}: ignoring answer in signaling state {}",
                            this.core.label(),
                            pc.signaling_state()
                        );
                        return;
                    }
                    base::apply_remote_description(this, pc, answer).await;
                });
            }
            SignalData::Candidates {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                let candidate = IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    username_fragment: None,
                };
                {
                    let mut st = self.state.lock();
                    if !st.remote_description_set {
                        st.pending_remote_candidates.push(candidate);
                        return;
                    }
                }
                base::add_ice_candidate(self, candidate);
            }
        }
    }

    fn perform(self: &Arc<Self>, action: NegotiationAction) {
        match action {
            NegotiationAction::SendRequest => {
                drop(self.send_message(P2PMessage::NegotiationNeeded));
            }
            NegotiationAction::AcceptAndOffer => {
                drop(self.send_message(P2PMessage::NegotiationAccepted));
                self.create_offer();
            }
            NegotiationAction::Wait | NegotiationAction::Ignore => {}
        }
    }

    /// Start a local offer, or remember it until signaling is stable
    fn create_offer(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            if self.core.signaling_state() != SignalingState::Stable {
                st.replay_offer = true;
                return;
            }
            if !st.negotiation.try_begin_offer() {
                return;
            }
        }
        base::create_offer(
            self,
            OfferOptions {
                offer_to_receive_audio: true,
                offer_to_receive_video: true,
                ice_restart: false,
            },
        );
    }

    /// Move queued publish/unpublish requests onto the connection
    fn drain_pending_streams(self: &Arc<Self>) {
        let (publish, unpublish) = {
            let mut st = self.state.lock();
            if !st.session.is_active()
                || self.core.signaling_state() != SignalingState::Stable
                || st.negotiation.is_creating_offer()
            {
                return;
            }
            let publish: Vec<_> = st.pending_publish.drain(..).collect();
            let unpublish: Vec<_> = st.pending_unpublish.drain(..).collect();
            for (stream, _) in &publish {
                st.published.push(stream.clone());
            }
            for (stream, _) in &unpublish {
                st.published.retain(|s| s.id() != stream.id());
            }
            (publish, unpublish)
        };

        for (stream, responder) in publish {
            let Some(media) = stream.media_stream() else {
                self.state.lock().published.retain(|s| s.id() != stream.id());
                responder.fail(SessionError::InvalidArgument(
                    "The stream was released before it was published.".to_string(),
                ));
                continue;
            };
            let source = match stream.source() {
                StreamSource::ScreenCast => "screen",
                _ => "video",
            };
            drop(self.send_message(P2PMessage::StreamType {
                data: StreamTypeInfo {
                    stream_id: stream.id().to_string(),
                    source: source.to_string(),
                },
            }));
            self.update_stream(media, responder, true);
        }

        for (stream, responder) in unpublish {
            match stream.media_stream() {
                Some(media) => self.update_stream(media, responder, false),
                None => responder.succeed(()),
            }
        }
    }

    fn update_stream(self: &Arc<Self>, media: MediaStream, responder: Responder<()>, add: bool) {
        base::post_media_or(self, move |this, pc| async move {
            let result = match pc {
                Ok(pc) if add => pc.add_stream(&media).await,
                Ok(pc) => pc.remove_stream(&media).await,
                Err(e) => Err(e),
            };
            if add && result.is_err() {
                if let Some(this) = this {
                    this.state.lock().published.retain(|s| s.id() != media.id());
                }
            }
            responder.resolve(result);
        });
    }

    fn send_data(self: &Arc<Self>, message: String, responder: Responder<()>) {
        base::post_media_or(self, move |_, pc| async move {
            let result = match pc {
                Ok(pc) => pc.send_data(DATA_CHANNEL_LABEL, &message).await,
                Err(e) => Err(e),
            };
            responder.resolve(result);
        });
    }

    fn send_message(&self, message: P2PMessage) -> Pending<()> {
        let (responder, pending) = pending(self.core.events());
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                responder.fail(e);
                return pending;
            }
        };
        let sender = self.sender.clone();
        let remote_id = self.remote_id.clone();
        let label = self.core.label().to_string();
        let kind = message.type_name();
        self.core.post_signaling(async move {
            let result = sender.send_signaling_message(json, &remote_id).await;
            if let Err(e) = &result {
                warn!("{}: failed to send {}: {}", label, kind, e);
            }
            responder.resolve(result);
        });
        pending
    }

    fn send_candidate(&self, candidate: IceCandidate) {
        drop(self.send_message(P2PMessage::Signal {
            data: SignalData::from_candidate(&candidate),
        }));
    }

    fn invalid_state(&self, reason: String) -> Pending<()> {
        Pending::failed(self.core.events(), SessionError::InvalidState(reason))
    }

    fn notify<F>(&self, f: F)
    where
        F: Fn(&dyn P2PChannelObserver) + Send + 'static,
    {
        let observers = self.observers.snapshot();
        self.core.events().post(move || {
            for observer in &observers {
                f(observer.as_ref());
            }
        });
    }

    /// Release what a finished session held. `error` fails the pending
    /// operations; with `escalate` it is also reported for every stream
    /// that was published.
    fn finish(&self, teardown: Teardown, error: SessionError, escalate: bool) {
        self.core.close_peer_connection();
        for responder in teardown.responders {
            responder.fail(error.clone());
        }
        for stream in &teardown.remote_streams {
            stream.detach();
        }

        let remote_id = self.remote_id.clone();
        let broken = if escalate {
            teardown.published
        } else {
            Vec::new()
        };
        let removed = teardown.remote_streams;
        self.notify(move |o| {
            for stream_id in &broken {
                o.on_stream_error(&remote_id, stream_id, &error);
            }
            for stream in &removed {
                o.on_stream_removed(stream);
            }
            o.on_stopped(&remote_id);
        });
    }

    /// Stop the session locally after an unrecoverable failure
    fn terminate(self: &Arc<Self>, error: SessionError) {
        let (previous, teardown) = {
            let mut st = self.state.lock();
            let previous = st.session.state();
            if st.session.transition(SessionEvent::Stop).is_err() {
                return;
            }
            (previous, st.reset())
        };
        warn!("{}: terminating session: {}", self.core.label(), error);
        self.finish(teardown, error, previous == SessionState::Connected);
        drop(self.send_message(P2PMessage::Closed));
    }

    fn on_signaling_change(self: &Arc<Self>, state: SignalingState) {
        trace!("{}: signaling state {}", self.core.label(), state);
        self.core.update_signaling_state(state);
        if state == SignalingState::HaveLocalOffer {
            let replay = self.state.lock().negotiation.offer_settled();
            if replay {
                self.state.lock().replay_offer = true;
            }
            return;
        }
        if state != SignalingState::Stable {
            return;
        }

        let (held_offer, action, replay) = {
            let mut st = self.state.lock();
            if st.remote_description_set {
                st.initial_negotiation_done = true;
            }
            let held_offer = st.pending_remote_offer.take();
            if held_offer.is_some() {
                (held_offer, NegotiationAction::Wait, false)
            } else {
                let replay = std::mem::take(&mut st.replay_offer);
                (None, st.negotiation.on_stable(), replay)
            }
        };

        for candidate in self.core.drain_candidates() {
            self.send_candidate(candidate);
        }

        if let Some(offer) = held_offer {
            debug!("{}: applying held remote offer", self.core.label());
            // Keeps local offers out until the held offer is answered
            self.core
                .update_signaling_state(SignalingState::HaveRemoteOffer);
            base::set_remote_description(self, offer);
            return;
        }

        self.drain_pending_streams();
        self.perform(action);
        if replay && action != NegotiationAction::AcceptAndOffer {
            self.create_offer();
        }
    }

    fn on_ice_connection_change(self: &Arc<Self>, state: IceConnectionState) {
        debug!("{}: ICE connection state {}", self.core.label(), state);
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                let started = {
                    let mut st = self.state.lock();
                    st.ice_epoch += 1;
                    let previous = st.session.state();
                    if st.session.transition(SessionEvent::IceConnected).is_err() {
                        return;
                    }
                    previous == SessionState::Connecting
                };
                if started {
                    info!("{}: session with {} started", self.core.label(), self.remote_id);
                    let remote_id = self.remote_id.clone();
                    self.notify(move |o| o.on_started(&remote_id));
                }
                self.drain_pending_streams();
            }
            IceConnectionState::Disconnected => {
                let epoch = {
                    let mut st = self.state.lock();
                    if !st.session.is_active() {
                        return;
                    }
                    st.ice_epoch += 1;
                    st.ice_epoch
                };
                let timeout = self.core.config().reconnect_timeout();
                base::schedule(self, timeout, move |this| {
                    let expired = {
                        let st = this.state.lock();
                        st.ice_epoch == epoch && st.session.is_active()
                    };
                    if expired {
                        this.terminate(SessionError::MediaEngine(
                            "ICE connection could not be re-established.".to_string(),
                        ));
                    }
                });
            }
            IceConnectionState::Closed | IceConnectionState::Failed => {
                let (previous, teardown) = {
                    let mut st = self.state.lock();
                    let previous = st.session.state();
                    if st.session.transition(SessionEvent::IceClosed).is_err() {
                        return;
                    }
                    (previous, st.reset())
                };
                self.finish(
                    teardown,
                    SessionError::MediaEngine(format!("ICE connection {}.", state)),
                    previous == SessionState::Connected,
                );
            }
            _ => {}
        }
    }

    fn on_remote_stream_added(&self, media: MediaStream) {
        let stream = {
            let mut st = self.state.lock();
            let kind = st
                .remote_sources
                .get(media.id())
                .copied()
                .unwrap_or(RemoteStreamKind::Camera);
            let stream = RemoteStream::builder(media.id(), self.remote_id.as_str(), kind)
                .audio(media.has_audio())
                .video(media.has_video())
                .build();
            stream.attach(media);
            st.remote_streams
                .insert(stream.id().to_string(), stream.clone());
            stream
        };
        debug!("{}: remote stream {} added", self.core.label(), stream.id());
        self.notify(move |o| o.on_stream_added(&stream));
    }

    fn on_remote_stream_removed(&self, media: MediaStream) {
        let Some(stream) = self.state.lock().remote_streams.remove(media.id()) else {
            return;
        };
        stream.detach();
        debug!("{}: remote stream {} removed", self.core.label(), stream.id());
        self.notify(move |o| o.on_stream_removed(&stream));
    }
}

impl MediaHandler for P2PPeerConnectionChannel {
    fn core(&self) -> &PeerConnectionChannel {
        &self.core
    }

    fn on_engine_event(self: Arc<Self>, event: PeerConnectionEvent) {
        match event {
            PeerConnectionEvent::SignalingChange(state) => self.on_signaling_change(state),
            PeerConnectionEvent::IceConnectionChange(state) => self.on_ice_connection_change(state),
            PeerConnectionEvent::IceGatheringChange(state) => {
                trace!("{}: ICE gathering {:?}", self.core.label(), state);
            }
            PeerConnectionEvent::IceCandidate(candidate) => {
                if let Some(candidate) = self.core.admit_candidate(candidate) {
                    self.send_candidate(candidate);
                }
            }
            PeerConnectionEvent::AddStream(media) => self.on_remote_stream_added(media),
            PeerConnectionEvent::RemoveStream(media) => self.on_remote_stream_removed(media),
            PeerConnectionEvent::RenegotiationNeeded => {
                let action = {
                    let mut st = self.state.lock();
                    if !st.session.is_active() {
                        trace!("{}: renegotiation before the session started", self.core.label());
                        return;
                    }
                    if st.is_caller && !st.initial_negotiation_done {
                        None
                    } else {
                        Some(st.negotiation.on_renegotiation_needed())
                    }
                };
                match action {
                    // The first exchange is still running; fold the change
                    // into an offer of our own
                    None => self.create_offer(),
                    Some(action) => self.perform(action),
                }
            }
            PeerConnectionEvent::DataChannelOpen(label) => {
                if label != DATA_CHANNEL_LABEL {
                    debug!("{}: ignoring data channel {}", self.core.label(), label);
                    return;
                }
                let queued: Vec<_> = {
                    let mut st = self.state.lock();
                    st.data_channel_open = true;
                    st.pending_messages.drain(..).collect()
                };
                for (message, responder) in queued {
                    self.send_data(message, responder);
                }
            }
            PeerConnectionEvent::DataChannelMessage { label, message } => {
                trace!("{}: data on {}", self.core.label(), label);
                let remote_id = self.remote_id.clone();
                self.notify(move |o| o.on_data(&remote_id, &message));
            }
        }
    }

    fn on_peer_connection_failed(self: Arc<Self>, error: SessionError) {
        self.terminate(error);
    }

    fn send_local_description(self: Arc<Self>, description: SessionDescription) {
        debug!("{}: sending local {}", self.core.label(), description.sdp_type);
        drop(self.send_message(P2PMessage::Signal {
            data: SignalData::from_description(&description),
        }));
    }

    fn on_remote_description_set(self: Arc<Self>, sdp_type: SdpType) {
        let held: Vec<_> = {
            let mut st = self.state.lock();
            st.remote_description_set = true;
            st.pending_remote_candidates.drain(..).collect()
        };
        trace!(
            "{}: remote {} applied, {} held candidates",
            self.core.label(),
            sdp_type,
            held.len()
        );
        for candidate in held {
            base::add_ice_candidate(&self, candidate);
        }
    }

    fn on_negotiation_failed(self: Arc<Self>, error: SessionError) {
        self.state.lock().negotiation.offer_settled();
        self.terminate(error);
    }
}

impl Drop for P2PPeerConnectionChannel {
    fn drop(&mut self) {
        let state = self.state.get_mut().session.state();
        if matches!(state, SessionState::Ready | SessionState::Pending) {
            return;
        }
        let Ok(json) = P2PMessage::Closed.to_json() else {
            return;
        };
        debug!("{}: closing session on drop", self.core.label());
        let sender = self.sender.clone();
        let remote_id = self.remote_id.clone();
        self.core.post_signaling(async move {
            let _ = sender.send_signaling_message(json, &remote_id).await;
        });
    }
}
