use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use super::base::{self, PeerConnectionChannel};
use super::pending::{pending, Pending, Responder};
use super::MediaHandler;
use crate::config::ChannelConfig;
use crate::error::{Result, SessionError};
use crate::events::{EventQueue, ObserverList};
use crate::media::{
    ConnectionStats, IceCandidate, IceConnectionState, MediaFactory, MediaStream, OfferOptions,
    PeerConnectionEvent, SessionDescription, SignalingState,
};
use crate::session::{SessionEvent, SessionState, SessionStateMachine, SessionVariant};
use crate::signaling::conference::{
    AudioFrom, MediaSource, PublishMedia, SubscribeMedia, VideoFrom, VideoParameters,
};
use crate::signaling::{
    ConferenceSignal, ConferenceSignaling, ControlOperation, InitializationRequest,
    PublishOptions, SdpMessage, StreamEvent, SubscribeRequest, TrackKind,
};
use crate::stream::{LocalStream, RemoteStream, StreamSource, SubscribeOptions};

/// Notified when an established publication or subscription breaks
pub trait ConferenceChannelObserver: Send + Sync {
    fn on_stream_error(&self, stream_id: &str, error: &SessionError);
}

struct ConferenceState {
    session: SessionStateMachine,
    session_id: Option<String>,
    connected: bool,
    published: Option<LocalStream>,
    subscribed: Option<RemoteStream>,
    publish_responder: Option<Responder<String>>,
    subscribe_responder: Option<Responder<RemoteStream>>,
    offer_options: OfferOptions,
    ice_restart_needed: bool,
    /// Bumped for every publish or subscribe; guards late timers and acks
    operation: u64,
    stopped: bool,
}

impl ConferenceState {
    fn check_idle(&self) -> Result<()> {
        if self.stopped {
            return Err(SessionError::InvalidState("Channel is stopped.".to_string()));
        }
        if self.publish_responder.is_some() || self.published.is_some() {
            return Err(SessionError::Busy(
                "A stream is already published on this channel.".to_string(),
            ));
        }
        if self.subscribe_responder.is_some() || self.subscribed.is_some() {
            return Err(SessionError::Busy(
                "A stream is already subscribed on this channel.".to_string(),
            ));
        }
        Ok(())
    }

    fn has_pending(&self) -> bool {
        self.publish_responder.is_some() || self.subscribe_responder.is_some()
    }

    fn stream_event(&self) -> Option<StreamEvent> {
        if self.published.is_some() {
            Some(StreamEvent::Unpublish)
        } else if self.subscribed.is_some() {
            Some(StreamEvent::Unsubscribe)
        } else {
            None
        }
    }

    fn stream_id(&self) -> Option<String> {
        self.published
            .as_ref()
            .map(|s| s.id().to_string())
            .or_else(|| self.subscribed.as_ref().map(|s| s.id().to_string()))
    }
}

/// Pending responders taken out of the state, failed after the lock is gone
struct PendingResponders {
    publish: Option<Responder<String>>,
    subscribe: Option<Responder<RemoteStream>>,
}

impl PendingResponders {
    fn take(state: &mut ConferenceState) -> Self {
        Self {
            publish: state.publish_responder.take(),
            subscribe: state.subscribe_responder.take(),
        }
    }

    fn is_empty(&self) -> bool {
        self.publish.is_none() && self.subscribe.is_none()
    }

    fn fail(self, error: SessionError) {
        if let Some(responder) = self.publish {
            responder.fail(error.clone());
        }
        if let Some(responder) = self.subscribe {
            responder.fail(error);
        }
    }
}

enum Direction {
    Publish(MediaStream),
    Subscribe,
}

/// One publication or one subscription against a conference server
///
/// The server is authoritative: it assigns the session id, answers the
/// offers and confirms the session with a "success" message, which is what
/// resolves [`publish`](Self::publish) and [`subscribe`](Self::subscribe).
pub struct ConferencePeerConnectionChannel {
    core: PeerConnectionChannel,
    signaling: Arc<dyn ConferenceSignaling>,
    state: Mutex<ConferenceState>,
    observers: ObserverList<dyn ConferenceChannelObserver>,
}

impl ConferencePeerConnectionChannel {
    pub fn new(
        config: ChannelConfig,
        factory: Arc<MediaFactory>,
        signaling: Arc<dyn ConferenceSignaling>,
        events: EventQueue,
    ) -> Arc<Self> {
        let label = format!("conference-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        debug!("Creating channel {}", label);
        Arc::new(Self {
            core: PeerConnectionChannel::new(label, config, factory, events),
            signaling,
            state: Mutex::new(ConferenceState {
                session: SessionStateMachine::new(SessionVariant::Conference),
                session_id: None,
                connected: false,
                published: None,
                subscribed: None,
                publish_responder: None,
                subscribe_responder: None,
                offer_options: OfferOptions::default(),
                ice_restart_needed: false,
                operation: 0,
                stopped: false,
            }),
            observers: ObserverList::new(),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn ConferenceChannelObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn ConferenceChannelObserver>) {
        self.observers.remove(observer);
    }

    /// Session id assigned by the server
    pub fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    pub fn session_state(&self) -> SessionState {
        self.state.lock().session.state()
    }

    /// Whether ICE is connected
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Publish `stream`. Resolves with the session id once the server
    /// confirms the publication.
    pub fn publish(self: &Arc<Self>, stream: LocalStream) -> Pending<String> {
        let events = self.core.events();
        let Some(media) = stream.media_stream() else {
            return Pending::failed(
                events,
                SessionError::InvalidArgument("Cannot publish a stream without media.".to_string()),
            );
        };
        let (responder, pending) = pending(events);

        let operation = {
            let mut st = self.state.lock();
            if let Err(e) = st.check_idle() {
                drop(st);
                responder.fail(e);
                return pending;
            }
            st.published = Some(stream.clone());
            st.publish_responder = Some(responder);
            st.offer_options = OfferOptions {
                offer_to_receive_audio: false,
                offer_to_receive_video: false,
                ice_restart: false,
            };
            st.operation += 1;
            st.operation
        };

        let audio_source = match stream.source() {
            StreamSource::ScreenCast => StreamSource::ScreenCast,
            _ => StreamSource::Mic,
        };
        let video_source = match stream.source() {
            StreamSource::Mic => StreamSource::Camera,
            source => source,
        };
        let options = PublishOptions::webrtc(
            PublishMedia {
                audio: media.has_audio().then_some(MediaSource {
                    source: audio_source,
                }),
                video: media.has_video().then_some(MediaSource {
                    source: video_source,
                }),
            },
            stream.attributes().clone(),
        );
        info!("{}: publishing stream {}", self.core.label(), stream.id());

        base::ensure_peer_connection(self);
        self.send_initialization(
            InitializationRequest::Publish {
                options,
                stream_label: stream.id().to_string(),
            },
            Direction::Publish(media),
            operation,
        );
        pending
    }

    /// Subscribe to `stream`. Resolves with the same stream, media attached,
    /// once the server confirms the subscription.
    pub fn subscribe(
        self: &Arc<Self>,
        stream: RemoteStream,
        options: SubscribeOptions,
    ) -> Pending<RemoteStream> {
        let events = self.core.events();
        if let Some(resolution) = options.resolution {
            if !stream.capabilities().resolutions.contains(&resolution) {
                return Pending::failed(
                    events,
                    SessionError::InvalidArgument("Unsupported resolution.".to_string()),
                );
            }
        }
        if !stream.has_audio() && !stream.has_video() {
            return Pending::failed(
                events,
                SessionError::InvalidArgument("Stream has neither audio nor video.".to_string()),
            );
        }
        let (responder, pending) = pending(events);

        let operation = {
            let mut st = self.state.lock();
            if let Err(e) = st.check_idle() {
                drop(st);
                responder.fail(e);
                return pending;
            }
            st.subscribed = Some(stream.clone());
            st.subscribe_responder = Some(responder);
            st.offer_options = OfferOptions {
                offer_to_receive_audio: stream.has_audio(),
                offer_to_receive_video: stream.has_video(),
                ice_restart: false,
            };
            st.operation += 1;
            st.operation
        };

        let bitrate = options.quality.bitrate_multiplier().map(str::to_string);
        let parameters = (options.resolution.is_some() || bitrate.is_some()).then(|| {
            VideoParameters {
                resolution: options.resolution,
                bitrate,
            }
        });
        let media = SubscribeMedia {
            audio: stream.has_audio().then(|| AudioFrom {
                from: stream.id().to_string(),
            }),
            video: stream.has_video().then(|| VideoFrom {
                from: stream.id().to_string(),
                parameters,
            }),
        };
        info!("{}: subscribing stream {}", self.core.label(), stream.id());

        base::ensure_peer_connection(self);
        self.send_initialization(
            InitializationRequest::Subscribe {
                options: SubscribeRequest::webrtc(media),
                stream_id: stream.id().to_string(),
            },
            Direction::Subscribe,
            operation,
        );
        pending
    }

    /// Stop the publication identified by `session_id`
    pub fn unpublish(&self, session_id: &str) -> Pending<()> {
        let events = self.core.events();
        let aborted = {
            let mut st = self.state.lock();
            if st.published.is_none() || st.session_id.as_deref() != Some(session_id) {
                return Pending::failed(
                    events,
                    SessionError::InvalidArgument(
                        "Session ID doesn't match published stream.".to_string(),
                    ),
                );
            }
            let aborted = PendingResponders::take(&mut st);
            st.published = None;
            self.end_session_locked(&mut st);
            aborted
        };
        aborted.fail(SessionError::Aborted(
            "Unpublished before the server confirmed the publication.".to_string(),
        ));
        self.core.close_peer_connection();
        self.send_stream_event(StreamEvent::Unpublish, session_id)
    }

    /// Stop the subscription identified by `session_id`
    pub fn unsubscribe(&self, session_id: &str) -> Pending<()> {
        let events = self.core.events();
        {
            let mut st = self.state.lock();
            if st.subscribed.is_none() || st.session_id.as_deref() != Some(session_id) {
                return Pending::failed(
                    events,
                    SessionError::InvalidArgument(
                        "Session ID doesn't match subscribed stream.".to_string(),
                    ),
                );
            }
            if st.subscribe_responder.is_some() {
                return Pending::failed(
                    events,
                    SessionError::InvalidState("Cannot unsubscribe when subscribing.".to_string()),
                );
            }
            if let Some(stream) = st.subscribed.take() {
                stream.detach();
            }
            self.end_session_locked(&mut st);
        }
        self.core.close_peer_connection();
        self.send_stream_event(StreamEvent::Unsubscribe, session_id)
    }

    pub fn play_audio(&self) -> Pending<()> {
        self.send_control(TrackKind::Audio, ControlOperation::Play)
    }

    pub fn pause_audio(&self) -> Pending<()> {
        self.send_control(TrackKind::Audio, ControlOperation::Pause)
    }

    pub fn play_video(&self) -> Pending<()> {
        self.send_control(TrackKind::Video, ControlOperation::Play)
    }

    pub fn pause_video(&self) -> Pending<()> {
        self.send_control(TrackKind::Video, ControlOperation::Pause)
    }

    pub fn play_audio_video(&self) -> Pending<()> {
        self.send_control(TrackKind::AudioAndVideo, ControlOperation::Play)
    }

    pub fn pause_audio_video(&self) -> Pending<()> {
        self.send_control(TrackKind::AudioAndVideo, ControlOperation::Pause)
    }

    /// Engine statistics of the published or subscribed stream
    pub fn get_connection_stats(self: &Arc<Self>) -> Pending<ConnectionStats> {
        let events = self.core.events();
        let media = {
            let st = self.state.lock();
            if let Some(stream) = &st.published {
                stream.media_stream()
            } else if let Some(stream) = &st.subscribed {
                stream.media_stream()
            } else {
                return Pending::failed(
                    events,
                    SessionError::InvalidState("No stream on this channel.".to_string()),
                );
            }
        };
        let (responder, pending) = pending(events);
        base::get_connection_stats(self, media, responder);
        pending
    }

    /// Restart ICE on the current connection once signaling is stable
    pub fn ice_restart(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            if !st.session.is_active() {
                warn!("{}: ICE restart without an active session", self.core.label());
                return;
            }
            if self.core.signaling_state() != SignalingState::Stable {
                debug!("{}: deferring ICE restart until stable", self.core.label());
                st.ice_restart_needed = true;
                return;
            }
        }
        self.restart_ice();
    }

    /// Close the connection. Pending operations are aborted. Repeated calls
    /// are no-ops.
    pub fn stop(&self) {
        let aborted = {
            let mut st = self.state.lock();
            if st.stopped {
                return;
            }
            st.stopped = true;
            st.connected = false;
            if st.session.is_active() {
                let _ = st.session.transition(SessionEvent::Stop);
            }
            PendingResponders::take(&mut st)
        };
        info!("{}: stopping", self.core.label());
        self.core.close_peer_connection();
        aborted.fail(SessionError::Aborted("Channel stopped.".to_string()));
    }

    /// The conference server connection is gone
    ///
    /// A pending publish or subscribe fails and its session is released
    /// without a message to the server.
    pub fn on_server_disconnected(&self) {
        let aborted = {
            let mut st = self.state.lock();
            if !st.has_pending() {
                return;
            }
            let aborted = PendingResponders::take(&mut st);
            self.take_session_locked(&mut st);
            aborted
        };
        warn!("{}: server disconnected during negotiation", self.core.label());
        self.core.close_peer_connection();
        aborted.fail(SessionError::Transport("Server disconnected.".to_string()));
    }

    /// Handle a signaling payload the server sent for this session
    pub fn on_signaling_message(self: &Arc<Self>, payload: &Value) {
        match ConferenceSignal::parse(payload) {
            Some(ConferenceSignal::Success) => self.on_server_success(),
            Some(ConferenceSignal::Failure) => {
                let aborted = self.abort_operation(
                    SessionError::Unknown(
                        "MCU internal error during connection establishment.".to_string(),
                    ),
                    None,
                );
                if !aborted {
                    warn!("{}: server reported failure on a live session", self.core.label());
                }
            }
            Some(ConferenceSignal::Description(description)) => {
                debug!("{}: received remote {}", self.core.label(), description.sdp_type);
                base::set_remote_description(self, description);
            }
            None => warn!("{}: ignoring unrecognized signaling payload {}", self.core.label(), payload),
        }
    }

    fn on_server_success(&self) {
        let (session_id, publish, subscribe) = {
            let mut st = self.state.lock();
            let publish = st.publish_responder.take();
            let subscribe = st
                .subscribe_responder
                .take()
                .map(|r| (r, st.subscribed.clone()));
            (st.session_id.clone(), publish, subscribe)
        };

        if let Some(responder) = publish {
            match session_id.clone() {
                Some(id) => responder.succeed(id),
                None => responder.fail(SessionError::InvalidState(
                    "Server confirmed a publication without a session.".to_string(),
                )),
            }
        }
        if let Some((responder, stream)) = subscribe {
            match stream {
                Some(stream) => responder.succeed(stream),
                None => responder.fail(SessionError::InvalidState(
                    "Subscription ended before the server confirmed it.".to_string(),
                )),
            }
        }
        if let Some(id) = session_id {
            info!("{}: session {} confirmed", self.core.label(), id);
        }
    }

    fn send_initialization(
        self: &Arc<Self>,
        request: InitializationRequest,
        direction: Direction,
        operation: u64,
    ) {
        let weak = Arc::downgrade(self);
        let signaling = self.signaling.clone();
        self.core.post_signaling(async move {
            let result = signaling.send_initialization(request).await;
            if let Some(this) = weak.upgrade() {
                this.on_initialized(result, direction, operation);
            }
        });

        if let Some(timeout) = self.core.config().negotiation_timeout() {
            base::schedule(self, timeout, move |this| {
                this.on_negotiation_timeout(operation, timeout)
            });
        }
    }

    fn on_initialized(self: Arc<Self>, result: Result<String>, direction: Direction, operation: u64) {
        let session_id = match result {
            Ok(id) => id,
            Err(e) => {
                warn!("{}: initialization failed: {}", self.core.label(), e);
                self.abort_operation(e, Some(operation));
                return;
            }
        };

        let options = {
            let mut st = self.state.lock();
            if st.operation != operation || st.stopped || !st.has_pending() {
                None
            } else {
                st.session_id = Some(session_id.clone());
                let _ = st.session.transition(SessionEvent::NegotiationStarted);
                Some(st.offer_options)
            }
        };

        let Some(options) = options else {
            info!(
                "{}: session {} acknowledged after the operation ended",
                self.core.label(),
                session_id
            );
            let event = match direction {
                Direction::Publish(_) => StreamEvent::Unpublish,
                Direction::Subscribe => StreamEvent::Unsubscribe,
            };
            drop(self.send_stream_event(event, &session_id));
            return;
        };

        debug!("{}: session id {}", self.core.label(), session_id);
        if let Direction::Publish(media) = direction {
            base::post_media(&self, "add stream", move |this, pc| async move {
                if let Err(e) = pc.add_stream(&media).await {
                    warn!("{}: failed to add stream: {}", this.core.label(), e);
                    this.on_negotiation_failed(e);
                }
            });
        }
        base::create_offer(&self, options);
    }

    fn on_negotiation_timeout(&self, operation: u64, timeout: Duration) {
        let expired = {
            let st = self.state.lock();
            st.operation == operation && st.has_pending()
        };
        if expired {
            warn!("{}: negotiation timed out", self.core.label());
            self.abort_operation(
                SessionError::Timeout(format!(
                    "No confirmation from the server within {} ms.",
                    timeout.as_millis()
                )),
                Some(operation),
            );
        }
    }

    /// Fail the pending publish or subscribe and tear the session down.
    /// Returns false when nothing was pending.
    fn abort_operation(&self, error: SessionError, operation: Option<u64>) -> bool {
        let (aborted, teardown) = {
            let mut st = self.state.lock();
            if operation.is_some_and(|op| op != st.operation) || !st.has_pending() {
                return false;
            }
            let aborted = PendingResponders::take(&mut st);
            let teardown = self.take_session_locked(&mut st);
            (aborted, teardown)
        };
        self.core.close_peer_connection();
        if let Some((event, session_id)) = teardown {
            drop(self.send_stream_event(event, &session_id));
        }
        aborted.fail(error);
        true
    }

    /// A failure outside any pending operation. A stream that was handed
    /// out is reported once, then its publication or subscription is ended.
    /// Returns false when the channel holds no such stream.
    fn escalate(&self, error: SessionError) -> bool {
        let (stream_id, aborted, teardown) = {
            let mut st = self.state.lock();
            if st.stopped || st.session_id.is_none() {
                return false;
            }
            let stream_id = st.stream_id();
            let aborted = PendingResponders::take(&mut st);
            let teardown = self.take_session_locked(&mut st);
            (stream_id, aborted, teardown)
        };
        self.core.close_peer_connection();
        if let Some((event, session_id)) = teardown {
            drop(self.send_stream_event(event, &session_id));
        }

        if !aborted.is_empty() {
            aborted.fail(error);
            return true;
        }
        let Some(stream_id) = stream_id else {
            return true;
        };
        warn!("{}: stream {} failed: {}", self.core.label(), stream_id, error);
        let observers = self.observers.snapshot();
        self.core.events().post(move || {
            for observer in observers {
                observer.on_stream_error(&stream_id, &error);
            }
        });
        true
    }

    /// Clear the held stream and return the server event that ends it
    fn take_session_locked(&self, st: &mut ConferenceState) -> Option<(StreamEvent, String)> {
        let event = st.stream_event();
        st.published = None;
        if let Some(stream) = st.subscribed.take() {
            stream.detach();
        }
        self.end_session_locked(st);
        event.zip(st.session_id.take())
    }

    fn end_session_locked(&self, st: &mut ConferenceState) {
        st.connected = false;
        st.stopped = true;
        st.ice_restart_needed = false;
        if st.session.is_active() {
            let _ = st.session.transition(SessionEvent::Stop);
        }
    }

    fn send_stream_event(&self, event: StreamEvent, session_id: &str) -> Pending<()> {
        let (responder, pending) = pending(self.core.events());
        let signaling = self.signaling.clone();
        let session_id = session_id.to_string();
        let label = self.core.label().to_string();
        self.core.post_signaling(async move {
            let result = signaling.send_stream_event(event, &session_id).await;
            if let Err(e) = &result {
                warn!("{}: failed to send {} for {}: {}", label, event.as_str(), session_id, e);
            }
            responder.resolve(result);
        });
        pending
    }

    fn send_control(&self, kind: TrackKind, operation: ControlOperation) -> Pending<()> {
        let events = self.core.events();
        let target = {
            let st = self.state.lock();
            match (&st.session_id, &st.published, &st.subscribed) {
                (Some(id), Some(_), _) => Some((id.clone(), true)),
                (Some(id), None, Some(_)) => Some((id.clone(), false)),
                _ => None,
            }
        };
        let Some((session_id, publication)) = target else {
            return Pending::failed(
                events,
                SessionError::InvalidState(
                    "No published or subscribed stream on this channel.".to_string(),
                ),
            );
        };

        let (responder, pending) = pending(events);
        let signaling = self.signaling.clone();
        self.core.post_signaling(async move {
            let result = if publication {
                signaling
                    .send_stream_control_message(&session_id, kind, operation)
                    .await
            } else {
                signaling
                    .send_subscription_control_message(&session_id, kind, operation)
                    .await
            };
            responder.resolve(result);
        });
        pending
    }

    fn restart_ice(self: &Arc<Self>) {
        let options = {
            let mut st = self.state.lock();
            st.ice_restart_needed = false;
            OfferOptions {
                ice_restart: true,
                ..st.offer_options
            }
        };
        info!("{}: restarting ICE", self.core.label());
        self.core.clear_candidates();
        base::create_offer(self, options);
    }

    fn send_candidate(&self, candidate: IceCandidate) {
        let Some(session_id) = self.session_id() else {
            warn!("{}: dropping candidate without a session", self.core.label());
            return;
        };
        let signaling = self.signaling.clone();
        let label = self.core.label().to_string();
        self.core.post_signaling(async move {
            let message = SdpMessage::candidate(&session_id, &candidate);
            if let Err(e) = signaling.send_sdp(message).await {
                warn!("{}: failed to send candidate: {}", label, e);
            }
        });
    }

    fn on_signaling_change(self: &Arc<Self>, state: SignalingState) {
        trace!("{}: signaling state {}", self.core.label(), state);
        self.core.update_signaling_state(state);
        if state != SignalingState::Stable {
            return;
        }
        let restart = self.state.lock().ice_restart_needed;
        if restart {
            self.restart_ice();
            return;
        }
        for candidate in self.core.drain_candidates() {
            self.send_candidate(candidate);
        }
    }

    fn on_ice_connection_change(&self, state: IceConnectionState) {
        debug!("{}: ICE connection state {}", self.core.label(), state);
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                let mut st = self.state.lock();
                if st.session.transition(SessionEvent::IceConnected).is_ok() {
                    st.connected = true;
                }
            }
            IceConnectionState::Closed | IceConnectionState::Failed => {
                let _ = self.state.lock().session.transition(SessionEvent::IceClosed);
                let aborted = self.abort_operation(
                    SessionError::MediaEngine(format!(
                        "ICE connection {} before the session was established.",
                        state
                    )),
                    None,
                );
                if !aborted {
                    self.escalate(SessionError::MediaEngine(format!("ICE connection {}.", state)));
                }
            }
            _ => {}
        }
    }
}

impl MediaHandler for ConferencePeerConnectionChannel {
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
            PeerConnectionEvent::AddStream(media) => {
                let subscribed = self.state.lock().subscribed.clone();
                match subscribed {
                    Some(stream) => {
                        debug!("{}: media for {} arrived", self.core.label(), stream.id());
                        stream.attach(media);
                    }
                    None => debug!("{}: ignoring remote media {}", self.core.label(), media.id()),
                }
            }
            PeerConnectionEvent::RemoveStream(_) => {
                if let Some(stream) = self.state.lock().subscribed.clone() {
                    stream.detach();
                }
            }
            // Offers are driven by publish and subscribe, never by the engine
            PeerConnectionEvent::RenegotiationNeeded => {}
            PeerConnectionEvent::DataChannelOpen(_)
            | PeerConnectionEvent::DataChannelMessage { .. } => {}
        }
    }

    fn on_peer_connection_failed(self: Arc<Self>, error: SessionError) {
        self.abort_operation(error, None);
    }

    fn send_local_description(self: Arc<Self>, description: SessionDescription) {
        let Some(session_id) = self.session_id() else {
            warn!("{}: local {} without a session", self.core.label(), description.sdp_type);
            return;
        };
        let weak = Arc::downgrade(&self);
        let signaling = self.signaling.clone();
        self.core.post_signaling(async move {
            let message = SdpMessage::description(&session_id, &description);
            if let Err(e) = signaling.send_sdp(message).await {
                if let Some(this) = weak.upgrade() {
                    this.on_negotiation_failed(e);
                }
            }
        });
    }

    fn on_negotiation_failed(self: Arc<Self>, error: SessionError) {
        if self.abort_operation(error.clone(), None) {
            return;
        }
        if !self.escalate(error.clone()) {
            warn!("{}: negotiation failed outside an operation: {}", self.core.label(), error);
        }
    }
}

impl Drop for ConferencePeerConnectionChannel {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        let Some((event, session_id)) = st.stream_event().zip(st.session_id.clone()) else {
            return;
        };
        debug!("{}: ending session {} on drop", self.core.label(), session_id);
        let signaling = self.signaling.clone();
        self.core.post_signaling(async move {
            if let Err(e) = signaling.send_stream_event(event, &session_id).await {
                warn!("Failed to send {} for {}: {}", event.as_str(), session_id, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{VideoCodec, VideoEncodingParameters};
    use crate::media::loopback::LoopbackFactory;
    use crate::media::{EngineEventSink, MediaKind, PeerConnectionFactory};
    use crate::stream::{RemoteStreamKind, Resolution, VideoQualityLevel};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockServer {
        fail_init: AtomicBool,
        inits: Mutex<Vec<InitializationRequest>>,
        sdps: Mutex<Vec<SdpMessage>>,
        stream_events: Mutex<Vec<(StreamEvent, String)>>,
        controls: Mutex<Vec<(String, bool, TrackKind, ControlOperation)>>,
    }

    impl MockServer {
        fn offers(&self) -> Vec<String> {
            self.sdps
                .lock()
                .iter()
                .filter_map(|m| match &m.signaling {
                    crate::signaling::SignalingPayload::Offer { sdp } => Some(sdp.clone()),
                    _ => None,
                })
                .collect()
        }

        fn candidates(&self) -> Vec<String> {
            self.sdps
                .lock()
                .iter()
                .filter_map(|m| match &m.signaling {
                    crate::signaling::SignalingPayload::Candidate { candidate } => {
                        Some(candidate.candidate.clone())
                    }
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl ConferenceSignaling for MockServer {
        async fn send_initialization(&self, request: InitializationRequest) -> Result<String> {
            if self.fail_init.load(Ordering::SeqCst) {
                return Err(SessionError::Transport("server unreachable".to_string()));
            }
            let mut inits = self.inits.lock();
            inits.push(request);
            Ok(format!("session-{}", inits.len()))
        }

        async fn send_sdp(&self, message: SdpMessage) -> Result<()> {
            self.sdps.lock().push(message);
            Ok(())
        }

        async fn send_stream_event(&self, event: StreamEvent, session_id: &str) -> Result<()> {
            self.stream_events.lock().push((event, session_id.to_string()));
            Ok(())
        }

        async fn send_stream_control_message(
            &self,
            session_id: &str,
            action: TrackKind,
            operation: ControlOperation,
        ) -> Result<()> {
            self.controls
                .lock()
                .push((session_id.to_string(), true, action, operation));
            Ok(())
        }

        async fn send_subscription_control_message(
            &self,
            session_id: &str,
            action: TrackKind,
            operation: ControlOperation,
        ) -> Result<()> {
            self.controls
                .lock()
                .push((session_id.to_string(), false, action, operation));
            Ok(())
        }
    }

    #[derive(Default)]
    struct ErrorCounter {
        errors: Mutex<Vec<(String, SessionError)>>,
        calls: AtomicUsize,
    }

    impl ConferenceChannelObserver for ErrorCounter {
        fn on_stream_error(&self, stream_id: &str, error: &SessionError) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.errors.lock().push((stream_id.to_string(), error.clone()));
        }
    }

    struct Fixture {
        loopback: Arc<LoopbackFactory>,
        server: Arc<MockServer>,
        channel: Arc<ConferencePeerConnectionChannel>,
    }

    fn fixture(config: ChannelConfig) -> Fixture {
        let loopback = Arc::new(LoopbackFactory::new());
        let factory = Arc::new(MediaFactory::new(loopback.clone()));
        factory.init().unwrap();
        let server = Arc::new(MockServer::default());
        let channel =
            ConferencePeerConnectionChannel::new(config, factory, server.clone(), EventQueue::new());
        Fixture {
            loopback,
            server,
            channel,
        }
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    /// Answer `offer` the way the conference server would, optionally
    /// sending `media` back
    async fn server_answer(offer: &str, media: Option<MediaStream>) -> String {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let server_pc = LoopbackFactory::new()
            .create_peer_connection(&ChannelConfig::default(), EngineEventSink::from_sender(tx))
            .await
            .unwrap();
        if let Some(media) = media {
            server_pc.add_stream(&media).await.unwrap();
        }
        server_pc
            .set_remote_description(SessionDescription::offer(offer))
            .await
            .unwrap();
        let answer = server_pc.create_answer().await.unwrap();
        server_pc.set_local_description(answer.clone()).await.unwrap();
        answer.sdp
    }

    fn camera(id: &str) -> LocalStream {
        LocalStream::new(MediaStream::audio_video(id), StreamSource::Camera)
    }

    /// Drive a publication until the server confirmed it
    async fn published(fx: &Fixture) -> String {
        let pending = fx.channel.publish(camera("cam"));
        let server = fx.server.clone();
        wait_for(|| !server.offers().is_empty()).await;
        let answer = server_answer(&fx.server.offers()[0], None).await;
        fx.channel
            .on_signaling_message(&json!({"type": "answer", "sdp": answer}));
        let channel = fx.channel.clone();
        wait_for(|| channel.is_connected()).await;
        fx.channel.on_signaling_message(&json!("success"));
        pending.await.unwrap()
    }

    #[tokio::test]
    async fn test_publish_success() {
        let fx = fixture(ChannelConfig::default());
        let session_id = published(&fx).await;
        assert_eq!(session_id, "session-1");
        assert_eq!(fx.channel.session_state(), SessionState::Connected);

        let init = fx.server.inits.lock()[0].to_value();
        assert_eq!(init["type"], "webrtc");
        assert_eq!(init["media"]["audio"]["source"], "mic");
        assert_eq!(init["media"]["video"]["source"], "camera");

        let offer = &fx.server.offers()[0];
        assert!(offer.contains("a=msid:cam cam-video video"));
        assert!(!offer.contains("a=recv:"));
    }

    #[tokio::test]
    async fn test_candidates_follow_the_offer() {
        let fx = fixture(ChannelConfig::default());
        published(&fx).await;
        let server = fx.server.clone();
        wait_for(|| server.candidates().len() == 2).await;

        let candidates = fx.server.candidates();
        assert!(candidates.iter().all(|c| c.starts_with("a=candidate:")));
        assert!(candidates[0].starts_with("a=candidate:1 "));
        assert!(candidates[1].starts_with("a=candidate:2 "));
        // Gathered while the offer was outstanding, so sent after it
        assert!(matches!(
            fx.server.sdps.lock()[0].signaling,
            crate::signaling::SignalingPayload::Offer { .. }
        ));
    }

    #[tokio::test]
    async fn test_bitrate_cap_applied() {
        let config = ChannelConfig {
            video: vec![VideoEncodingParameters {
                codec: VideoCodec::Vp8,
                max_bitrate_kbps: Some(500),
            }],
            ..Default::default()
        };
        let fx = fixture(config);
        published(&fx).await;
        let pc = fx.loopback.last_connection().unwrap();
        assert_eq!(pc.max_bitrate(MediaKind::Video), Some(500 * 1024));
        assert_eq!(pc.max_bitrate(MediaKind::Audio), None);
    }

    #[tokio::test]
    async fn test_second_publish_is_busy() {
        let fx = fixture(ChannelConfig::default());
        let first = fx.channel.publish(camera("cam"));
        let second = fx.channel.publish(camera("other"));
        assert!(matches!(second.await, Err(SessionError::Busy(_))));

        fx.channel.stop();
        assert!(matches!(first.await, Err(SessionError::Aborted(_))));
    }

    #[tokio::test]
    async fn test_publish_released_stream() {
        let fx = fixture(ChannelConfig::default());
        let stream = camera("cam");
        stream.release();
        let result = fx.channel.publish(stream).await;
        assert!(matches!(result, Err(SessionError::InvalidArgument(_))));
        assert!(fx.server.inits.lock().is_empty());
    }

    #[tokio::test]
    async fn test_initialization_transport_failure() {
        let fx = fixture(ChannelConfig::default());
        fx.server.fail_init.store(true, Ordering::SeqCst);
        let result = fx.channel.publish(camera("cam")).await;
        assert!(matches!(result, Err(SessionError::Transport(_))));
        assert!(fx.channel.session_id().is_none());
    }

    #[tokio::test]
    async fn test_server_failure_before_connection() {
        let fx = fixture(ChannelConfig::default());
        let pending = fx.channel.publish(camera("cam"));
        let server = fx.server.clone();
        wait_for(|| !server.offers().is_empty()).await;

        fx.channel.on_signaling_message(&json!("failure"));
        assert_eq!(
            pending.await,
            Err(SessionError::Unknown(
                "MCU internal error during connection establishment.".to_string()
            ))
        );
        let events = fx.server.clone();
        wait_for(|| events.stream_events.lock().len() == 1).await;
        assert_eq!(
            fx.server.stream_events.lock()[0],
            (StreamEvent::Unpublish, "session-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_unpublish_with_wrong_id() {
        let fx = fixture(ChannelConfig::default());
        let session_id = published(&fx).await;

        let result = fx.channel.unpublish("session-9").await;
        assert!(matches!(result, Err(SessionError::InvalidArgument(_))));
        assert!(fx.channel.is_connected());
        assert!(fx.server.stream_events.lock().is_empty());

        fx.channel.unpublish(&session_id).await.unwrap();
        assert!(!fx.channel.is_connected());
        assert_eq!(
            fx.server.stream_events.lock().clone(),
            vec![(StreamEvent::Unpublish, session_id)]
        );
        let pc = fx.loopback.last_connection().unwrap();
        wait_for(|| pc.is_closed()).await;
    }

    #[tokio::test]
    async fn test_ice_closed_reports_once() {
        let fx = fixture(ChannelConfig::default());
        let observer = Arc::new(ErrorCounter::default());
        fx.channel.add_observer(observer.clone());
        let session_id = published(&fx).await;

        let pc = fx.loopback.last_connection().unwrap();
        pc.inject(PeerConnectionEvent::IceConnectionChange(IceConnectionState::Closed));
        pc.inject(PeerConnectionEvent::IceConnectionChange(IceConnectionState::Failed));

        let counter = observer.clone();
        wait_for(|| counter.calls.load(Ordering::SeqCst) > 0).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(observer.errors.lock()[0].0, "cam");
        assert!(matches!(observer.errors.lock()[0].1, SessionError::MediaEngine(_)));
        assert_eq!(
            fx.server.stream_events.lock().clone(),
            vec![(StreamEvent::Unpublish, session_id)]
        );
        assert_eq!(fx.channel.session_state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_controls_route_by_direction() {
        let fx = fixture(ChannelConfig::default());
        let early = fx.channel.play_audio().await;
        assert!(matches!(early, Err(SessionError::InvalidState(_))));

        let session_id = published(&fx).await;
        fx.channel.pause_video().await.unwrap();
        fx.channel.play_audio_video().await.unwrap();
        assert_eq!(
            fx.server.controls.lock().clone(),
            vec![
                (session_id.clone(), true, TrackKind::Video, ControlOperation::Pause),
                (session_id, true, TrackKind::AudioAndVideo, ControlOperation::Play),
            ]
        );
    }

    #[tokio::test]
    async fn test_stats_require_a_stream() {
        let fx = fixture(ChannelConfig::default());
        let early = fx.channel.get_connection_stats().await;
        assert!(matches!(early, Err(SessionError::InvalidState(_))));

        published(&fx).await;
        let stats = fx.channel.get_connection_stats().await.unwrap();
        assert!(stats.reports.iter().any(|r| r.kind == "peer-connection"));
        assert!(stats.reports.iter().any(|r| r.id == "cam-audio"));
    }

    fn remote_camera() -> RemoteStream {
        RemoteStream::builder("forward-1", "alice", RemoteStreamKind::Camera)
            .resolutions(vec![Resolution::new(640, 480), Resolution::new(1280, 720)])
            .build()
    }

    #[tokio::test]
    async fn test_subscribe_rejects_unknown_resolution() {
        let fx = fixture(ChannelConfig::default());
        let options = SubscribeOptions {
            resolution: Some(Resolution::new(1920, 1080)),
            ..Default::default()
        };
        let result = fx.channel.subscribe(remote_camera(), options).await;
        assert_eq!(
            result.unwrap_err(),
            SessionError::InvalidArgument("Unsupported resolution.".to_string())
        );
        assert!(fx.server.inits.lock().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_attaches_media() {
        let fx = fixture(ChannelConfig::default());
        let options = SubscribeOptions {
            resolution: Some(Resolution::new(640, 480)),
            quality: VideoQualityLevel::BestQuality,
        };
        let pending = fx.channel.subscribe(remote_camera(), options);
        let server = fx.server.clone();
        wait_for(|| !server.offers().is_empty()).await;

        let init = fx.server.inits.lock()[0].to_value();
        assert_eq!(
            init["media"],
            json!({
                "audio": {"from": "forward-1"},
                "video": {
                    "from": "forward-1",
                    "parameters": {
                        "resolution": {"width": 640, "height": 480},
                        "bitrate": "x1.4"
                    }
                }
            })
        );
        let offer = fx.server.offers()[0].clone();
        assert!(offer.contains("a=recv:audio") && offer.contains("a=recv:video"));

        // Still subscribing
        let early = fx.channel.unsubscribe("session-1").await;
        assert!(matches!(early, Err(SessionError::InvalidState(_))));

        let answer = server_answer(&offer, Some(MediaStream::audio_video("mixed"))).await;
        fx.channel
            .on_signaling_message(&json!({"type": "answer", "sdp": answer}));
        let channel = fx.channel.clone();
        wait_for(|| channel.is_connected()).await;
        fx.channel.on_signaling_message(&json!("success"));

        let stream = pending.await.unwrap();
        assert_eq!(stream.id(), "forward-1");
        assert_eq!(stream.media_stream().map(|m| m.id().to_string()), Some("mixed".to_string()));

        fx.channel.unsubscribe("session-1").await.unwrap();
        assert!(stream.media_stream().is_none());
        assert_eq!(
            fx.server.stream_events.lock().clone(),
            vec![(StreamEvent::Unsubscribe, "session-1".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_timeout() {
        let fx = fixture(ChannelConfig::default());
        let result = fx.channel.publish(camera("cam")).await;
        assert!(matches!(result, Err(SessionError::Timeout(_))));
        let events = fx.server.clone();
        wait_for(|| events.stream_events.lock().len() == 1).await;
        assert_eq!(fx.server.stream_events.lock()[0].1, "session-1");
    }

    #[tokio::test]
    async fn test_ice_restart_after_connection() {
        let fx = fixture(ChannelConfig::default());
        published(&fx).await;
        fx.channel.ice_restart();

        let server = fx.server.clone();
        wait_for(|| server.offers().len() == 2).await;
        let restart = &fx.server.offers()[1];
        assert!(restart.contains("a=ice-ufrag:lb1g1"));
    }

    #[tokio::test]
    async fn test_drop_while_initializing() {
        let fx = fixture(ChannelConfig::default());
        let pending = fx.channel.publish(camera("cam"));
        let Fixture { channel, server, .. } = fx;
        drop(channel);
        assert!(matches!(pending.await, Err(SessionError::Aborted(_))));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(server.sdps.lock().is_empty());
    }

    #[tokio::test]
    async fn test_server_disconnect_releases_pending_session() {
        let fx = fixture(ChannelConfig::default());
        let observer = Arc::new(ErrorCounter::default());
        fx.channel.add_observer(observer.clone());
        let pending = fx.channel.publish(camera("cam"));
        let server = fx.server.clone();
        wait_for(|| !server.offers().is_empty()).await;
        let offer = fx.server.offers()[0].clone();
        let pc = fx.loopback.last_connection().unwrap();

        fx.channel.on_server_disconnected();
        assert_eq!(
            pending.await,
            Err(SessionError::Transport("Server disconnected.".to_string()))
        );
        wait_for(|| pc.is_closed()).await;
        assert!(fx.channel.session_id().is_none());
        assert_eq!(fx.channel.session_state(), SessionState::Ready);

        // Nothing that arrives afterwards revives the session
        let answer = server_answer(&offer, None).await;
        fx.channel
            .on_signaling_message(&json!({"type": "answer", "sdp": answer}));
        pc.inject(PeerConnectionEvent::IceConnectionChange(IceConnectionState::Closed));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!fx.channel.is_connected());
        assert_eq!(observer.calls.load(Ordering::SeqCst), 0);
        assert!(fx.server.stream_events.lock().is_empty());
        let again = fx.channel.publish(camera("other")).await;
        assert!(matches!(again, Err(SessionError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_server_disconnect_without_operation() {
        let fx = fixture(ChannelConfig::default());
        let session_id = published(&fx).await;
        fx.channel.on_server_disconnected();
        assert!(fx.channel.is_connected());
        assert_eq!(fx.channel.session_id(), Some(session_id));
    }

    #[tokio::test]
    async fn test_ice_failure_after_confirmation_reports_once() {
        let fx = fixture(ChannelConfig::default());
        let observer = Arc::new(ErrorCounter::default());
        fx.channel.add_observer(observer.clone());
        let pending = fx.channel.publish(camera("cam"));
        let server = fx.server.clone();
        wait_for(|| !server.offers().is_empty()).await;

        // Confirmed while ICE is still checking
        fx.channel.on_signaling_message(&json!("success"));
        assert_eq!(pending.await, Ok("session-1".to_string()));
        assert!(!fx.channel.is_connected());

        let pc = fx.loopback.last_connection().unwrap();
        pc.inject(PeerConnectionEvent::IceConnectionChange(IceConnectionState::Failed));
        let counter = observer.clone();
        wait_for(|| counter.calls.load(Ordering::SeqCst) > 0).await;
        pc.inject(PeerConnectionEvent::IceConnectionChange(IceConnectionState::Closed));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(observer.errors.lock()[0].0, "cam");
        let events = fx.server.clone();
        wait_for(|| events.stream_events.lock().len() == 1).await;
        assert_eq!(
            fx.server.stream_events.lock().clone(),
            vec![(StreamEvent::Unpublish, "session-1".to_string())]
        );
        wait_for(|| pc.is_closed()).await;
        assert!(fx.channel.session_id().is_none());

        let again = fx.channel.publish(camera("other")).await;
        assert!(matches!(again, Err(SessionError::InvalidState(_))));
    }
}
