//! P2P client owning one channel per remote peer

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channel::{P2PChannelObserver, P2PPeerConnectionChannel, Pending};
use crate::config::ChannelConfig;
use crate::error::SessionError;
use crate::events::{EventQueue, ObserverList};
use crate::media::{ConnectionStats, MediaFactory};
use crate::session::SessionState;
use crate::signaling::{P2PMessage, P2PSignalingSender, SignalingReceiver};
use crate::stream::LocalStream;

/// Entry point for P2P sessions of one local identity
///
/// Channels are created on demand, either by a local `invite` or by a
/// remote invitation, and are kept for later sessions with the same peer.
/// Observers added here are attached to every channel.
pub struct PeerClient {
    local_id: String,
    config: ChannelConfig,
    factory: Arc<MediaFactory>,
    sender: Arc<dyn P2PSignalingSender>,
    events: EventQueue,
    channels: Mutex<HashMap<String, Arc<P2PPeerConnectionChannel>>>,
    observers: ObserverList<dyn P2PChannelObserver>,
}

impl PeerClient {
    pub fn new(
        local_id: impl Into<String>,
        config: ChannelConfig,
        factory: Arc<MediaFactory>,
        sender: Arc<dyn P2PSignalingSender>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id: local_id.into(),
            config,
            factory,
            sender,
            events: EventQueue::new(),
            channels: Mutex::new(HashMap::new()),
            observers: ObserverList::new(),
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn add_observer(&self, observer: Arc<dyn P2PChannelObserver>) {
        self.observers.add(observer.clone());
        for channel in self.channels.lock().values() {
            channel.add_observer(observer.clone());
        }
    }

    pub fn remove_observer(&self, observer: &Arc<dyn P2PChannelObserver>) {
        self.observers.remove(observer);
        for channel in self.channels.lock().values() {
            channel.remove_observer(observer);
        }
    }

    /// Channel to `remote_id`, if one was ever created
    pub fn channel(&self, remote_id: &str) -> Option<Arc<P2PPeerConnectionChannel>> {
        self.channels.lock().get(remote_id).cloned()
    }

    pub fn remote_ids(&self) -> Vec<String> {
        self.channels.lock().keys().cloned().collect()
    }

    pub fn invite(&self, remote_id: &str) -> Pending<()> {
        if remote_id == self.local_id {
            return Pending::failed(
                &self.events,
                SessionError::InvalidArgument("Cannot invite yourself.".to_string()),
            );
        }
        self.get_or_create_channel(remote_id).invite()
    }

    pub fn accept(&self, remote_id: &str) -> Pending<()> {
        match self.channel(remote_id) {
            Some(channel) => channel.accept(),
            None => self.unknown_peer(remote_id),
        }
    }

    pub fn deny(&self, remote_id: &str) -> Pending<()> {
        match self.channel(remote_id) {
            Some(channel) => channel.deny(),
            None => self.unknown_peer(remote_id),
        }
    }

    pub fn stop(&self, remote_id: &str) -> Pending<()> {
        match self.channel(remote_id) {
            Some(channel) => channel.stop(),
            None => self.unknown_peer(remote_id),
        }
    }

    pub fn publish(&self, remote_id: &str, stream: LocalStream) -> Pending<()> {
        match self.channel(remote_id) {
            Some(channel) => channel.publish(stream),
            None => self.unknown_peer(remote_id),
        }
    }

    pub fn unpublish(&self, remote_id: &str, stream: &LocalStream) -> Pending<()> {
        match self.channel(remote_id) {
            Some(channel) => channel.unpublish(stream),
            None => self.unknown_peer(remote_id),
        }
    }

    pub fn send(&self, remote_id: &str, message: impl Into<String>) -> Pending<()> {
        match self.channel(remote_id) {
            Some(channel) => channel.send(message),
            None => self.unknown_peer(remote_id),
        }
    }

    pub fn get_connection_stats(&self, remote_id: &str) -> Pending<ConnectionStats> {
        match self.channel(remote_id) {
            Some(channel) => channel.get_connection_stats(),
            None => Pending::failed(&self.events, unknown_peer_error(remote_id)),
        }
    }

    /// Stop every active session
    pub fn stop_all(&self) {
        let channels: Vec<_> = self.channels.lock().values().cloned().collect();
        for channel in channels {
            if matches!(
                channel.session_state(),
                SessionState::Ready | SessionState::Pending
            ) {
                continue;
            }
            drop(channel.stop());
        }
    }

    fn get_or_create_channel(&self, remote_id: &str) -> Arc<P2PPeerConnectionChannel> {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get(remote_id) {
            return channel.clone();
        }
        debug!("Creating channel {} -> {}", self.local_id, remote_id);
        let channel = P2PPeerConnectionChannel::new(
            self.local_id.clone(),
            remote_id,
            self.config.clone(),
            self.factory.clone(),
            self.sender.clone(),
            self.events.clone(),
        );
        for observer in self.observers.snapshot() {
            channel.add_observer(observer);
        }
        channels.insert(remote_id.to_string(), channel.clone());
        channel
    }

    fn unknown_peer(&self, remote_id: &str) -> Pending<()> {
        Pending::failed(&self.events, unknown_peer_error(remote_id))
    }
}

fn unknown_peer_error(remote_id: &str) -> SessionError {
    SessionError::InvalidArgument(format!("No session with {}.", remote_id))
}

impl SignalingReceiver for PeerClient {
    fn on_signaling_message(&self, from: &str, message: &str) {
        let channel = match self.channel(from) {
            Some(channel) => channel,
            None => match P2PMessage::parse(message) {
                Ok(P2PMessage::Invitation { .. }) => {
                    info!("Invitation from new peer {}", from);
                    self.get_or_create_channel(from)
                }
                Ok(other) => {
                    warn!("Dropping {} from unknown peer {}", other.type_name(), from);
                    return;
                }
                Err(e) => {
                    warn!("Dropping malformed message from {}: {}", from, e);
                    return;
                }
            },
        };
        channel.on_incoming_signaling_message(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::loopback::LoopbackFactory;
    use crate::media::MediaStream;
    use crate::signaling::MemoryHub;
    use crate::stream::{RemoteStream, StreamSource};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    impl Log {
        fn has(&self, entry: &str) -> bool {
            self.0.lock().iter().any(|e| e == entry)
        }
    }

    impl P2PChannelObserver for Log {
        fn on_invited(&self, remote_id: &str) {
            self.0.lock().push(format!("invited:{}", remote_id));
        }
        fn on_started(&self, remote_id: &str) {
            self.0.lock().push(format!("started:{}", remote_id));
        }
        fn on_stopped(&self, remote_id: &str) {
            self.0.lock().push(format!("stopped:{}", remote_id));
        }
        fn on_stream_added(&self, stream: &RemoteStream) {
            self.0.lock().push(format!("added:{}", stream.id()));
        }
        fn on_data(&self, remote_id: &str, message: &str) {
            self.0.lock().push(format!("data:{}:{}", remote_id, message));
        }
    }

    fn client(hub: &Arc<MemoryHub>, id: &str) -> (Arc<PeerClient>, Arc<Log>) {
        let factory = Arc::new(MediaFactory::new(Arc::new(LoopbackFactory::new())));
        factory.init().unwrap();
        let client = PeerClient::new(id, ChannelConfig::default(), factory, hub.sender(id));
        let receiver: Arc<dyn SignalingReceiver> = client.clone();
        hub.register(id, Arc::downgrade(&receiver));
        let log = Arc::new(Log::default());
        client.add_observer(log.clone());
        (client, log)
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

    #[tokio::test]
    async fn test_end_to_end_session() {
        let hub = MemoryHub::new();
        let (alice, alice_log) = client(&hub, "alice");
        let (bob, bob_log) = client(&hub, "bob");

        assert_ok!(alice.invite("bob").await);
        let log = bob_log.clone();
        wait_for(|| log.has("invited:alice")).await;
        assert_eq!(bob.remote_ids(), vec!["alice".to_string()]);
        assert_ok!(bob.accept("alice").await);

        let (a, b) = (alice_log.clone(), bob_log.clone());
        wait_for(|| a.has("started:bob") && b.has("started:alice")).await;

        let cam = LocalStream::new(MediaStream::audio_video("alice-cam"), StreamSource::Camera);
        assert_ok!(alice.publish("bob", cam).await);
        wait_for(|| b.has("added:alice-cam")).await;

        assert_ok!(alice.send("bob", "ping").await);
        let stats = assert_ok!(bob.get_connection_stats("alice").await);
        assert!(!stats.reports.is_empty());

        assert_ok!(bob.stop("alice").await);
        wait_for(|| a.has("stopped:bob") && b.has("stopped:alice")).await;
        let channel = alice.channel("bob").unwrap();
        assert_eq!(channel.session_state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let hub = MemoryHub::new();
        let (alice, _) = client(&hub, "alice");

        let err = assert_err!(alice.accept("carol").await);
        assert!(matches!(err, SessionError::InvalidArgument(_)));
        assert_err!(alice.send("carol", "hi").await);
        assert_err!(alice.get_connection_stats("carol").await);
        assert_err!(alice.invite("alice").await);
    }

    #[tokio::test]
    async fn test_only_invitations_open_channels() {
        let hub = MemoryHub::new();
        let (alice, log) = client(&hub, "alice");

        alice.on_signaling_message("mallory", r#"{"type":"chat-closed"}"#);
        alice.on_signaling_message("mallory", "not json");
        assert!(alice.remote_ids().is_empty());

        alice.on_signaling_message("carol", r#"{"type":"chat-invitation"}"#);
        wait_for(|| log.has("invited:carol")).await;
        assert_eq!(
            alice.channel("carol").unwrap().session_state(),
            SessionState::Pending
        );
        assert_ok!(alice.deny("carol").await.or_else(|e| match e {
            // carol has no receiver on the hub
            SessionError::Transport(_) => Ok(()),
            e => Err(e),
        }));
        assert_eq!(
            alice.channel("carol").unwrap().session_state(),
            SessionState::Ready
        );
    }

    #[tokio::test]
    async fn test_observer_added_late_reaches_existing_channels() {
        let hub = MemoryHub::new();
        let (alice, _) = client(&hub, "alice");
        let (_bob, bob_log) = client(&hub, "bob");
        assert_ok!(alice.invite("bob").await);
        wait_for(|| bob_log.has("invited:alice")).await;

        let late = Arc::new(Log::default());
        alice.add_observer(late.clone());
        alice.stop_all();
        wait_for(|| late.has("stopped:bob")).await;
    }
}
