//! State and engine plumbing shared by both channel kinds

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::pending::Responder;
use super::MediaHandler;
use crate::config::ChannelConfig;
use crate::error::{Result, SessionError};
use crate::events::{EventQueue, TaskQueue};
use crate::media::{
    ConnectionStats, EngineEventSink, IceCandidate, MediaFactory, MediaKind, MediaStream,
    OfferOptions, PeerConnection, SdpType, SessionDescription, SignalingState,
};
use crate::session::IceCandidateBuffer;

struct IceState {
    signaling_state: SignalingState,
    buffer: IceCandidateBuffer,
}

/// Engine connection plus the three execution contexts of a channel
///
/// Engine calls run on `media`, outbound signaling on `outbox`, application
/// callbacks on `events`. The connection slot is replaced, never mutated in
/// place; every replacement bumps the generation so callbacks of the old
/// connection are recognized as stale.
pub(crate) struct PeerConnectionChannel {
    label: String,
    config: ChannelConfig,
    factory: Arc<MediaFactory>,
    media: TaskQueue,
    outbox: TaskQueue,
    events: EventQueue,
    pc: Mutex<Option<Arc<dyn PeerConnection>>>,
    generation: AtomicU64,
    initializing: AtomicBool,
    ice: Mutex<IceState>,
}

impl PeerConnectionChannel {
    pub fn new(
        label: impl Into<String>,
        config: ChannelConfig,
        factory: Arc<MediaFactory>,
        events: EventQueue,
    ) -> Self {
        let label = label.into();
        Self {
            media: TaskQueue::new(format!("{}-media", label)),
            outbox: TaskQueue::new(format!("{}-signaling", label)),
            label,
            config,
            factory,
            events,
            pc: Mutex::new(None),
            generation: AtomicU64::new(0),
            initializing: AtomicBool::new(false),
            ice: Mutex::new(IceState {
                signaling_state: SignalingState::Stable,
                buffer: IceCandidateBuffer::new(),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    pub fn peer_connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.pc.lock().clone()
    }

    /// Whether a connection exists or is being created
    pub fn has_peer_connection(&self) -> bool {
        self.initializing.load(Ordering::Acquire) || self.pc.lock().is_some()
    }

    /// Queue a send on the signaling outbox
    pub fn post_signaling<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.outbox.post(task);
    }

    /// Last signaling state reported by the engine
    pub fn signaling_state(&self) -> SignalingState {
        self.ice.lock().signaling_state
    }

    pub fn update_signaling_state(&self, state: SignalingState) {
        self.ice.lock().signaling_state = state;
    }

    /// Returns the candidate if it may go out now, otherwise buffers it
    pub fn admit_candidate(&self, candidate: IceCandidate) -> Option<IceCandidate> {
        if !self.config.candidate_buffering {
            return Some(candidate);
        }
        let mut ice = self.ice.lock();
        let state = ice.signaling_state;
        ice.buffer.admit(candidate, state)
    }

    /// Take every buffered candidate, oldest first
    pub fn drain_candidates(&self) -> Vec<IceCandidate> {
        let mut drained = Vec::new();
        let count = self.ice.lock().buffer.drain_to(|c| drained.push(c));
        if count > 0 {
            debug!("{}: draining {} buffered candidates", self.label, count);
        }
        drained
    }

    pub fn clear_candidates(&self) {
        self.ice.lock().buffer.clear();
    }

    /// Drop the current connection and close it on the media context
    ///
    /// Tasks already queued for the old connection find the slot empty and
    /// skip themselves.
    pub fn close_peer_connection(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.initializing.store(false, Ordering::Release);
        {
            let mut ice = self.ice.lock();
            ice.signaling_state = SignalingState::Stable;
            ice.buffer.clear();
        }
        if let Some(pc) = self.pc.lock().take() {
            let label = self.label.clone();
            self.media.post(async move {
                if let Err(e) = pc.close().await {
                    warn!("{}: failed to close peer connection: {}", label, e);
                }
            });
        }
    }
}

impl Drop for PeerConnectionChannel {
    fn drop(&mut self) {
        if let Some(pc) = self.pc.get_mut().take() {
            trace!("{}: closing peer connection on drop", self.label);
            self.media.post(async move {
                let _ = pc.close().await;
            });
        }
    }
}

/// Create the engine connection on the media context
pub(crate) fn initialize_peer_connection<H: MediaHandler>(handler: &Arc<H>) {
    let core = handler.core();
    core.initializing.store(true, Ordering::Release);
    let generation = core.generation.fetch_add(1, Ordering::AcqRel) + 1;

    let target: Weak<dyn MediaHandler> = Arc::downgrade(handler) as Weak<dyn MediaHandler>;
    let sink = EngineEventSink::for_channel(core.media.clone(), target, generation);
    let weak = Arc::downgrade(handler);

    core.media.post(async move {
        let Some(handler) = weak.upgrade() else {
            return;
        };
        let core = handler.core();
        let result = core
            .factory
            .create_peer_connection(&core.config, sink)
            .await;

        match result {
            Ok(pc) if core.is_current(generation) => {
                debug!("{}: peer connection created", core.label);
                *core.pc.lock() = Some(pc);
                core.initializing.store(false, Ordering::Release);
            }
            Ok(pc) => {
                // Closed while it was being created
                let _ = pc.close().await;
            }
            Err(e) => {
                if core.is_current(generation) {
                    core.initializing.store(false, Ordering::Release);
                    warn!("{}: failed to create peer connection: {}", core.label, e);
                    handler.on_peer_connection_failed(e);
                }
            }
        }
    });
}

/// Create the engine connection unless one exists or is being created
pub(crate) fn ensure_peer_connection<H: MediaHandler>(handler: &Arc<H>) {
    if !handler.core().has_peer_connection() {
        initialize_peer_connection(handler);
    }
}

/// Run `f` on the media context against the current connection
///
/// Skipped when the handler is gone or the connection was closed.
pub(crate) fn post_media<H, F, Fut>(handler: &Arc<H>, op: &'static str, f: F)
where
    H: MediaHandler,
    F: FnOnce(Arc<H>, Arc<dyn PeerConnection>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let weak = Arc::downgrade(handler);
    handler.core().media.post(async move {
        let Some(handler) = weak.upgrade() else {
            return;
        };
        let Some(pc) = handler.core().peer_connection() else {
            debug!("{}: no peer connection, skipping {}", handler.core().label, op);
            return;
        };
        f(handler, pc).await;
    });
}

/// Like [`post_media`], but hands a missing connection to `f` as an error
/// so an attached responder can be resolved
pub(crate) fn post_media_or<H, F, Fut>(handler: &Arc<H>, f: F)
where
    H: MediaHandler,
    F: FnOnce(Option<Arc<H>>, Result<Arc<dyn PeerConnection>>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let weak = Arc::downgrade(handler);
    handler.core().media.post(async move {
        let handler = weak.upgrade();
        let pc = handler
            .as_ref()
            .and_then(|h| h.core().peer_connection())
            .ok_or_else(|| SessionError::MediaEngine("Peer connection is closed.".to_string()));
        f(handler, pc).await;
    });
}

pub(crate) fn create_offer<H: MediaHandler>(handler: &Arc<H>, options: OfferOptions) {
    post_media(handler, "create offer", move |handler, pc| async move {
        match pc.create_offer(options).await {
            Ok(offer) => set_local_description(&handler, offer),
            Err(e) => {
                warn!("{}: create offer failed: {}", handler.core().label, e);
                handler.on_negotiation_failed(e);
            }
        }
    });
}

pub(crate) fn create_answer<H: MediaHandler>(handler: &Arc<H>) {
    post_media(handler, "create answer", |handler, pc| async move {
        match pc.create_answer().await {
            Ok(answer) => set_local_description(&handler, answer),
            Err(e) => {
                warn!("{}: create answer failed: {}", handler.core().label, e);
                handler.on_negotiation_failed(e);
            }
        }
    });
}

/// Apply a local description, cap bitrates, then hand it to the handler
/// for sending
pub(crate) fn set_local_description<H: MediaHandler>(
    handler: &Arc<H>,
    description: SessionDescription,
) {
    post_media(handler, "set local description", |handler, pc| async move {
        if let Err(e) = pc.set_local_description(description.clone()).await {
            warn!("{}: set local description failed: {}", handler.core().label, e);
            handler.on_negotiation_failed(e);
            return;
        }
        apply_bitrate_settings(handler.core(), pc.as_ref()).await;
        handler.send_local_description(description);
    });
}

/// Apply a remote description; a remote offer is answered automatically
pub(crate) fn set_remote_description<H: MediaHandler>(
    handler: &Arc<H>,
    description: SessionDescription,
) {
    post_media(handler, "set remote description", |handler, pc| {
        apply_remote_description(handler, pc, description)
    });
}

/// Body of [`set_remote_description`] for callers already on the media
/// context
pub(crate) async fn apply_remote_description<H: MediaHandler>(
    handler: Arc<H>,
    pc: Arc<dyn PeerConnection>,
    description: SessionDescription,
) {
    let sdp_type = description.sdp_type;
    if let Err(e) = pc.set_remote_description(description).await {
        warn!("{}: set remote description failed: {}", handler.core().label, e);
        handler.on_negotiation_failed(e);
        return;
    }
    handler.clone().on_remote_description_set(sdp_type);
    if sdp_type == SdpType::Offer {
        create_answer(&handler);
    }
}

pub(crate) fn add_ice_candidate<H: MediaHandler>(handler: &Arc<H>, candidate: IceCandidate) {
    post_media(handler, "add ICE candidate", |handler, pc| async move {
        if let Err(e) = pc.add_ice_candidate(candidate).await {
            warn!("{}: failed to add remote candidate: {}", handler.core().label, e);
        }
    });
}

pub(crate) fn get_connection_stats<H: MediaHandler>(
    handler: &Arc<H>,
    stream: Option<MediaStream>,
    responder: Responder<ConnectionStats>,
) {
    post_media_or(handler, |_, pc| async move {
        let result = match pc {
            Ok(pc) => pc.get_stats(stream.as_ref()).await,
            Err(e) => Err(e),
        };
        responder.resolve(result);
    });
}

/// Call `f` after `delay` if the handler is still alive
pub(crate) fn schedule<H, F>(handler: &Arc<H>, delay: Duration, f: F)
where
    H: MediaHandler,
    F: FnOnce(Arc<H>) + Send + 'static,
{
    let weak = Arc::downgrade(handler);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(handler) = weak.upgrade() {
            f(handler);
        }
    });
}

async fn apply_bitrate_settings(core: &PeerConnectionChannel, pc: &dyn PeerConnection) {
    let limits = [
        (MediaKind::Audio, core.config.max_audio_bitrate_bps()),
        (MediaKind::Video, core.config.max_video_bitrate_bps()),
    ];
    for (kind, limit) in limits {
        let Some(bps) = limit else {
            continue;
        };
        match pc.set_max_bitrate(kind, bps).await {
            Ok(0) => {}
            Ok(senders) => info!(
                "{}: capped {:?} bitrate at {} bps on {} senders",
                core.label, kind, bps, senders
            ),
            Err(e) => warn!("{}: failed to set {:?} bitrate: {}", core.label, kind, e),
        }
    }
}
