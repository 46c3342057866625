//! Local and remote stream handles

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::media::MediaStream;

/// Origin of a local stream's video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSource {
    Camera,
    #[serde(rename = "screen-cast")]
    ScreenCast,
    Mic,
}

struct LocalStreamInner {
    id: String,
    source: StreamSource,
    attributes: HashMap<String, String>,
    media: Mutex<Option<MediaStream>>,
}

/// Stream captured on this side
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct LocalStream {
    inner: Arc<LocalStreamInner>,
}

impl LocalStream {
    /// Wrap engine media. The stream id is the media id.
    pub fn new(media: MediaStream, source: StreamSource) -> Self {
        Self {
            inner: Arc::new(LocalStreamInner {
                id: media.id().to_string(),
                source,
                attributes: HashMap::new(),
                media: Mutex::new(Some(media)),
            }),
        }
    }

    pub fn with_attributes(media: MediaStream, source: StreamSource, attributes: HashMap<String, String>) -> Self {
        Self {
            inner: Arc::new(LocalStreamInner {
                id: media.id().to_string(),
                source,
                attributes,
                media: Mutex::new(Some(media)),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn source(&self) -> StreamSource {
        self.inner.source
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.inner.attributes
    }

    /// Engine media, `None` once released
    pub fn media_stream(&self) -> Option<MediaStream> {
        self.inner.media.lock().clone()
    }

    pub fn has_audio(&self) -> bool {
        self.media_stream().is_some_and(|m| m.has_audio())
    }

    pub fn has_video(&self) -> bool {
        self.media_stream().is_some_and(|m| m.has_video())
    }

    /// Drop the engine media. The stream can no longer be published.
    pub fn release(&self) {
        self.inner.media.lock().take();
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .finish()
    }
}

/// Kind of stream offered by a conference or a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStreamKind {
    Camera,
    Screen,
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// What a subscriber may ask for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionCapabilities {
    pub resolutions: Vec<Resolution>,
}

/// Video quality relative to the stream's default bitrate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VideoQualityLevel {
    BestQuality,
    BetterQuality,
    #[default]
    Standard,
    BetterSpeed,
    BestSpeed,
}

impl VideoQualityLevel {
    /// Bitrate multiplier understood by the conference server, `None` for
    /// the default bitrate
    pub fn bitrate_multiplier(&self) -> Option<&'static str> {
        match self {
            VideoQualityLevel::BestQuality => Some("x1.4"),
            VideoQualityLevel::BetterQuality => Some("x1.2"),
            VideoQualityLevel::Standard => None,
            VideoQualityLevel::BetterSpeed => Some("x0.8"),
            VideoQualityLevel::BestSpeed => Some("x0.6"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub resolution: Option<Resolution>,
    pub quality: VideoQualityLevel,
}

struct RemoteStreamInner {
    id: String,
    origin: String,
    kind: RemoteStreamKind,
    has_audio: bool,
    has_video: bool,
    capabilities: SubscriptionCapabilities,
    media: Mutex<Option<MediaStream>>,
}

/// Stream published by the other side
///
/// Cloning yields another handle to the same stream; engine media is
/// attached once the stream has been negotiated.
#[derive(Clone)]
pub struct RemoteStream {
    inner: Arc<RemoteStreamInner>,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>, origin: impl Into<String>, kind: RemoteStreamKind) -> Self {
        Self::builder(id, origin, kind).build()
    }

    pub fn builder(
        id: impl Into<String>,
        origin: impl Into<String>,
        kind: RemoteStreamKind,
    ) -> RemoteStreamBuilder {
        RemoteStreamBuilder {
            id: id.into(),
            origin: origin.into(),
            kind,
            has_audio: true,
            has_video: true,
            capabilities: SubscriptionCapabilities::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Participant or peer that publishes the stream
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    pub fn kind(&self) -> RemoteStreamKind {
        self.inner.kind
    }

    pub fn has_audio(&self) -> bool {
        self.inner.has_audio
    }

    pub fn has_video(&self) -> bool {
        self.inner.has_video
    }

    pub fn capabilities(&self) -> &SubscriptionCapabilities {
        &self.inner.capabilities
    }

    pub fn media_stream(&self) -> Option<MediaStream> {
        self.inner.media.lock().clone()
    }

    pub(crate) fn attach(&self, media: MediaStream) {
        *self.inner.media.lock() = Some(media);
    }

    pub(crate) fn detach(&self) {
        self.inner.media.lock().take();
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.inner.id)
            .field("origin", &self.inner.origin)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

pub struct RemoteStreamBuilder {
    id: String,
    origin: String,
    kind: RemoteStreamKind,
    has_audio: bool,
    has_video: bool,
    capabilities: SubscriptionCapabilities,
}

impl RemoteStreamBuilder {
    pub fn audio(mut self, has_audio: bool) -> Self {
        self.has_audio = has_audio;
        self
    }

    pub fn video(mut self, has_video: bool) -> Self {
        self.has_video = has_video;
        self
    }

    pub fn resolutions(mut self, resolutions: Vec<Resolution>) -> Self {
        self.capabilities.resolutions = resolutions;
        self
    }

    pub fn build(self) -> RemoteStream {
        RemoteStream {
            inner: Arc::new(RemoteStreamInner {
                id: self.id,
                origin: self.origin,
                kind: self.kind,
                has_audio: self.has_audio,
                has_video: self.has_video,
                capabilities: self.capabilities,
                media: Mutex::new(None),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_drops_media() {
        let stream = LocalStream::new(MediaStream::audio_video("cam"), StreamSource::Camera);
        let copy = stream.clone();
        assert!(copy.has_video());
        stream.release();
        assert!(copy.media_stream().is_none());
        assert_eq!(copy.id(), "cam");
    }

    #[test]
    fn test_quality_multiplier() {
        assert_eq!(VideoQualityLevel::default().bitrate_multiplier(), None);
        assert_eq!(VideoQualityLevel::BestSpeed.bitrate_multiplier(), Some("x0.6"));
    }

    #[test]
    fn test_remote_stream_builder() {
        let stream = RemoteStream::builder("mix", "server", RemoteStreamKind::Mixed)
            .audio(false)
            .resolutions(vec![Resolution::new(640, 480)])
            .build();
        assert!(!stream.has_audio());
        assert_eq!(stream.capabilities().resolutions[0].to_string(), "640x480");
        assert!(stream.media_stream().is_none());
    }
}
