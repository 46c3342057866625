use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SessionError};

/// Channel configuration
///
/// Immutable once handed to a channel constructor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelConfig {
    /// STUN/TURN servers handed to the media engine
    pub ice_servers: Vec<IceServer>,
    /// Audio encodings in preference order
    pub audio: Vec<AudioEncodingParameters>,
    /// Video encodings in preference order
    pub video: Vec<VideoEncodingParameters>,
    /// Upper bound for a pending publish/subscribe, `None` waits forever
    pub negotiation_timeout_ms: Option<u64>,
    /// How long a P2P session may stay ICE-disconnected before it is stopped
    pub reconnect_timeout_ms: u64,
    /// Hold local candidates until the signaling state is stable
    pub candidate_buffering: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![],
            audio: vec![],
            video: vec![],
            negotiation_timeout_ms: Some(30_000),
            reconnect_timeout_ms: 10_000,
            candidate_buffering: true,
        }
    }
}

impl ChannelConfig {
    /// Check the configuration for values the engine cannot use
    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            server.validate()?;
        }
        if self.negotiation_timeout_ms == Some(0) {
            return Err(SessionError::Config(
                "negotiationTimeoutMs must be positive, use null to disable".to_string(),
            ));
        }
        if self.reconnect_timeout_ms == 0 {
            return Err(SessionError::Config(
                "reconnectTimeoutMs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        self.negotiation_timeout_ms.map(Duration::from_millis)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    /// Max audio bitrate in bps, taken from the first encoding that sets one
    pub fn max_audio_bitrate_bps(&self) -> Option<u64> {
        self.audio
            .iter()
            .find_map(|e| e.max_bitrate_kbps)
            .map(kbps_to_bps)
    }

    /// Max video bitrate in bps, taken from the first encoding that sets one
    pub fn max_video_bitrate_bps(&self) -> Option<u64> {
        self.video
            .iter()
            .find_map(|e| e.max_bitrate_kbps)
            .map(kbps_to_bps)
    }
}

fn kbps_to_bps(kbps: u32) -> u64 {
    u64::from(kbps) * 1024
}

/// ICE server entry (STUN or TURN)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    /// Server URLs (stun:, turn: or turns:)
    pub urls: Vec<String>,
    /// Username for TURN authentication
    #[serde(default)]
    pub username: String,
    /// Credential for TURN authentication
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.urls.is_empty() {
            return Err(SessionError::Config("ICE server without urls".to_string()));
        }
        for url in &self.urls {
            let scheme = url.split(':').next().unwrap_or_default();
            match scheme {
                "stun" | "stuns" => {}
                "turn" | "turns" => {
                    if self.username.is_empty() || self.credential.is_empty() {
                        return Err(SessionError::Config(format!(
                            "TURN server {} requires username and credential",
                            url
                        )));
                    }
                }
                _ => {
                    return Err(SessionError::Config(format!(
                        "Unsupported ICE server url: {}",
                        url
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Audio codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Opus,
    Isac,
    G722,
    Pcmu,
    Pcma,
    Ilbc,
}

/// Video codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Vp8,
    Vp9,
    H264,
    H265,
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoCodec::Vp8 => write!(f, "VP8"),
            VideoCodec::Vp9 => write!(f, "VP9"),
            VideoCodec::H264 => write!(f, "H264"),
            VideoCodec::H265 => write!(f, "H265"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioEncodingParameters {
    pub codec: AudioCodec,
    /// Max bitrate in kbps
    #[serde(default)]
    pub max_bitrate_kbps: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoEncodingParameters {
    pub codec: VideoCodec,
    /// Max bitrate in kbps
    #[serde(default)]
    pub max_bitrate_kbps: Option<u32>,
}
