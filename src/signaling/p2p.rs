//! P2P wire messages exchanged through the relay

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::media::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub continual_ice_gathering: bool,
    #[serde(default)]
    pub unified_plan: bool,
    #[serde(default)]
    pub stream_removable: bool,
}

/// Client description carried by invitations and acceptances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAgent {
    pub sdk: SdkInfo,
    pub runtime: RuntimeInfo,
    pub os: OsInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
}

impl Default for UserAgent {
    fn default() -> Self {
        Self {
            sdk: SdkInfo {
                kind: "Rust".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            runtime: RuntimeInfo {
                name: "rtc-session".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            os: OsInfo {
                name: std::env::consts::OS.to_string(),
                version: String::new(),
            },
            capabilities: Some(Capabilities {
                continual_ice_gathering: true,
                unified_plan: true,
                stream_removable: true,
            }),
        }
    }
}

/// What the remote peer can handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCapabilities {
    /// Published streams can be removed again
    pub stream_removable: bool,
    /// More than one stream can be published on the connection
    pub multiple_streams: bool,
}

impl Default for RemoteCapabilities {
    fn default() -> Self {
        Self {
            stream_removable: true,
            multiple_streams: true,
        }
    }
}

impl RemoteCapabilities {
    pub fn from_user_agent(ua: &UserAgent) -> Self {
        let firefox = ua.runtime.name.eq_ignore_ascii_case("firefox");
        match ua.capabilities {
            Some(caps) => Self {
                stream_removable: caps.stream_removable,
                multiple_streams: caps.unified_plan || !firefox,
            },
            None if firefox => Self {
                stream_removable: false,
                multiple_streams: false,
            },
            None => Self::default(),
        }
    }
}

/// Payload of a `chat-signal` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalData {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidates {
        candidate: String,
        #[serde(rename = "sdpMid")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
    },
}

impl SignalData {
    pub fn from_description(description: &SessionDescription) -> Self {
        match description.sdp_type {
            crate::media::SdpType::Answer => SignalData::Answer {
                sdp: description.sdp.clone(),
            },
            _ => SignalData::Offer {
                sdp: description.sdp.clone(),
            },
        }
    }

    pub fn from_candidate(candidate: &IceCandidate) -> Self {
        SignalData::Candidates {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
        }
    }
}

/// Announces the source of a stream before it is added
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTypeInfo {
    #[serde(rename = "streamId")]
    pub stream_id: String,
    /// "screen" or "video"
    #[serde(rename = "type")]
    pub source: String,
}

/// Message between two peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum P2PMessage {
    #[serde(rename = "chat-invitation")]
    Invitation {
        #[serde(default)]
        ua: Option<UserAgent>,
    },
    #[serde(rename = "chat-accepted")]
    Accepted {
        #[serde(default)]
        ua: Option<UserAgent>,
    },
    #[serde(rename = "chat-denied")]
    Denied,
    #[serde(rename = "chat-closed")]
    Closed,
    #[serde(rename = "chat-signal")]
    Signal { data: SignalData },
    #[serde(rename = "chat-negotiation-needed")]
    NegotiationNeeded,
    #[serde(rename = "chat-negotiation-accepted")]
    NegotiationAccepted,
    #[serde(rename = "stream-type")]
    StreamType { data: StreamTypeInfo },
}

impl P2PMessage {
    pub fn parse(message: &str) -> Result<Self> {
        Ok(serde_json::from_str(message)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            P2PMessage::Invitation { .. } => "chat-invitation",
            P2PMessage::Accepted { .. } => "chat-accepted",
            P2PMessage::Denied => "chat-denied",
            P2PMessage::Closed => "chat-closed",
            P2PMessage::Signal { .. } => "chat-signal",
            P2PMessage::NegotiationNeeded => "chat-negotiation-needed",
            P2PMessage::NegotiationAccepted => "chat-negotiation-accepted",
            P2PMessage::StreamType { .. } => "stream-type",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_names() {
        assert_eq!(
            P2PMessage::Denied.to_json().unwrap(),
            r#"{"type":"chat-denied"}"#
        );
        let msg = P2PMessage::Signal {
            data: SignalData::Candidates {
                candidate: "candidate:1".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "chat-signal",
                "data": {"type": "candidates", "candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0}
            })
        );
    }

    #[test]
    fn test_parse_invitation_without_ua() {
        let msg = P2PMessage::parse(r#"{"type":"chat-invitation"}"#).unwrap();
        assert_eq!(msg, P2PMessage::Invitation { ua: None });
        assert!(P2PMessage::parse(r#"{"type":"chat-unknown"}"#).is_err());
    }

    #[test]
    fn test_remote_capabilities() {
        let mut ua = UserAgent::default();
        ua.runtime.name = "FireFox".to_string();
        ua.capabilities = None;
        let caps = RemoteCapabilities::from_user_agent(&ua);
        assert!(!caps.stream_removable);
        assert!(!caps.multiple_streams);

        let caps = RemoteCapabilities::from_user_agent(&UserAgent::default());
        assert_eq!(caps, RemoteCapabilities::default());
    }
}
