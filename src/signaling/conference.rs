//! Conference wire messages

use std::collections::HashMap;

use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::media::{IceCandidate, SdpType, SessionDescription};
use crate::stream::{Resolution, StreamSource};

/// Serialize `None` as `false`, the server's "not wanted" marker
fn false_or<T, S>(value: &Option<T>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    T: Serialize,
    S: Serializer,
{
    match value {
        Some(v) => v.serialize(serializer),
        None => serializer.serialize_bool(false),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaSource {
    pub source: StreamSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishMedia {
    #[serde(serialize_with = "false_or")]
    pub audio: Option<MediaSource>,
    #[serde(serialize_with = "false_or")]
    pub video: Option<MediaSource>,
}

/// Body of a publish initialization
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishOptions {
    #[serde(rename = "type")]
    pub transport: &'static str,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
    pub media: PublishMedia,
}

impl PublishOptions {
    pub fn webrtc(media: PublishMedia, attributes: HashMap<String, String>) -> Self {
        Self {
            transport: "webrtc",
            attributes,
            media,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioFrom {
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct VideoParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoFrom {
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<VideoParameters>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscribeMedia {
    #[serde(serialize_with = "false_or")]
    pub audio: Option<AudioFrom>,
    #[serde(serialize_with = "false_or")]
    pub video: Option<VideoFrom>,
}

/// Body of a subscribe initialization
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscribeRequest {
    #[serde(rename = "type")]
    pub transport: &'static str,
    pub media: SubscribeMedia,
}

impl SubscribeRequest {
    pub fn webrtc(media: SubscribeMedia) -> Self {
        Self {
            transport: "webrtc",
            media,
        }
    }
}

/// First message of a publication or subscription
#[derive(Debug, Clone, PartialEq)]
pub enum InitializationRequest {
    Publish {
        options: PublishOptions,
        stream_label: String,
    },
    Subscribe {
        options: SubscribeRequest,
        stream_id: String,
    },
}

impl InitializationRequest {
    /// JSON body sent to the server
    pub fn to_value(&self) -> Value {
        let result = match self {
            InitializationRequest::Publish { options, .. } => serde_json::to_value(options),
            InitializationRequest::Subscribe { options, .. } => serde_json::to_value(options),
        };
        result.unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidatePayload {
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    pub candidate: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: CandidatePayload },
}

/// Outbound signaling for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SdpMessage {
    pub id: String,
    pub signaling: SignalingPayload,
}

impl SdpMessage {
    pub fn description(session_id: &str, description: &SessionDescription) -> Self {
        let signaling = match description.sdp_type {
            SdpType::Answer => SignalingPayload::Answer {
                sdp: description.sdp.clone(),
            },
            _ => SignalingPayload::Offer {
                sdp: description.sdp.clone(),
            },
        };
        Self {
            id: session_id.to_string(),
            signaling,
        }
    }

    /// Candidate lines are sent with their `a=` prefix
    pub fn candidate(session_id: &str, candidate: &IceCandidate) -> Self {
        Self {
            id: session_id.to_string(),
            signaling: SignalingPayload::Candidate {
                candidate: CandidatePayload {
                    sdp_mline_index: candidate.sdp_mline_index.unwrap_or_default(),
                    sdp_mid: candidate.sdp_mid.clone().unwrap_or_default(),
                    candidate: format!("a={}", candidate.candidate),
                },
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Unpublish,
    Unsubscribe,
}

impl StreamEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEvent::Unpublish => "unpublish",
            StreamEvent::Unsubscribe => "unsubscribe",
        }
    }
}

/// Tracks addressed by a control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
    AudioAndVideo,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
            TrackKind::AudioAndVideo => "av",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOperation {
    Play,
    Pause,
}

impl ControlOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlOperation::Play => "play",
            ControlOperation::Pause => "pause",
        }
    }
}

/// Inbound signaling from the conference server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConferenceSignal {
    Success,
    Failure,
    Description(SessionDescription),
}

impl ConferenceSignal {
    /// Parse a server payload; `None` for anything unrecognized
    pub fn parse(payload: &Value) -> Option<Self> {
        match payload {
            Value::String(status) => match status.as_str() {
                "success" => Some(Self::Success),
                "failure" => Some(Self::Failure),
                _ => None,
            },
            Value::Object(map) => {
                let sdp_type = match map.get("type").and_then(Value::as_str)? {
                    "offer" => SdpType::Offer,
                    "answer" => SdpType::Answer,
                    _ => return None,
                };
                let sdp = map.get("sdp").and_then(Value::as_str)?;
                Some(Self::Description(SessionDescription {
                    sdp_type,
                    sdp: sdp.to_string(),
                }))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_publish_options_json() {
        let options = PublishOptions::webrtc(
            PublishMedia {
                audio: Some(MediaSource {
                    source: StreamSource::Mic,
                }),
                video: None,
            },
            HashMap::new(),
        );
        assert_eq!(
            serde_json::to_value(&options).unwrap(),
            json!({"type": "webrtc", "media": {"audio": {"source": "mic"}, "video": false}})
        );
    }

    #[test]
    fn test_subscribe_request_json() {
        let request = SubscribeRequest::webrtc(SubscribeMedia {
            audio: None,
            video: Some(VideoFrom {
                from: "stream-1".to_string(),
                parameters: Some(VideoParameters {
                    resolution: Some(Resolution::new(1280, 720)),
                    bitrate: Some("x0.8".to_string()),
                }),
            }),
        });
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "type": "webrtc",
                "media": {
                    "audio": false,
                    "video": {
                        "from": "stream-1",
                        "parameters": {
                            "resolution": {"width": 1280, "height": 720},
                            "bitrate": "x0.8"
                        }
                    }
                }
            })
        );
    }

    #[test]
    fn test_candidate_message_json() {
        let msg = SdpMessage::candidate(
            "s1",
            &IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host", "0", 0),
        );
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "id": "s1",
                "signaling": {
                    "type": "candidate",
                    "candidate": {
                        "sdpMLineIndex": 0,
                        "sdpMid": "0",
                        "candidate": "a=candidate:1 1 udp 1 10.0.0.1 5000 typ host"
                    }
                }
            })
        );
    }

    #[test]
    fn test_parse_server_signals() {
        assert_eq!(
            ConferenceSignal::parse(&json!("success")),
            Some(ConferenceSignal::Success)
        );
        assert_eq!(
            ConferenceSignal::parse(&json!({"type": "answer", "sdp": "v=0"})),
            Some(ConferenceSignal::Description(SessionDescription::answer("v=0")))
        );
        assert_eq!(ConferenceSignal::parse(&json!({"type": "ready"})), None);
        assert_eq!(ConferenceSignal::parse(&json!(42)), None);
    }
}
