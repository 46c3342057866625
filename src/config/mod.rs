//! Channel configuration
//!
//! Configuration is a plain value object passed to channel constructors.
//! It can be loaded from a JSON file; field names are camelCase.

mod schema;
mod store;

pub use schema::{
    AudioCodec, AudioEncodingParameters, ChannelConfig, IceServer, VideoCodec,
    VideoEncodingParameters,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;

    #[test]
    fn test_defaults() {
        let config = ChannelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reconnect_timeout().as_secs(), 10);
        assert_eq!(config.negotiation_timeout().map(|d| d.as_secs()), Some(30));
        assert_eq!(config.max_video_bitrate_bps(), None);
    }

    #[test]
    fn test_bitrate_uses_kibibits() {
        let config = ChannelConfig::from_json_str(
            r#"{"video":[{"codec":"vp8"},{"codec":"h264","maxBitrateKbps":2000}],
                "audio":[{"codec":"opus","maxBitrateKbps":64}]}"#,
        )
        .unwrap();
        assert_eq!(config.max_video_bitrate_bps(), Some(2000 * 1024));
        assert_eq!(config.max_audio_bitrate_bps(), Some(64 * 1024));
        // Missing fields keep their defaults
        assert!(config.candidate_buffering);
    }

    #[test]
    fn test_validate_rejects_bad_servers() {
        let turn_without_auth = ChannelConfig {
            ice_servers: vec![IceServer {
                urls: vec!["turn:turn.example.com:3478".to_string()],
                username: String::new(),
                credential: String::new(),
            }],
            ..Default::default()
        };
        assert!(matches!(
            turn_without_auth.validate(),
            Err(SessionError::Config(_))
        ));

        let bad_scheme = ChannelConfig {
            ice_servers: vec![IceServer::stun("http://example.com")],
            ..Default::default()
        };
        assert!(bad_scheme.validate().is_err());

        let zero_timeout = ChannelConfig {
            negotiation_timeout_ms: Some(0),
            ..Default::default()
        };
        assert!(zero_timeout.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("channel.json");

        let config = ChannelConfig {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            negotiation_timeout_ms: None,
            ..Default::default()
        };
        config.save(&path).await.unwrap();

        let loaded = ChannelConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = ChannelConfig::load(&dir.path().join("absent.json")).await;
        assert!(matches!(result, Err(SessionError::Config(_))));
    }
}
