//! TOML configuration schema
//!
//! All sections are optional in the file; missing values fall back to the
//! defaults below. CLI arguments override file values where a flag exists.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::source::SourceConfig;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// MQTT signaling transport
    pub signaling: SignalingConfig,
    /// WebRTC engine (ICE server shared by all streams)
    pub webrtc: WebRtcConfig,
    /// Published video streams, one publisher per entry
    #[serde(rename = "stream")]
    pub streams: Vec<StreamConfig>,
    /// UDP relay
    pub relay: RelayConfig,
    /// NAS file retrieval and archival
    pub nas: NasConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        toml::from_str(&raw)
            .map_err(|e| AppError::Config(format!("could not parse {}: {}", path.display(), e)))
    }
}

/// MQTT signaling parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// MQTT client id
    pub client_id: String,
    /// Fixed topic all offers are published to
    pub offer_topic: String,
    /// Per-stream answer topic is this prefix plus the session id
    pub answer_topic_prefix: String,
    /// Per-stream candidate topics are this prefix plus the session id
    pub candidate_topic_prefix: String,
    /// Delivery guarantee level (0, 1 or 2)
    pub qos: u8,
    /// Publish messages with the retained flag set
    pub retained: bool,
    /// Deadline for the remote answer, in seconds
    pub answer_timeout_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "skystream-edge".to_string(),
            offer_topic: "signal/offer".to_string(),
            answer_topic_prefix: "signal/answer".to_string(),
            candidate_topic_prefix: "signal/candidate".to_string(),
            qos: 1,
            retained: false,
            answer_timeout_secs: 30,
        }
    }
}

/// WebRTC engine configuration, shared across all streams in a process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// ICE server URL (STUN or TURN); empty means host candidates only
    pub ice_server: String,
    /// ICE server username
    pub username: String,
    /// ICE server credential
    pub credential: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_server: "stun:stun.l.google.com:19302".to_string(),
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// One published stream: an identity plus its video source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream id, used to namespace signaling topics
    pub id: String,
    #[serde(flatten)]
    pub source: SourceConfig,
}

/// UDP relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen host
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Comma separated list of "host:port" sink addresses
    pub sinks: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5004,
            sinks: String::new(),
        }
    }
}

/// NAS (FileStation API) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NasConfig {
    /// NAS host
    pub host: String,
    /// NAS port
    pub port: u16,
    /// Account name
    pub account: String,
    /// Account password
    pub password: String,
    /// Directory downloaded files are stored in
    pub store_path: String,
    /// Chunked-upload endpoint; empty disables archival after fetch
    pub upload_url: String,
}

impl Default for NasConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5000,
            account: String::new(),
            password: String::new(),
            store_path: ".".to_string(),
            upload_url: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceKind;

    const SAMPLE: &str = r#"
[signaling]
host = "broker.example.com"
port = 1883
client_id = "edge-01"
offer_topic = "signal/offer"
answer_topic_prefix = "signal/answer"
candidate_topic_prefix = "signal/candidate"
qos = 1
retained = false
answer_timeout_secs = 20

[webrtc]
ice_server = "turn:turn.example.com:3478"
username = "edge"
credential = "secret"

[[stream]]
id = "front-cam"
kind = "rtp"
host = "0.0.0.0"
port = 5004

[[stream]]
id = "gimbal-cam"
kind = "rtsp"
address = "rtsp://127.0.0.1:8554/stream"

[relay]
host = "0.0.0.0"
port = 5004
sinks = "127.0.0.1:5006,127.0.0.1:5008"

[nas]
host = "nas.example.com"
port = 5000
account = "admin"
password = "secret"
store_path = "/var/lib/skystream"
"#;

    #[test]
    fn parses_sample_config() {
        let config: AppConfig = toml::from_str(SAMPLE).unwrap();

        assert_eq!(config.signaling.host, "broker.example.com");
        assert_eq!(config.signaling.answer_timeout_secs, 20);
        assert_eq!(config.webrtc.username, "edge");
        assert_eq!(config.streams.len(), 2);
        assert_eq!(config.streams[0].id, "front-cam");
        assert_eq!(config.streams[0].source.kind(), SourceKind::Rtp);
        assert_eq!(config.streams[1].source.kind(), SourceKind::Rtsp);
        assert_eq!(config.relay.sinks, "127.0.0.1:5006,127.0.0.1:5008");
        assert_eq!(config.nas.store_path, "/var/lib/skystream");
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();

        assert_eq!(config.signaling.port, 1883);
        assert_eq!(config.signaling.qos, 1);
        assert_eq!(config.signaling.answer_timeout_secs, 30);
        assert!(config.streams.is_empty());
        assert_eq!(config.relay.port, 5004);
        assert_eq!(config.nas.port, 5000);
    }

    #[test]
    fn stream_source_variants_are_exclusive() {
        // an rtsp stream must not carry rtp fields
        let bad = r#"
[[stream]]
id = "cam"
kind = "rtsp"
host = "0.0.0.0"
port = 5004
"#;
        assert!(toml::from_str::<AppConfig>(bad).is_err());
    }
}
