//! Signaling contract between the publisher and its remote consumer
//!
//! The session manager depends only on the [`SignalingChannel`] trait; the
//! MQTT transport in [`mqtt`] is one implementation of it. Whatever the
//! transport, delivery is assumed at-least-once and order-preserving per
//! topic.

pub mod mqtt;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::Result;
use crate::source::SourceKind;

/// Identity of one published stream: an opaque id plus the source
/// classification tag. Immutable for the life of a session; namespaces
/// signaling topics and appears in logs.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub id: String,
    pub kind: SourceKind,
}

impl SessionIdentity {
    pub fn new(id: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.kind)
    }
}

/// Offer as published on the shared offer topic: the session description
/// plus the identity of the stream it belongs to, so a consumer listening
/// on the one deployment-wide topic can tell the streams apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferMessage {
    pub id: String,
    #[serde(rename = "trackSource")]
    pub track_source: SourceKind,
    pub description: RTCSessionDescription,
}

/// ICE candidate as carried on the signaling channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// Asynchronous bidirectional signaling, addressed by the session identity
/// the implementation was built with.
///
/// Ordering is the session manager's business, not the channel's: inbound
/// candidates must only reach the peer connection after the remote
/// description is set, and local candidates are never sent before the offer.
#[async_trait]
pub trait SignalingChannel: Send + Sync + 'static {
    /// Publish the local session description.
    async fn send_offer(&self, description: &RTCSessionDescription) -> Result<()>;

    /// Subscribe to the remote answer. The receiver yields zero or one
    /// value and then ends; ending without a value means the remote side
    /// withdrew and the handshake should abort gracefully.
    async fn answers(&self) -> Result<mpsc::Receiver<RTCSessionDescription>>;

    /// Publish a locally discovered ICE candidate.
    async fn send_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Subscribe to remote ICE candidates; the receiver stays open until
    /// the remote end closes the exchange.
    async fn candidates(&self) -> Result<mpsc::Receiver<IceCandidate>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_formats_id_and_kind() {
        let identity = SessionIdentity::new("front-cam", SourceKind::Rtp);
        assert_eq!(identity.to_string(), "front-cam/rtp");
    }

    #[test]
    fn offer_message_carries_identity() {
        let description: RTCSessionDescription = serde_json::from_value(serde_json::json!({
            "type": "offer",
            "sdp": "v=0\r\n"
        }))
        .unwrap();

        let message = OfferMessage {
            id: "front-cam".to_string(),
            track_source: SourceKind::Rtp,
            description,
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["id"], "front-cam");
        assert_eq!(json["trackSource"], "rtp");
        assert_eq!(json["description"]["type"], "offer");
    }

    #[test]
    fn candidate_json_uses_sdp_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 UDP 2013266431 10.0.0.7 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };

        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json["usernameFragment"].is_null());

        let decoded: IceCandidate = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.candidate, candidate.candidate);
    }
}
