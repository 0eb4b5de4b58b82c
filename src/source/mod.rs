//! Local video sources and the tracks they feed
//!
//! Two interchangeable source variants exist: a raw-packet source copying
//! RTP datagrams from a UDP socket into a [`TrackLocalStaticRTP`], and an
//! RTSP source depacketizing an interleaved feed into a
//! [`TrackLocalStaticSample`]. Both produce H.264 tracks; that is the only
//! codec this publisher speaks.

pub mod rtp;
pub mod rtsp;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{AppError, Result};

/// H264 clock rate (always 90kHz per RFC 6184)
pub const H264_CLOCK_RATE: u32 = 90_000;

/// Classification tag of a stream's video source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Rtp,
    Rtsp,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Rtp => write!(f, "rtp"),
            SourceKind::Rtsp => write!(f, "rtsp"),
        }
    }
}

/// Video source configuration, one variant per source type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Raw RTP packets received on a local UDP socket
    Rtp { host: String, port: u16 },
    /// An RTSP feed pulled over TCP
    Rtsp { address: String },
}

impl SourceConfig {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceConfig::Rtp { .. } => SourceKind::Rtp,
            SourceConfig::Rtsp { .. } => SourceKind::Rtsp,
        }
    }

    /// Allocate the local track matching this source variant.
    ///
    /// Failure here is fatal to the current publish attempt; reconnection
    /// happens at the connection level, never at the track level.
    pub fn create_track(&self) -> Result<VideoTrack> {
        let id = Uuid::new_v4().to_string();
        let track = match self.kind() {
            SourceKind::Rtp => VideoTrack::Rtp(Arc::new(TrackLocalStaticRTP::new(
                h264_capability(),
                format!("video-{id}"),
                format!("edge-{id}"),
            ))),
            SourceKind::Rtsp => VideoTrack::Sample(Arc::new(TrackLocalStaticSample::new(
                h264_capability(),
                format!("video-{id}"),
                format!("edge-{id}"),
            ))),
        };
        Ok(track)
    }

    /// Feed the track from this source. Blocks until the source ends.
    pub async fn stream(&self, track: &VideoTrack) -> Result<()> {
        match (self, track) {
            (SourceConfig::Rtp { host, port }, VideoTrack::Rtp(track)) => {
                rtp::stream(host, *port, track.clone()).await
            }
            (SourceConfig::Rtsp { address }, VideoTrack::Sample(track)) => {
                rtsp::stream(address, track.clone()).await
            }
            _ => Err(AppError::Source(
                "track does not match source variant".to_string(),
            )),
        }
    }
}

/// The local track handed to the peer connection, one variant per source
#[derive(Clone)]
pub enum VideoTrack {
    Rtp(Arc<TrackLocalStaticRTP>),
    Sample(Arc<TrackLocalStaticSample>),
}

impl VideoTrack {
    /// The track as the trait object the peer connection consumes
    pub fn track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        match self {
            VideoTrack::Rtp(track) => track.clone(),
            VideoTrack::Sample(track) => track.clone(),
        }
    }
}

fn h264_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_H264.to_string(),
        clock_rate: H264_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}
