//! Raw RTP source
//!
//! Copies UDP datagrams straight into the local track. The packets are
//! assumed to be pre-encoded H.264 RTP, typically produced by a pipeline
//! such as gstreamer's udpsink pointed at this socket.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::info;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use crate::error::{AppError, Result};

/// UDP MTU, matching the relay's read buffer
const UDP_MTU: usize = 1600;

/// Read RTP packets from a UDP socket and write them into the track.
/// Blocks indefinitely unless the socket read fails.
pub async fn stream(host: &str, port: u16, track: Arc<TrackLocalStaticRTP>) -> Result<()> {
    let socket = UdpSocket::bind((host, port)).await?;
    info!("listening for RTP packets on {}:{}", host, port);

    let mut buf = vec![0u8; UDP_MTU];
    loop {
        let (n, _) = socket.recv_from(&mut buf).await?;
        match track.write(&buf[..n]).await {
            Ok(_) => {}
            // No consumer bound right now; keep reading so the socket
            // does not back up.
            Err(webrtc::Error::ErrClosedPipe) => {}
            Err(e) => {
                return Err(AppError::Source(format!(
                    "could not write RTP packet to track: {}",
                    e
                )))
            }
        }
    }
}
