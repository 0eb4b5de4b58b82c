//! RTSP source
//!
//! A minimal RTSP client pulling an H.264 feed over TCP interleaved
//! transport: DESCRIBE, SETUP (interleaved), PLAY, then a read loop over
//! `$`-framed RTP. Payloads are depacketized into access units and written
//! to the sample track on marker boundaries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rtp::codecs::h264::H264Packet;
use rtp::packetizer::Depacketizer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::util::Unmarshal;

use crate::error::{AppError, Result};
use crate::source::H264_CLOCK_RATE;

const RTSP_BUF_SIZE: usize = 8192;
const RTSP_DEFAULT_PORT: u16 = 554;
/// Interleaved channel carrying RTP; channel 1 is the paired RTCP
const VIDEO_CHANNEL: u8 = 0;
/// Fallback sample duration until two RTP timestamps are known
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Connect to the RTSP source and feed the track. Blocks until the remote
/// server closes the connection.
pub async fn stream(address: &str, track: Arc<TrackLocalStaticSample>) -> Result<()> {
    let endpoint = parse_address(address)?;
    let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    info!("connected to RTSP source {}", address);

    let mut cseq = 1u32;
    let describe = send_request(
        &mut stream,
        &mut cseq,
        "DESCRIBE",
        &endpoint.target,
        &[("Accept", "application/sdp")],
    )
    .await?;

    let setup_url = control_url(&endpoint.target, &describe.body);
    let setup = send_request(
        &mut stream,
        &mut cseq,
        "SETUP",
        &setup_url,
        &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
    )
    .await?;

    let session = setup
        .headers
        .get("session")
        .map(|s| s.split(';').next().unwrap_or(s).trim().to_string())
        .ok_or_else(|| AppError::Source("SETUP response missing session header".to_string()))?;

    send_request(
        &mut stream,
        &mut cseq,
        "PLAY",
        &endpoint.target,
        &[("Session", &session), ("Range", "npt=0.000-")],
    )
    .await?;
    info!("RTSP stream {} playing", address);

    read_interleaved(stream, track).await
}

struct RtspEndpoint {
    host: String,
    port: u16,
    target: String,
}

fn parse_address(address: &str) -> Result<RtspEndpoint> {
    let url = url::Url::parse(address)
        .map_err(|e| AppError::Source(format!("invalid RTSP address {}: {}", address, e)))?;
    if url.scheme() != "rtsp" {
        return Err(AppError::Source(format!(
            "unsupported scheme {} in RTSP address",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Source(format!("RTSP address {} has no host", address)))?
        .to_string();

    Ok(RtspEndpoint {
        host,
        port: url.port().unwrap_or(RTSP_DEFAULT_PORT),
        target: address.trim_end_matches('/').to_string(),
    })
}

/// Pick the control URL from the DESCRIBE body. Falls back to the request
/// target when the SDP carries no usable control attribute.
fn control_url(base: &str, sdp: &str) -> String {
    for line in sdp.lines() {
        if let Some(control) = line.trim().strip_prefix("a=control:") {
            let control = control.trim();
            if control == "*" {
                break;
            }
            if control.starts_with("rtsp://") {
                return control.to_string();
            }
            return format!("{}/{}", base.trim_end_matches('/'), control);
        }
    }
    base.to_string()
}

struct RtspResponse {
    headers: HashMap<String, String>,
    body: String,
}

async fn send_request(
    stream: &mut TcpStream,
    cseq: &mut u32,
    method: &str,
    target: &str,
    headers: &[(&str, &str)],
) -> Result<RtspResponse> {
    let mut request = format!(
        "{} {} RTSP/1.0\r\nCSeq: {}\r\nUser-Agent: skystream\r\n",
        method, target, cseq
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    *cseq += 1;

    stream.write_all(request.as_bytes()).await?;

    // Responses are small; read byte-wise up to the blank line, then the
    // declared body. Interleaved data only starts after PLAY completes.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > RTSP_BUF_SIZE {
            return Err(AppError::Source(
                "oversized RTSP response header".to_string(),
            ));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }

    let (status, parsed) = parse_response_head(&head)?;

    let length: usize = parsed
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    if length > 0 {
        stream.read_exact(&mut body).await?;
    }

    if status != 200 {
        return Err(AppError::Source(format!(
            "RTSP {} failed with status {}",
            method, status
        )));
    }

    Ok(RtspResponse {
        headers: parsed,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

fn parse_response_head(raw: &[u8]) -> Result<(u16, HashMap<String, String>)> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.lines();

    let status_line = lines
        .next()
        .ok_or_else(|| AppError::Source("empty RTSP response".to_string()))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| AppError::Source(format!("malformed RTSP status line: {}", status_line)))?;

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Ok((status, headers))
}

async fn read_interleaved(mut stream: TcpStream, track: Arc<TrackLocalStaticSample>) -> Result<()> {
    let mut depacketizer = H264Packet::default();
    let mut access_unit: Vec<u8> = Vec::new();
    let mut last_timestamp: Option<u32> = None;
    let mut header = [0u8; 4];

    loop {
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!("RTSP source closed the connection");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        if header[0] != b'$' {
            // Lost interleaved framing (a server may inject RTSP requests
            // mid-stream); scan forward to the next frame marker.
            resync(&mut stream, &mut header).await?;
        }

        let channel = header[1];
        let length = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut payload = vec![0u8; length];
        stream.read_exact(&mut payload).await?;

        if channel != VIDEO_CHANNEL {
            continue;
        }

        let mut raw = &payload[..];
        let packet = match rtp::packet::Packet::unmarshal(&mut raw) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("dropping malformed RTP packet: {}", e);
                continue;
            }
        };

        let nal = match depacketizer.depacketize(&packet.payload) {
            Ok(nal) => nal,
            Err(e) => {
                debug!("skipping RTP payload: {}", e);
                continue;
            }
        };
        access_unit.extend_from_slice(&nal);

        // The marker bit closes an access unit
        if packet.header.marker && !access_unit.is_empty() {
            let sample = Sample {
                data: Bytes::from(std::mem::take(&mut access_unit)),
                duration: advance(&mut last_timestamp, packet.header.timestamp),
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!("could not write sample to track: {}", e);
            }
        }
    }
}

async fn resync(stream: &mut TcpStream, header: &mut [u8; 4]) -> Result<()> {
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'$' {
            stream.read_exact(&mut header[1..]).await?;
            header[0] = b'$';
            return Ok(());
        }
    }
}

/// Sample duration from the 90kHz RTP timestamp delta. Unreasonable jumps
/// (stream restart, wraparound) fall back to the default frame interval.
fn advance(last: &mut Option<u32>, timestamp: u32) -> Duration {
    let duration = match *last {
        Some(previous) => {
            let ticks = timestamp.wrapping_sub(previous);
            if ticks == 0 || ticks > H264_CLOCK_RATE {
                DEFAULT_FRAME_INTERVAL
            } else {
                Duration::from_secs_f64(f64::from(ticks) / f64::from(H264_CLOCK_RATE))
            }
        }
        None => DEFAULT_FRAME_INTERVAL,
    };
    *last = Some(timestamp);
    duration
}
