//! UDP relay
//!
//! Receives a stream on one UDP socket and rebroadcasts every datagram to a
//! fixed list of sink addresses, acting like a multiudpsink element. No
//! protocol logic; bytes in, bytes out.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::error::{AppError, Result};

/// UDP MTU
const UDP_MTU: usize = 1600;

/// Bind the configured listener and run the relay loop forever.
pub async fn run(config: &RelayConfig) -> Result<()> {
    let sinks = parse_sink_addresses(&config.sinks)?;
    let socket = UdpSocket::bind((config.host.as_str(), config.port)).await?;
    info!("UDP relay listening on {}", socket.local_addr()?);

    relay(socket, &sinks).await
}

async fn relay(socket: UdpSocket, sinks: &[SocketAddr]) -> Result<()> {
    let mut buf = [0u8; UDP_MTU];
    loop {
        let (n, _) = socket.recv_from(&mut buf).await?;

        for sink in sinks {
            // an unreachable sink must not starve the others
            if let Err(e) = socket.send_to(&buf[..n], sink).await {
                warn!("could not relay packet to {}: {}", sink, e);
            }
        }
    }
}

/// Parse a comma separated list of "host:port" sink addresses, e.g.
/// "192.0.2.1:2000,192.0.2.2:2001".
pub fn parse_sink_addresses(sinks: &str) -> Result<Vec<SocketAddr>> {
    if sinks.trim().is_empty() {
        return Err(AppError::Relay("no sink addresses configured".to_string()));
    }

    sinks
        .split(',')
        .map(|addr| {
            addr.trim()
                .parse()
                .map_err(|e| AppError::Relay(format!("invalid sink address {}: {}", addr, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parses_sink_address_list() {
        let sinks = parse_sink_addresses("192.0.2.1:2000,192.0.2.2:2001").unwrap();
        assert_eq!(sinks.len(), 2);
        assert_eq!(sinks[0], "192.0.2.1:2000".parse().unwrap());
        assert_eq!(sinks[1], "192.0.2.2:2001".parse().unwrap());
    }

    #[test]
    fn rejects_empty_sink_list() {
        assert!(parse_sink_addresses("").is_err());
        assert!(parse_sink_addresses("   ").is_err());
    }

    #[test]
    fn rejects_malformed_sink_address() {
        assert!(parse_sink_addresses("192.0.2.1:2000,nonsense").is_err());
    }

    #[tokio::test]
    async fn fans_datagrams_out_to_every_sink() {
        let sink_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sink_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sinks = vec![
            sink_a.local_addr().unwrap(),
            sink_b.local_addr().unwrap(),
        ];

        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = relay(listener, &sinks).await;
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"rtp-payload", relay_addr).await.unwrap();

        let mut buf = [0u8; 64];
        for sink in [&sink_a, &sink_b] {
            let (n, _) = tokio::time::timeout(Duration::from_secs(5), sink.recv_from(&mut buf))
                .await
                .expect("sink should receive the datagram")
                .unwrap();
            assert_eq!(&buf[..n], b"rtp-payload");
        }
    }
}
