use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::debug;

use super::UpstreamError;

/// Datagram forwarder to a classic DNS upstream. One query, one reply: each
/// call uses a fresh ephemeral socket (sharing sockets without a dispatcher
/// invites cross-query id collisions) and waits for the first datagram whose
/// transaction id matches. Truncated replies pass through with TC intact.
pub struct UdpUpstream {
    addr: String,
    ipv6: bool,
}

impl UdpUpstream {
    pub fn new(host: &str, port: u16) -> Self {
        let ipv6 = host.parse::<std::net::Ipv6Addr>().is_ok();
        let addr = if ipv6 {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Self { addr, ipv6 }
    }

    pub async fn resolve(&self, wire: &[u8], deadline: Instant) -> Result<Bytes, UpstreamError> {
        if wire.len() < 2 {
            return Err(UpstreamError::Udp("query too short".into()));
        }
        let budget = deadline.saturating_duration_since(Instant::now());
        if budget.is_zero() {
            return Err(UpstreamError::UdpTimeout);
        }

        let bind_addr = if self.ipv6 { "[::]:0" } else { "0.0.0.0:0" };
        let exchange = async {
            let socket = UdpSocket::bind(bind_addr).await.map_err(io_err)?;
            socket.connect(&self.addr).await.map_err(io_err)?;
            socket.send(wire).await.map_err(io_err)?;

            let mut buf = vec![0u8; 65_535];
            loop {
                let len = socket.recv(&mut buf).await.map_err(io_err)?;
                if len >= 2 && buf[..2] == wire[..2] {
                    return Ok(Bytes::copy_from_slice(&buf[..len]));
                }
                debug!(
                    event = "udp_upstream_stray",
                    upstream = %self.addr,
                    "datagram with foreign transaction id ignored"
                );
            }
        };

        match timeout(budget, exchange).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::UdpTimeout),
        }
    }
}

fn io_err(err: std::io::Error) -> UpstreamError {
    UpstreamError::Udp(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// One-shot upstream fixture: optionally sends a stray datagram first,
    /// then echoes a minimal reply with the query's transaction id.
    async fn spawn_fixture(send_stray_first: bool) -> std::net::SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind fixture");
        let addr = socket.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            if send_stray_first {
                let mut stray = buf[..len].to_vec();
                stray[0] ^= 0xFF;
                let _ = socket.send_to(&stray, peer).await;
            }
            let mut reply = buf[..len].to_vec();
            reply[2] |= 0x80; // QR bit
            let _ = socket.send_to(&reply, peer).await;
        });
        addr
    }

    fn query() -> Vec<u8> {
        let mut wire = vec![0u8; 17];
        wire[0] = 0xAB;
        wire[1] = 0xCD;
        wire[5] = 1;
        wire[12] = 0; // root name, then qtype/qclass
        wire[14] = 1;
        wire[16] = 1;
        wire
    }

    #[tokio::test]
    async fn forwards_and_matches_the_transaction_id() {
        let addr = spawn_fixture(false).await;
        let upstream = UdpUpstream::new("127.0.0.1", addr.port());
        let deadline = Instant::now() + Duration::from_secs(1);
        let reply = upstream.resolve(&query(), deadline).await.expect("reply");
        assert_eq!(&reply[..2], &[0xAB, 0xCD]);
    }

    #[tokio::test]
    async fn skips_datagrams_with_foreign_ids() {
        let addr = spawn_fixture(true).await;
        let upstream = UdpUpstream::new("127.0.0.1", addr.port());
        let deadline = Instant::now() + Duration::from_secs(1);
        let reply = upstream.resolve(&query(), deadline).await.expect("reply");
        assert_eq!(&reply[..2], &[0xAB, 0xCD]);
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        // Bound but never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = silent.local_addr().expect("addr");
        let upstream = UdpUpstream::new("127.0.0.1", addr.port());
        let deadline = Instant::now() + Duration::from_millis(80);
        let err = upstream.resolve(&query(), deadline).await.unwrap_err();
        assert!(matches!(err, UpstreamError::UdpTimeout));
    }

    #[tokio::test]
    async fn expired_deadline_fails_before_any_io() {
        let upstream = UdpUpstream::new("127.0.0.1", 1);
        let err = upstream
            .resolve(&query(), Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::UdpTimeout));
    }
}
