use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::debug;

use super::UpstreamError;
use crate::metrics::Metrics;

struct IdleConn {
    stream: TcpStream,
    parked_at: std::time::Instant,
}

/// RFC 7766 forwarder with a checkout pool. A connection carries at most one
/// in-flight request (no pipelining): callers take exclusive ownership, and
/// only a clean exchange puts the connection back. Idle connections past
/// `idle_timeout` are discarded at checkout.
pub struct TcpUpstream {
    addr: String,
    pool: Mutex<VecDeque<IdleConn>>,
    max_idle: usize,
    idle_timeout: Duration,
    max_message_size: usize,
    metrics: Arc<Metrics>,
}

impl TcpUpstream {
    pub fn new(
        host: &str,
        port: u16,
        max_idle: usize,
        idle_timeout: Duration,
        max_message_size: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let addr = if host.parse::<std::net::Ipv6Addr>().is_ok() {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Self {
            addr,
            pool: Mutex::new(VecDeque::new()),
            max_idle,
            idle_timeout,
            max_message_size,
            metrics,
        }
    }

    pub async fn resolve(&self, wire: &[u8], deadline: Instant) -> Result<Bytes, UpstreamError> {
        if wire.len() > usize::from(u16::MAX) {
            return Err(UpstreamError::TcpProtocol("query exceeds tcp frame".into()));
        }

        let stream = match self.checkout() {
            Some(stream) => {
                self.metrics
                    .upstream_tcp_reuses_total
                    .fetch_add(1, Ordering::Relaxed);
                stream
            }
            None => self.connect(deadline).await?,
        };

        // Any error discards the connection; only a clean exchange parks it.
        let (reply, stream) = self.exchange(stream, wire, deadline).await?;
        self.checkin(stream);
        Ok(reply)
    }

    fn pool(&self) -> MutexGuard<'_, VecDeque<IdleConn>> {
        match self.pool.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn checkout(&self) -> Option<TcpStream> {
        let mut pool = self.pool();
        while let Some(conn) = pool.pop_front() {
            if conn.parked_at.elapsed() <= self.idle_timeout {
                return Some(conn.stream);
            }
            debug!(event = "tcp_pool_idle_evict", upstream = %self.addr, "idle connection dropped");
        }
        None
    }

    fn checkin(&self, stream: TcpStream) {
        let mut pool = self.pool();
        if pool.len() < self.max_idle {
            pool.push_back(IdleConn {
                stream,
                parked_at: std::time::Instant::now(),
            });
        }
    }

    async fn connect(&self, deadline: Instant) -> Result<TcpStream, UpstreamError> {
        let budget = deadline.saturating_duration_since(Instant::now());
        if budget.is_zero() {
            return Err(UpstreamError::TcpConnect("no time left to connect".into()));
        }
        match timeout(budget, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(err)) => Err(UpstreamError::TcpConnect(err.to_string())),
            Err(_) => Err(UpstreamError::TcpConnect("connect timed out".into())),
        }
    }

    async fn exchange(
        &self,
        mut stream: TcpStream,
        wire: &[u8],
        deadline: Instant,
    ) -> Result<(Bytes, TcpStream), UpstreamError> {
        let budget = deadline.saturating_duration_since(Instant::now());
        if budget.is_zero() {
            return Err(UpstreamError::TcpTimeout);
        }

        let io = async {
            let mut frame = Vec::with_capacity(2 + wire.len());
            frame.extend_from_slice(&(wire.len() as u16).to_be_bytes());
            frame.extend_from_slice(wire);
            stream.write_all(&frame).await.map_err(proto_err)?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.map_err(proto_err)?;
            let reply_len = usize::from(u16::from_be_bytes(len_buf));
            if reply_len == 0
                || (self.max_message_size > 0 && reply_len > self.max_message_size)
            {
                return Err(UpstreamError::TcpProtocol(format!(
                    "reply length {reply_len} out of bounds"
                )));
            }

            let mut body = vec![0u8; reply_len];
            stream.read_exact(&mut body).await.map_err(proto_err)?;
            Ok(Bytes::from(body))
        };

        match timeout(budget, io).await {
            Ok(Ok(reply)) => Ok((reply, stream)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(UpstreamError::TcpTimeout),
        }
    }
}

fn proto_err(err: std::io::Error) -> UpstreamError {
    UpstreamError::TcpProtocol(err.to_string())
}
