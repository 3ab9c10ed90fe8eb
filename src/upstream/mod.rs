mod relay;
mod tcp;
mod udp;

pub use relay::{RelayLimits, RelayOptions, RelayUpstream};
pub use tcp::TcpUpstream;
pub use udp::UdpUpstream;

use std::sync::atomic::Ordering;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;

use crate::metrics::Metrics;

/// Upstream failure taxonomy. Kinds are `Clone` because single-flight hands
/// every waiter the leader's exact outcome. Nothing here is retried; each
/// kind maps onto one counter and the client only ever sees SERVFAIL.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("udp upstream timed out")]
    UdpTimeout,
    #[error("udp upstream failed: {0}")]
    Udp(String),
    #[error("tcp upstream timed out")]
    TcpTimeout,
    #[error("tcp connect failed: {0}")]
    TcpConnect(String),
    #[error("tcp protocol error: {0}")]
    TcpProtocol(String),
    #[error("relay request timed out")]
    RelayTimeout,
    #[error("relay rejected our credentials")]
    RelayUnauthorized,
    #[error("relay client error: {0}")]
    RelayClient(String),
    #[error("relay upstream resolution failed")]
    RelayUpstream,
    #[error("relay protocol error: {0}")]
    RelayProtocol(String),
    #[error("relay payload too large")]
    RelayTooLarge,
    #[error("relay rate limited")]
    RelayRateLimited,
    #[error("relay internal error")]
    RelayInternal,
    /// The in-flight leader went away without publishing (shutdown only).
    #[error("in-flight resolution abandoned")]
    FlightAbandoned,
}

impl UpstreamError {
    pub fn record(&self, metrics: &Metrics) {
        let counter = match self {
            Self::UdpTimeout => &metrics.upstream_udp_timeouts_total,
            Self::Udp(_) => &metrics.upstream_udp_errors_total,
            Self::TcpTimeout => &metrics.upstream_tcp_timeouts_total,
            Self::TcpConnect(_) => &metrics.upstream_tcp_connect_errors_total,
            Self::TcpProtocol(_) => &metrics.upstream_tcp_protocol_errors_total,
            Self::RelayTimeout => &metrics.upstream_relay_timeouts_total,
            Self::RelayUnauthorized => &metrics.upstream_relay_unauthorized_total,
            Self::RelayClient(_) => &metrics.upstream_relay_client_errors_total,
            Self::RelayUpstream => &metrics.upstream_relay_upstream_errors_total,
            Self::RelayProtocol(_) => &metrics.upstream_relay_protocol_errors_total,
            Self::RelayTooLarge => &metrics.upstream_relay_too_large_total,
            Self::RelayRateLimited => &metrics.upstream_relay_rate_limited_total,
            Self::RelayInternal => &metrics.upstream_relay_internal_errors_total,
            Self::FlightAbandoned => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The configured upstream transport. One of the three adapters, all
/// satisfying `resolve(wire_query, deadline) -> wire_reply | error` with the
/// deadline as a hard per-call cutoff and no retries.
pub enum Upstream {
    Udp(UdpUpstream),
    Tcp(TcpUpstream),
    Relay(RelayUpstream),
}

impl Upstream {
    pub async fn resolve(&self, wire: &[u8], deadline: Instant) -> Result<Bytes, UpstreamError> {
        match self {
            Self::Udp(upstream) => upstream.resolve(wire, deadline).await,
            Self::Tcp(upstream) => upstream.resolve(wire, deadline).await,
            Self::Relay(upstream) => upstream.resolve(wire, deadline).await,
        }
    }

    pub fn transport_name(&self) -> &'static str {
        match self {
            Self::Udp(_) => "udp",
            Self::Tcp(_) => "tcp",
            Self::Relay(_) => "relay",
        }
    }

    /// Error kind for a reply that does not parse as a DNS message.
    pub fn malformed_reply_error(&self) -> UpstreamError {
        match self {
            Self::Udp(_) => UpstreamError::Udp("malformed upstream reply".into()),
            Self::Tcp(_) => UpstreamError::TcpProtocol("malformed upstream reply".into()),
            Self::Relay(_) => UpstreamError::RelayProtocol("malformed upstream reply".into()),
        }
    }
}
