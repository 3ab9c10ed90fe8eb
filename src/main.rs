mod cache;
mod config;
mod metrics;
mod proto;
mod refresh;
mod resolver;
mod singleflight;
mod upstream;
mod warmup;

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::DnsCache;
use crate::config::{Config, StartupCheckMode, UpstreamTransport};
use crate::metrics::Metrics;
use crate::refresh::RefreshQueue;
use crate::resolver::Resolver;
use crate::upstream::{RelayUpstream, TcpUpstream, UdpUpstream, Upstream};

#[derive(Parser, Debug)]
#[command(author, version, about = "ResilientDNS: LAN DNS cache/forwarder for unreliable networks", long_about = None)]
struct Args {
    /// 配置文件路径（JSON），缺省使用内置默认值
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// 覆盖配置中的 UDP worker 数量（0 = 使用配置）
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = match &args.config {
        Some(path) => config::load_config(path).context("load initial config")?,
        None => {
            let cfg = Config::default();
            cfg.validate().context("validate default config")?;
            cfg
        }
    };

    let metrics = Metrics::new();
    let cache = Arc::new(DnsCache::new(
        cfg.cache_max_entries,
        cfg.ttl_policy(),
        Arc::clone(&metrics),
    ));
    let upstream = build_upstream(&cfg, &metrics)?;

    // The relay handshake runs before any listener binds: in `require` mode
    // a bad relay must abort the process while clients still see silence.
    if let Upstream::Relay(relay) = upstream.as_ref() {
        match cfg.relay_startup_check {
            StartupCheckMode::Off => {}
            mode => match relay.startup_check(cfg.upstream_timeout()).await {
                Ok(()) => info!(event = "relay_startup_check", "relay accepted"),
                Err(err) if mode == StartupCheckMode::Warn => {
                    warn!(event = "relay_startup_check", error = %err, "continuing unverified");
                }
                Err(err) => return Err(err.context("relay startup check failed")),
            },
        }
    }

    let (queue, queue_rx) = RefreshQueue::new(cfg.refresh_queue_max, Arc::clone(&metrics));
    let fresh_gate = cfg.refresh_enabled.then(|| cfg.refresh_gate());
    let resolver = Resolver::new(
        Arc::clone(&cache),
        upstream,
        Arc::clone(&queue),
        Arc::clone(&metrics),
        cfg.max_inflight,
        cfg.upstream_timeout(),
        fresh_gate,
    );

    let mut refresh_handles = Vec::new();
    // With refresh disabled the queue still exists (stale serves enqueue
    // into it best-effort); it just never drains.
    let mut _idle_rx = None;
    if cfg.refresh_enabled {
        refresh_handles = refresh::spawn_refresh_tasks(
            cfg.refresh_settings(),
            Arc::clone(&cache),
            Arc::clone(&queue),
            queue_rx,
            resolver.clone(),
        );
        if let Some(path) = &cfg.refresh_warmup_path {
            if let Err(err) = warmup::enqueue_warmup_file(
                Path::new(path),
                &queue,
                cfg.refresh_warmup_limit,
                &metrics,
            ) {
                warn!(event = "warmup", error = %err, "warmup load failed");
            }
        }
    } else {
        if cfg.refresh_warmup_path.is_some() {
            warn!(event = "warmup", "refresh disabled, warmup file ignored");
        }
        _idle_rx = Some(queue_rx);
    }

    let listen = listen_addr(&cfg)?;
    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else if cfg.udp_max_workers > 0 {
        cfg.udp_max_workers
    } else {
        num_cpus::get()
    };

    info!(
        listen = %listen,
        transport = ?cfg.upstream_transport,
        upstream = %format!("{}:{}", cfg.upstream_host, cfg.upstream_port),
        udp_workers,
        refresh = cfg.refresh_enabled,
        "resilientdns started"
    );

    let mut listener_handles = Vec::with_capacity(udp_workers + 1);

    #[cfg(unix)]
    {
        // One SO_REUSEPORT socket per worker; the kernel spreads datagrams.
        for worker_id in 0..udp_workers {
            let std_socket = create_reuseport_udp_socket(listen)
                .with_context(|| format!("create udp socket for worker {worker_id}"))?;
            let socket = UdpSocket::from_std(std_socket)?;
            let resolver = resolver.clone();
            listener_handles.push(tokio::spawn(async move {
                if let Err(err) = run_udp_worker(worker_id, Arc::new(socket), resolver).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            }));
        }
    }

    #[cfg(not(unix))]
    {
        let socket = Arc::new(
            UdpSocket::bind(listen)
                .await
                .context("bind shared udp socket")?,
        );
        for worker_id in 0..udp_workers {
            let socket = Arc::clone(&socket);
            let resolver = resolver.clone();
            listener_handles.push(tokio::spawn(async move {
                if let Err(err) = run_udp_worker(worker_id, socket, resolver).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            }));
        }
    }

    let tcp_listener = TcpListener::bind(listen)
        .await
        .context("bind tcp listener")?;
    let tcp_resolver = resolver.clone();
    listener_handles.push(tokio::spawn(async move {
        if let Err(err) = run_tcp(tcp_listener, tcp_resolver).await {
            error!(error = %err, "tcp server exited");
        }
    }));

    let reporter = tokio::spawn(metrics::periodic_reporter(
        Arc::clone(&metrics),
        Duration::from_secs(60),
    ));

    #[cfg(unix)]
    spawn_cache_clear_handler(Arc::clone(&cache));

    shutdown_signal().await;
    info!(event = "shutdown", "signal received, stopping");

    // Pending refresh queue entries are dropped without attempt.
    for handle in refresh_handles {
        handle.abort();
    }
    for handle in listener_handles {
        handle.abort();
    }
    reporter.abort();

    info!(event = "stats_final", "{}", metrics.summary());
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn build_upstream(cfg: &Config, metrics: &Arc<Metrics>) -> anyhow::Result<Arc<Upstream>> {
    let upstream = match cfg.upstream_transport {
        UpstreamTransport::Udp => {
            Upstream::Udp(UdpUpstream::new(&cfg.upstream_host, cfg.upstream_port))
        }
        UpstreamTransport::Tcp => Upstream::Tcp(TcpUpstream::new(
            &cfg.upstream_host,
            cfg.upstream_port,
            cfg.tcp_pool_max_conns,
            Duration::from_millis(cfg.tcp_pool_idle_timeout_ms),
            cfg.tcp_max_message_size,
            Arc::clone(metrics),
        )),
        UpstreamTransport::Relay => {
            let opts = cfg
                .relay_options()
                .context("relay transport requires relay_base_url")?;
            Upstream::Relay(RelayUpstream::new(opts, Arc::clone(metrics))?)
        }
    };
    Ok(Arc::new(upstream))
}

fn listen_addr(cfg: &Config) -> anyhow::Result<SocketAddr> {
    (cfg.listen_host.as_str(), cfg.listen_port)
        .to_socket_addrs()
        .with_context(|| {
            format!(
                "resolve listen address {}:{}",
                cfg.listen_host, cfg.listen_port
            )
        })?
        .next()
        .context("listen address resolved to nothing")
}

#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

#[cfg(unix)]
fn spawn_cache_clear_handler(cache: Arc<DnsCache>) {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async move {
        let Ok(mut stream) = signal(SignalKind::user_defined1()) else {
            warn!("SIGUSR1 handler unavailable, cache clear disabled");
            return;
        };
        while stream.recv().await.is_some() {
            cache.clear();
            info!(event = "cache_clear", "cache cleared on SIGUSR1");
        }
    });
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run_udp_worker(
    worker_id: usize,
    socket: Arc<UdpSocket>,
    resolver: Resolver,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 4096];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                let packet = Bytes::copy_from_slice(&buf[..len]);
                let resolver = resolver.clone();
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    if let Some(reply) = resolver.handle_packet(&packet).await {
                        let _ = socket.send_to(&reply, peer).await;
                    }
                });
            }
            Err(err) => {
                // 继续收包，不退出。
                warn!(worker_id, error = %err, "udp recv failed");
            }
        }
    }
}

async fn run_tcp(listener: TcpListener, resolver: Resolver) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let resolver = resolver.clone();
        tokio::spawn(async move {
            let _ = handle_tcp_conn(stream, peer, resolver).await;
        });
    }
}

async fn handle_tcp_conn(
    mut stream: TcpStream,
    _peer: SocketAddr,
    resolver: Resolver,
) -> anyhow::Result<()> {
    const MAX_TCP_FRAME: usize = 64 * 1024;
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = usize::from(u16::from_be_bytes(len_buf));
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }

        let mut frame = vec![0u8; frame_len];
        if stream.read_exact(&mut frame).await.is_err() {
            return Ok(());
        }

        // Malformed frames drop the connection; there is nothing to answer.
        let Some(reply) = resolver.handle_packet(&frame).await else {
            return Ok(());
        };

        if reply.len() <= usize::from(u16::MAX) {
            let len_bytes = (reply.len() as u16).to_be_bytes();
            if stream.write_all(&len_bytes).await.is_err() {
                return Ok(());
            }
            if stream.write_all(&reply).await.is_err() {
                return Ok(());
            }
        }
    }
}
