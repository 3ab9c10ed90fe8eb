use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::cache::{RefreshGate, TtlPolicy};
use crate::refresh::RefreshSettings;
use crate::upstream::{RelayLimits, RelayOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamTransport {
    Udp,
    Tcp,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupCheckMode {
    Require,
    Warn,
    Off,
}

/// 运行配置，启动时装配一次，之后只读。
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// DNS 监听地址（UDP 与 TCP 共用）。
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// 同时在途的上游解析上限，超出即快速失败。
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// UDP 监听 worker 数量，0 表示 CPU 核心数。
    #[serde(default)]
    pub udp_max_workers: usize,

    #[serde(default = "default_upstream_transport")]
    pub upstream_transport: UpstreamTransport,
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,
    /// 单次上游调用的硬截止（毫秒）。
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,

    /// 正向应答 TTL 下限/上限（秒）。
    #[serde(default)]
    pub min_ttl: u64,
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u64,
    /// 负缓存 TTL 上限（秒），RFC 2308。
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl: u64,
    /// 上游失败时允许继续供应过期应答的窗口（秒）。
    #[serde(default = "default_serve_stale_max")]
    pub serve_stale_max: u64,
    /// 0 表示不限制条目数。
    #[serde(default)]
    pub cache_max_entries: usize,

    #[serde(default = "default_tcp_pool_max_conns")]
    pub tcp_pool_max_conns: usize,
    #[serde(default = "default_tcp_pool_idle_timeout_ms")]
    pub tcp_pool_idle_timeout_ms: u64,
    #[serde(default = "default_tcp_max_message_size")]
    pub tcp_max_message_size: usize,

    #[serde(default)]
    pub refresh_enabled: bool,
    #[serde(default = "default_refresh_ahead_seconds")]
    pub refresh_ahead_seconds: u64,
    #[serde(default = "default_refresh_popularity_threshold")]
    pub refresh_popularity_threshold: u64,
    /// 0 关闭衰减；否则最近命中需落在该窗口内（秒）。
    #[serde(default)]
    pub refresh_popularity_decay_seconds: u64,
    #[serde(default = "default_refresh_tick_ms")]
    pub refresh_tick_ms: u64,
    #[serde(default = "default_refresh_batch_size")]
    pub refresh_batch_size: usize,
    #[serde(default = "default_refresh_concurrency")]
    pub refresh_concurrency: usize,
    #[serde(default = "default_refresh_queue_max")]
    pub refresh_queue_max: usize,
    #[serde(default)]
    pub refresh_warmup_path: Option<String>,
    #[serde(default = "default_refresh_warmup_limit")]
    pub refresh_warmup_limit: usize,

    #[serde(default)]
    pub relay_base_url: Option<String>,
    #[serde(default = "default_relay_api_version")]
    pub relay_api_version: u32,
    #[serde(default)]
    pub relay_auth_token: Option<String>,
    #[serde(default = "default_relay_startup_check")]
    pub relay_startup_check: StartupCheckMode,
    #[serde(default = "default_relay_max_items")]
    pub relay_max_items: u64,
    #[serde(default = "default_relay_max_request_bytes")]
    pub relay_max_request_bytes: u64,
    #[serde(default = "default_relay_per_item_max_wire_bytes")]
    pub relay_per_item_max_wire_bytes: u64,
    #[serde(default = "default_relay_max_response_bytes")]
    pub relay_max_response_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            max_inflight: default_max_inflight(),
            udp_max_workers: 0,
            upstream_transport: default_upstream_transport(),
            upstream_host: default_upstream_host(),
            upstream_port: default_upstream_port(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            min_ttl: 0,
            max_ttl: default_max_ttl(),
            negative_ttl: default_negative_ttl(),
            serve_stale_max: default_serve_stale_max(),
            cache_max_entries: 0,
            tcp_pool_max_conns: default_tcp_pool_max_conns(),
            tcp_pool_idle_timeout_ms: default_tcp_pool_idle_timeout_ms(),
            tcp_max_message_size: default_tcp_max_message_size(),
            refresh_enabled: false,
            refresh_ahead_seconds: default_refresh_ahead_seconds(),
            refresh_popularity_threshold: default_refresh_popularity_threshold(),
            refresh_popularity_decay_seconds: 0,
            refresh_tick_ms: default_refresh_tick_ms(),
            refresh_batch_size: default_refresh_batch_size(),
            refresh_concurrency: default_refresh_concurrency(),
            refresh_queue_max: default_refresh_queue_max(),
            refresh_warmup_path: None,
            refresh_warmup_limit: default_refresh_warmup_limit(),
            relay_base_url: None,
            relay_api_version: default_relay_api_version(),
            relay_auth_token: None,
            relay_startup_check: default_relay_startup_check(),
            relay_max_items: default_relay_max_items(),
            relay_max_request_bytes: default_relay_max_request_bytes(),
            relay_per_item_max_wire_bytes: default_relay_per_item_max_wire_bytes(),
            relay_max_response_bytes: default_relay_max_response_bytes(),
        }
    }
}

impl Config {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy {
            min_ttl: Duration::from_secs(self.min_ttl),
            max_ttl: Duration::from_secs(self.max_ttl),
            negative_ttl: Duration::from_secs(self.negative_ttl),
            serve_stale_max: Duration::from_secs(self.serve_stale_max),
        }
    }

    pub fn refresh_gate(&self) -> RefreshGate {
        RefreshGate {
            ahead: Duration::from_secs(self.refresh_ahead_seconds),
            threshold: self.refresh_popularity_threshold,
            decay: Duration::from_secs(self.refresh_popularity_decay_seconds),
        }
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            gate: self.refresh_gate(),
            tick: Duration::from_millis(self.refresh_tick_ms),
            batch_size: self.refresh_batch_size,
            concurrency: self.refresh_concurrency,
        }
    }

    pub fn relay_limits(&self) -> RelayLimits {
        RelayLimits {
            max_items: self.relay_max_items,
            max_request_bytes: self.relay_max_request_bytes,
            per_item_max_wire_bytes: self.relay_per_item_max_wire_bytes,
            max_response_bytes: self.relay_max_response_bytes,
        }
    }

    pub fn relay_options(&self) -> Option<RelayOptions> {
        self.relay_base_url.as_ref().map(|base_url| RelayOptions {
            base_url: base_url.clone(),
            api_version: self.relay_api_version,
            auth_token: self.relay_auth_token.clone(),
            limits: self.relay_limits(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_host.trim().is_empty() {
            anyhow::bail!("listen_host must be non-empty");
        }
        if self.upstream_host.trim().is_empty() {
            anyhow::bail!("upstream_host must be non-empty");
        }
        if self.listen_port == 0 {
            anyhow::bail!("listen_port must be between 1 and 65535");
        }
        if self.upstream_port == 0 {
            anyhow::bail!("upstream_port must be between 1 and 65535");
        }
        if self.upstream_timeout_ms == 0 {
            anyhow::bail!("upstream_timeout_ms must be > 0");
        }
        if self.max_inflight == 0 {
            anyhow::bail!("max_inflight must be >= 1");
        }
        if self.min_ttl > self.max_ttl {
            anyhow::bail!("min_ttl must not exceed max_ttl");
        }
        if self.tcp_pool_idle_timeout_ms == 0 {
            anyhow::bail!("tcp_pool_idle_timeout_ms must be > 0");
        }
        if self.refresh_enabled {
            if self.refresh_tick_ms == 0 {
                anyhow::bail!("refresh_tick_ms must be > 0");
            }
            if self.refresh_batch_size == 0 {
                anyhow::bail!("refresh_batch_size must be >= 1");
            }
            if self.refresh_concurrency == 0 {
                anyhow::bail!("refresh_concurrency must be >= 1");
            }
            if self.refresh_queue_max == 0 {
                anyhow::bail!("refresh_queue_max must be >= 1");
            }
        }

        if self.upstream_transport == UpstreamTransport::Relay && self.relay_base_url.is_none() {
            anyhow::bail!("upstream_transport=relay requires relay_base_url");
        }
        if let Some(base_url) = &self.relay_base_url {
            validate_relay_base_url(base_url)?;
            for (name, value) in self.relay_limits().named() {
                if value == 0 {
                    anyhow::bail!("relay_{name} must be > 0");
                }
            }
        }
        Ok(())
    }
}

fn validate_relay_base_url(base_url: &str) -> Result<()> {
    if base_url.trim() != base_url {
        anyhow::bail!("relay_base_url must not include surrounding whitespace");
    }
    if base_url.is_empty() {
        anyhow::bail!("relay_base_url must be non-empty");
    }
    let parsed = reqwest::Url::parse(base_url).context("relay_base_url is not a valid URL")?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            anyhow::bail!("relay_base_url must start with http:// or https://, got {other}://")
        }
    }
    if parsed.host_str().is_none() {
        anyhow::bail!("relay_base_url must include a host");
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        anyhow::bail!("relay_base_url must not include a querystring or fragment");
    }
    Ok(())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: Config = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    cfg.validate()?;
    info!(target = "config", path = %path.display(), "config loaded");
    Ok(cfg)
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    5353
}

fn default_max_inflight() -> usize {
    256
}

fn default_upstream_transport() -> UpstreamTransport {
    UpstreamTransport::Udp
}

fn default_upstream_host() -> String {
    "1.1.1.1".to_string()
}

fn default_upstream_port() -> u16 {
    53
}

fn default_upstream_timeout_ms() -> u64 {
    2000
}

fn default_max_ttl() -> u64 {
    86_400
}

fn default_negative_ttl() -> u64 {
    60
}

fn default_serve_stale_max() -> u64 {
    300
}

fn default_tcp_pool_max_conns() -> usize {
    4
}

fn default_tcp_pool_idle_timeout_ms() -> u64 {
    30_000
}

fn default_tcp_max_message_size() -> usize {
    65_535
}

fn default_refresh_ahead_seconds() -> u64 {
    30
}

fn default_refresh_popularity_threshold() -> u64 {
    5
}

fn default_refresh_tick_ms() -> u64 {
    500
}

fn default_refresh_batch_size() -> usize {
    50
}

fn default_refresh_concurrency() -> usize {
    5
}

fn default_refresh_queue_max() -> usize {
    1024
}

fn default_refresh_warmup_limit() -> usize {
    256
}

fn default_relay_api_version() -> u32 {
    1
}

fn default_relay_startup_check() -> StartupCheckMode {
    StartupCheckMode::Require
}

fn default_relay_max_items() -> u64 {
    32
}

fn default_relay_max_request_bytes() -> u64 {
    65_536
}

fn default_relay_per_item_max_wire_bytes() -> u64 {
    4_096
}

fn default_relay_max_response_bytes() -> u64 {
    262_144
}
