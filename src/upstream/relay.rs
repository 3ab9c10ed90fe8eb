use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::UpstreamError;
use crate::metrics::Metrics;

/// Client-side limits; must each be ≤ the relay's advertised limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RelayLimits {
    pub max_items: u64,
    pub max_request_bytes: u64,
    pub per_item_max_wire_bytes: u64,
    pub max_response_bytes: u64,
}

impl RelayLimits {
    pub(crate) fn named(&self) -> [(&'static str, u64); 4] {
        [
            ("max_items", self.max_items),
            ("max_request_bytes", self.max_request_bytes),
            ("per_item_max_wire_bytes", self.per_item_max_wire_bytes),
            ("max_response_bytes", self.max_response_bytes),
        ]
    }
}

pub struct RelayOptions {
    pub base_url: String,
    pub api_version: u32,
    pub auth_token: Option<String>,
    pub limits: RelayLimits,
}

#[derive(Serialize)]
struct BatchRequest {
    v: u32,
    id: String,
    items: Vec<BatchRequestItem>,
}

#[derive(Serialize)]
struct BatchRequestItem {
    id: String,
    q: String,
}

// Unknown fields are ignored by default, per the wire contract.
#[derive(Deserialize)]
struct BatchResponse {
    v: u32,
    #[allow(dead_code)]
    id: String,
    items: Vec<BatchResponseItem>,
}

#[derive(Deserialize)]
struct BatchResponseItem {
    id: String,
    ok: bool,
    #[serde(default)]
    a: Option<String>,
    #[serde(default)]
    err: Option<String>,
}

#[derive(Deserialize)]
struct RelayInfo {
    v: u32,
    limits: RelayLimits,
    #[serde(default)]
    auth_required: bool,
}

/// `{base}/v{n}/{leaf}` with any trailing slash on the base stripped.
fn endpoint(base: &str, version: u32, leaf: &str) -> String {
    format!("{}/v{}/{}", base.trim_end_matches('/'), version, leaf)
}

/// HTTPS batch forwarder. Every DNS query becomes a batch of exactly one
/// item; the schema supports more, but one item per request keeps deadlines
/// and error mapping per-query. Gzip is offered on both directions and size
/// limits apply to the decompressed bodies.
pub struct RelayUpstream {
    client: reqwest::Client,
    dns_url: String,
    info_url: String,
    api_version: u32,
    auth_token: Option<String>,
    limits: RelayLimits,
    request_seq: AtomicU64,
    metrics: Arc<Metrics>,
}

impl RelayUpstream {
    pub fn new(opts: RelayOptions, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build relay http client")?;
        Ok(Self {
            client,
            dns_url: endpoint(&opts.base_url, opts.api_version, "dns"),
            info_url: endpoint(&opts.base_url, opts.api_version, "info"),
            api_version: opts.api_version,
            auth_token: opts.auth_token,
            limits: opts.limits,
            request_seq: AtomicU64::new(1),
            metrics,
        })
    }

    pub async fn resolve(&self, wire: &[u8], deadline: Instant) -> Result<Bytes, UpstreamError> {
        if wire.len() as u64 > self.limits.per_item_max_wire_bytes {
            self.metrics
                .dropped_oversize_total
                .fetch_add(1, Ordering::Relaxed);
            return Err(UpstreamError::RelayTooLarge);
        }

        let request_id = self.request_seq.fetch_add(1, Ordering::Relaxed);
        let payload = BatchRequest {
            v: self.api_version,
            id: format!("q{request_id}"),
            items: vec![BatchRequestItem {
                id: "0".to_string(),
                q: BASE64.encode(wire),
            }],
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|err| UpstreamError::RelayClient(format!("encode batch: {err}")))?;
        if body.len() as u64 > self.limits.max_request_bytes {
            self.metrics
                .dropped_oversize_total
                .fetch_add(1, Ordering::Relaxed);
            return Err(UpstreamError::RelayTooLarge);
        }

        let budget = deadline.saturating_duration_since(Instant::now());
        if budget.is_zero() {
            return Err(UpstreamError::RelayTimeout);
        }

        let mut request = self
            .client
            .post(&self.dns_url)
            .timeout(budget)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(map_transport_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(map_http_status(status.as_u16()));
        }

        // reqwest has already transparently decompressed gzip bodies here.
        let raw = response.bytes().await.map_err(map_transport_err)?;
        if raw.len() as u64 > self.limits.max_response_bytes {
            return Err(UpstreamError::RelayTooLarge);
        }

        let batch: BatchResponse = serde_json::from_slice(&raw)
            .map_err(|err| UpstreamError::RelayClient(format!("decode batch: {err}")))?;
        if batch.v != self.api_version {
            return Err(UpstreamError::RelayProtocol(format!(
                "api version mismatch: relay answered v{}",
                batch.v
            )));
        }
        let item = batch
            .items
            .iter()
            .find(|item| item.id == "0")
            .ok_or_else(|| UpstreamError::RelayProtocol("response missing our item".into()))?;

        if !item.ok {
            return Err(match item.err.as_deref() {
                Some(code) => map_item_err(code),
                None => UpstreamError::RelayProtocol("error item missing err code".into()),
            });
        }

        let answer = item
            .a
            .as_deref()
            .ok_or_else(|| UpstreamError::RelayProtocol("ok item missing payload".into()))?;
        let decoded = BASE64
            .decode(answer)
            .map_err(|_| UpstreamError::RelayProtocol("ok item payload is not valid base64".into()))?;
        Ok(Bytes::from(decoded))
    }

    /// One-time `GET /v{n}/info` before the listeners bind. Errors are
    /// fatal or logged depending on the configured startup-check mode;
    /// that policy lives with the caller.
    pub async fn startup_check(&self, timeout: Duration) -> anyhow::Result<()> {
        let mut request = self
            .client
            .get(&self.info_url)
            .timeout(timeout)
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("relay info endpoint unreachable: {}", self.info_url))?;
        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            anyhow::bail!("relay auth failed: missing or invalid Authorization token");
        }
        if !status.is_success() {
            anyhow::bail!("relay info endpoint returned HTTP {status}");
        }

        let raw = response.bytes().await.context("read relay info body")?;
        if raw.len() as u64 > self.limits.max_response_bytes {
            anyhow::bail!(
                "relay info response exceeds max_response_bytes (client={})",
                self.limits.max_response_bytes
            );
        }

        let info: RelayInfo =
            serde_json::from_slice(&raw).context("relay info returned invalid JSON")?;
        if info.v != self.api_version {
            anyhow::bail!(
                "relay API version mismatch (client={}, relay={})",
                self.api_version,
                info.v
            );
        }
        if info.auth_required && self.auth_token.is_none() {
            anyhow::bail!("relay requires authentication but no token is configured");
        }

        let mut mismatches = Vec::new();
        for ((name, ours), (_, theirs)) in
            self.limits.named().into_iter().zip(info.limits.named())
        {
            if theirs == 0 {
                anyhow::bail!("relay info limit '{name}' must be > 0");
            }
            if ours > theirs {
                mismatches.push(format!("{name} (client={ours}, relay={theirs})"));
            }
        }
        if !mismatches.is_empty() {
            anyhow::bail!("relay limits incompatible: {}", mismatches.join(", "));
        }
        Ok(())
    }
}

fn map_transport_err(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() || err.is_connect() {
        UpstreamError::RelayTimeout
    } else {
        UpstreamError::RelayClient(err.to_string())
    }
}

fn map_http_status(status: u16) -> UpstreamError {
    match status {
        401 | 403 => UpstreamError::RelayUnauthorized,
        400..=499 => UpstreamError::RelayClient(format!("relay returned HTTP {status}")),
        500..=599 => UpstreamError::RelayUpstream,
        _ => UpstreamError::RelayProtocol(format!("unexpected relay HTTP status {status}")),
    }
}

fn map_item_err(code: &str) -> UpstreamError {
    match code {
        "bad_request" | "protocol_error" => {
            UpstreamError::RelayProtocol(format!("relay flagged the batch: {code}"))
        }
        "upstream_error" => UpstreamError::RelayUpstream,
        "timeout" => UpstreamError::RelayTimeout,
        "unauthorized" => UpstreamError::RelayUnauthorized,
        "too_large" => UpstreamError::RelayTooLarge,
        "rate_limited" => UpstreamError::RelayRateLimited,
        "internal_error" => UpstreamError::RelayInternal,
        other => UpstreamError::RelayProtocol(format!("unknown relay error code: {other}")),
    }
}
