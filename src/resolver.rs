use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, DnsCache, Lookup, RefreshGate};
use crate::metrics::Metrics;
use crate::proto;
use crate::refresh::{RefreshOutcome, RefreshQueue};
use crate::singleflight::{FlightResult, SingleFlight};
use crate::upstream::Upstream;

/// 解析核心：缓存命中 / serve-stale / 单飞合并 / 准入控制的编排。
/// The per-query orchestration: cache lookup, serve-fresh or
/// serve-stale+refresh, admission-gated single-flight miss resolution,
/// late-stale fallback, SERVFAIL.
#[derive(Clone)]
pub struct Resolver {
    cache: Arc<DnsCache>,
    upstream: Arc<Upstream>,
    flight: Arc<SingleFlight>,
    admission: Arc<Semaphore>,
    refresh: Arc<RefreshQueue>,
    metrics: Arc<Metrics>,
    upstream_timeout: Duration,
    /// Fresh hits inside this gate also schedule a refresh; None when the
    /// refresh machinery is disabled.
    fresh_gate: Option<RefreshGate>,
    refresh_txid: Arc<AtomicU16>,
}

impl Resolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<DnsCache>,
        upstream: Arc<Upstream>,
        refresh: Arc<RefreshQueue>,
        metrics: Arc<Metrics>,
        max_inflight: usize,
        upstream_timeout: Duration,
        fresh_gate: Option<RefreshGate>,
    ) -> Self {
        Self {
            cache,
            upstream,
            flight: Arc::new(SingleFlight::new(Arc::clone(&metrics))),
            admission: Arc::new(Semaphore::new(max_inflight.max(1))),
            refresh,
            metrics,
            upstream_timeout,
            fresh_gate,
            refresh_txid: Arc::new(AtomicU16::new(1)),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// One client query in, at most one reply out. `None` means no reply at
    /// all (malformed input).
    pub async fn handle_packet(&self, packet: &[u8]) -> Option<Bytes> {
        let mut name_buf = [0u8; 256];
        let Some(query) = proto::parse_query_quick(packet, &mut name_buf) else {
            self.metrics
                .dropped_malformed_total
                .fetch_add(1, Ordering::Relaxed);
            debug!(event = "query_malformed", len = packet.len(), "dropped without reply");
            return None;
        };
        self.metrics.queries_total.fetch_add(1, Ordering::Relaxed);

        let key = CacheKey::new(query.qname, query.qtype, query.qclass);
        let (tx_id, qtype, qclass) = (query.tx_id, query.qtype, query.qclass);
        let qname = Arc::clone(&key.qname);
        let start = Instant::now();

        match self.cache.get(&key, Instant::now()) {
            Lookup::Fresh(hit) => {
                self.metrics
                    .cache_hit_fresh_total
                    .fetch_add(1, Ordering::Relaxed);
                if let Some(gate) = &self.fresh_gate {
                    if hit.remaining <= gate.ahead && hit.hits >= gate.threshold {
                        self.refresh.enqueue(key);
                    }
                }
                info!(
                    event = "dns_response",
                    qname = %qname,
                    qtype = ?RecordType::from(qtype),
                    cache = "fresh",
                    latency_ms = start.elapsed().as_millis() as u64,
                    "served from cache"
                );
                return proto::rewrite_for_client(&hit.wire, tx_id, hit.age_secs);
            }
            Lookup::Stale(hit) => {
                self.metrics
                    .cache_hit_stale_total
                    .fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .swr_refresh_triggered_total
                    .fetch_add(1, Ordering::Relaxed);
                self.refresh.enqueue(key);
                info!(
                    event = "dns_response",
                    qname = %qname,
                    qtype = ?RecordType::from(qtype),
                    cache = "stale",
                    latency_ms = start.elapsed().as_millis() as u64,
                    "served stale, refresh scheduled"
                );
                return proto::rewrite_for_client(&hit.wire, tx_id, hit.age_secs);
            }
            Lookup::Miss => {}
        }
        self.metrics.cache_miss_total.fetch_add(1, Ordering::Relaxed);

        // Fail fast when saturated: no queueing, no blocking wait.
        let Ok(permit) = self.admission.try_acquire() else {
            self.metrics
                .dropped_max_inflight_total
                .fetch_add(1, Ordering::Relaxed);
            warn!(event = "admission_reject", qname = %qname, "max_inflight saturated");
            return proto::build_reply(tx_id, &qname, qtype, qclass, ResponseCode::ServFail);
        };
        let outcome = self.resolve_shared(&key, packet).await;
        drop(permit);

        match outcome {
            Ok(reply) => {
                info!(
                    event = "dns_response",
                    qname = %qname,
                    qtype = ?RecordType::from(qtype),
                    cache = "miss",
                    latency_ms = start.elapsed().as_millis() as u64,
                    "resolved upstream"
                );
                proto::rewrite_for_client(&reply, tx_id, 0)
            }
            Err(err) => {
                // Re-check: another flight may have repopulated the key
                // while ours was failing.
                if let Lookup::Stale(hit) = self.cache.get(&key, Instant::now()) {
                    self.metrics
                        .cache_hit_stale_total
                        .fetch_add(1, Ordering::Relaxed);
                    self.metrics
                        .swr_refresh_triggered_total
                        .fetch_add(1, Ordering::Relaxed);
                    self.refresh.enqueue(key);
                    warn!(
                        event = "serve_stale_late",
                        qname = %qname,
                        error = %err,
                        "upstream failed, serving stale"
                    );
                    return proto::rewrite_for_client(&hit.wire, tx_id, hit.age_secs);
                }
                err.record(&self.metrics);
                warn!(
                    event = "upstream_error",
                    transport = self.upstream.transport_name(),
                    qname = %qname,
                    error = %err,
                    "answering SERVFAIL"
                );
                proto::build_reply(tx_id, &qname, qtype, qclass, ResponseCode::ServFail)
            }
        }
    }

    /// The single shared upstream path: one flight per key, hard deadline,
    /// successful replies cached before publication. Used by foreground
    /// misses and background refresh alike.
    async fn resolve_shared(&self, key: &CacheKey, query_wire: &[u8]) -> FlightResult {
        self.flight
            .run(key, || async {
                self.metrics
                    .upstream_requests_total
                    .fetch_add(1, Ordering::Relaxed);
                let deadline = tokio::time::Instant::now() + self.upstream_timeout;
                let reply = self.upstream.resolve(query_wire, deadline).await?;
                let Some(meta) = proto::parse_response_meta(&reply) else {
                    return Err(self.upstream.malformed_reply_error());
                };
                self.cache
                    .put(key.clone(), reply.clone(), &meta, Instant::now());
                Ok(reply)
            })
            .await
    }

    /// Background refresh resolution. Failures never reach a client; a
    /// saturated admission gate skips the attempt rather than queueing it.
    pub async fn resolve_for_refresh(&self, key: &CacheKey) -> RefreshOutcome {
        let tx_id = self.refresh_txid.fetch_add(1, Ordering::Relaxed);
        let Some(query) = proto::build_query(tx_id, &key.qname, key.qtype, key.qclass) else {
            return RefreshOutcome::Fail;
        };
        let Ok(permit) = self.admission.try_acquire() else {
            debug!(event = "refresh_admission_skip", qname = %key.qname, "max_inflight saturated");
            return RefreshOutcome::Skipped;
        };
        let outcome = self.resolve_shared(key, &query).await;
        drop(permit);

        match outcome {
            Ok(_) => RefreshOutcome::Success,
            Err(err) => {
                err.record(&self.metrics);
                debug!(event = "refresh_upstream_error", qname = %key.qname, error = %err);
                RefreshOutcome::Fail
            }
        }
    }
}
