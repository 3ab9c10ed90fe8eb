use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

/// 进程级计数器。Relaxed 自增即可，读端允许观察到轻微不一致的组合。
/// Process-wide counters. Relaxed increments are enough; readers may observe
/// slightly torn combinations.
#[derive(Debug, Default)]
pub struct Metrics {
    pub queries_total: AtomicU64,
    pub cache_hit_fresh_total: AtomicU64,
    pub cache_hit_stale_total: AtomicU64,
    pub cache_miss_total: AtomicU64,
    pub negative_cache_hit_total: AtomicU64,
    pub evictions_total: AtomicU64,
    pub cache_clears_total: AtomicU64,
    /// Gauge: current number of cache entries.
    pub cache_entries: AtomicU64,

    pub singleflight_dedup_total: AtomicU64,
    pub swr_refresh_triggered_total: AtomicU64,

    pub dropped_malformed_total: AtomicU64,
    pub dropped_max_inflight_total: AtomicU64,
    pub dropped_oversize_total: AtomicU64,

    pub refresh_enqueued_total: AtomicU64,
    pub refresh_dropped_duplicate_total: AtomicU64,
    pub refresh_dropped_queue_full_total: AtomicU64,
    pub refresh_success_total: AtomicU64,
    pub refresh_fail_total: AtomicU64,
    pub refresh_skipped_total: AtomicU64,
    pub refresh_warmup_loaded_total: AtomicU64,
    pub refresh_warmup_invalid_lines_total: AtomicU64,

    pub upstream_requests_total: AtomicU64,
    pub upstream_tcp_reuses_total: AtomicU64,

    pub upstream_udp_timeouts_total: AtomicU64,
    pub upstream_udp_errors_total: AtomicU64,
    pub upstream_tcp_timeouts_total: AtomicU64,
    pub upstream_tcp_connect_errors_total: AtomicU64,
    pub upstream_tcp_protocol_errors_total: AtomicU64,
    pub upstream_relay_timeouts_total: AtomicU64,
    pub upstream_relay_unauthorized_total: AtomicU64,
    pub upstream_relay_client_errors_total: AtomicU64,
    pub upstream_relay_upstream_errors_total: AtomicU64,
    pub upstream_relay_protocol_errors_total: AtomicU64,
    pub upstream_relay_too_large_total: AtomicU64,
    pub upstream_relay_rate_limited_total: AtomicU64,
    pub upstream_relay_internal_errors_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Read-only snapshot as (name, value) pairs, zero entries included.
    pub fn counters(&self) -> Vec<(&'static str, u64)> {
        macro_rules! read {
            ($($field:ident),+ $(,)?) => {
                vec![$((stringify!($field), self.$field.load(Ordering::Relaxed)),)+]
            };
        }
        read!(
            queries_total,
            cache_hit_fresh_total,
            cache_hit_stale_total,
            cache_miss_total,
            negative_cache_hit_total,
            evictions_total,
            cache_clears_total,
            cache_entries,
            singleflight_dedup_total,
            swr_refresh_triggered_total,
            dropped_malformed_total,
            dropped_max_inflight_total,
            dropped_oversize_total,
            refresh_enqueued_total,
            refresh_dropped_duplicate_total,
            refresh_dropped_queue_full_total,
            refresh_success_total,
            refresh_fail_total,
            refresh_skipped_total,
            refresh_warmup_loaded_total,
            refresh_warmup_invalid_lines_total,
            upstream_requests_total,
            upstream_tcp_reuses_total,
            upstream_udp_timeouts_total,
            upstream_udp_errors_total,
            upstream_tcp_timeouts_total,
            upstream_tcp_connect_errors_total,
            upstream_tcp_protocol_errors_total,
            upstream_relay_timeouts_total,
            upstream_relay_unauthorized_total,
            upstream_relay_client_errors_total,
            upstream_relay_upstream_errors_total,
            upstream_relay_protocol_errors_total,
            upstream_relay_too_large_total,
            upstream_relay_rate_limited_total,
            upstream_relay_internal_errors_total,
        )
    }

    /// One-line summary of every non-zero counter, for the periodic reporter
    /// and the shutdown log.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.counters() {
            if value == 0 {
                continue;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(name);
            out.push('=');
            out.push_str(&value.to_string());
        }
        if out.is_empty() {
            out.push_str("(no activity)");
        }
        out
    }
}

/// Log a counter summary once a minute, but only when something moved.
pub async fn periodic_reporter(metrics: Arc<Metrics>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last: Option<Vec<(&'static str, u64)>> = None;
    loop {
        ticker.tick().await;
        let current = metrics.counters();
        if last.as_ref() != Some(&current) {
            info!(event = "stats", "{}", metrics.summary());
            last = Some(current);
        }
    }
}
