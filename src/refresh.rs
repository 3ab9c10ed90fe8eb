use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::{CacheKey, DnsCache, RefreshGate};
use crate::metrics::Metrics;
use crate::resolver::Resolver;

/// Queued → InFlight while a job lives; the entry disappears on completion,
/// which is what re-arms the key for the next enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Queued,
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Success,
    Fail,
    /// Dropped before an upstream attempt (entry gone, already refreshed,
    /// or admission saturated).
    Skipped,
}

/// Bounded refresh work channel with per-key dedup. Producers never block:
/// a duplicate key or a full channel drops the job on the floor and counts
/// it, nothing more.
pub struct RefreshQueue {
    tx: mpsc::Sender<CacheKey>,
    states: DashMap<CacheKey, JobState, FxBuildHasher>,
    metrics: Arc<Metrics>,
}

impl RefreshQueue {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> (Arc<Self>, mpsc::Receiver<CacheKey>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = Arc::new(Self {
            tx,
            states: DashMap::with_hasher(FxBuildHasher::default()),
            metrics,
        });
        (queue, rx)
    }

    /// Best-effort push. While a key is queued or in flight, re-enqueueing
    /// it is a no-op.
    pub fn enqueue(&self, key: CacheKey) -> bool {
        match self.states.entry(key.clone()) {
            Entry::Occupied(_) => {
                self.metrics
                    .refresh_dropped_duplicate_total
                    .fetch_add(1, Ordering::Relaxed);
                false
            }
            Entry::Vacant(slot) => match self.tx.try_send(key) {
                Ok(()) => {
                    slot.insert(JobState::Queued);
                    self.metrics
                        .refresh_enqueued_total
                        .fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(_) => {
                    self.metrics
                        .refresh_dropped_queue_full_total
                        .fetch_add(1, Ordering::Relaxed);
                    false
                }
            },
        }
    }

    fn mark_inflight(&self, key: &CacheKey) {
        self.states.insert(key.clone(), JobState::InFlight);
    }

    fn finish(&self, key: &CacheKey) {
        self.states.remove(key);
    }

    #[cfg(test)]
    fn pending_states(&self) -> usize {
        self.states.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshSettings {
    pub gate: RefreshGate,
    pub tick: Duration,
    pub batch_size: usize,
    pub concurrency: usize,
}

/// Spawn the scan ticker and the worker pool. Handles are aborted at
/// shutdown; whatever is still queued is dropped without an attempt.
pub fn spawn_refresh_tasks(
    settings: RefreshSettings,
    cache: Arc<DnsCache>,
    queue: Arc<RefreshQueue>,
    rx: mpsc::Receiver<CacheKey>,
    resolver: Resolver,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(settings.concurrency + 1);

    {
        let cache = Arc::clone(&cache);
        let queue = Arc::clone(&queue);
        let gate = settings.gate;
        let batch = settings.batch_size.max(1);
        let tick = settings.tick.max(Duration::from_millis(1));
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let picked = cache.refresh_candidates(Instant::now(), &gate, batch);
                if picked.is_empty() {
                    continue;
                }
                debug!(event = "refresh_scan", selected = picked.len());
                for key in picked {
                    queue.enqueue(key);
                }
            }
        }));
    }

    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    for worker_id in 0..settings.concurrency.max(1) {
        let rx = Arc::clone(&rx);
        let cache = Arc::clone(&cache);
        let queue = Arc::clone(&queue);
        let resolver = resolver.clone();
        let ahead = settings.gate.ahead;
        handles.push(tokio::spawn(async move {
            loop {
                let key = { rx.lock().await.recv().await };
                let Some(key) = key else {
                    return;
                };
                queue.mark_inflight(&key);
                let outcome = if cache.refresh_still_wanted(&key, Instant::now(), ahead) {
                    resolver.resolve_for_refresh(&key).await
                } else {
                    RefreshOutcome::Skipped
                };
                let counter = match outcome {
                    RefreshOutcome::Success => &resolver.metrics().refresh_success_total,
                    RefreshOutcome::Fail => &resolver.metrics().refresh_fail_total,
                    RefreshOutcome::Skipped => &resolver.metrics().refresh_skipped_total,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event = "refresh_done",
                    worker = worker_id,
                    qname = %key.qname,
                    outcome = ?outcome,
                );
                queue.finish(&key);
            }
        }));
    }

    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::test_support::{resolver_against, spawn_udp_fixture};

    fn a_key(name: &str) -> CacheKey {
        CacheKey::new(name, 1, 1)
    }

    fn settings(gate: RefreshGate) -> RefreshSettings {
        RefreshSettings {
            gate,
            tick: Duration::from_millis(10),
            batch_size: 16,
            concurrency: 2,
        }
    }

    async fn wait_until(mut probe: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !probe() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn requeueing_a_pending_key_is_a_noop() {
        let metrics = Metrics::new();
        let (queue, _rx) = RefreshQueue::new(16, metrics.clone());

        assert!(queue.enqueue(a_key("example.com")));
        assert!(!queue.enqueue(a_key("example.com")));
        assert_eq!(metrics.refresh_enqueued_total.load(Ordering::Relaxed), 1);
        assert_eq!(
            metrics.refresh_dropped_duplicate_total.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn full_queue_drops_silently() {
        let metrics = Metrics::new();
        let (queue, _rx) = RefreshQueue::new(1, metrics.clone());

        assert!(queue.enqueue(a_key("a.example")));
        assert!(!queue.enqueue(a_key("b.example")));
        assert_eq!(
            metrics.refresh_dropped_queue_full_total.load(Ordering::Relaxed),
            1
        );
        // The rejected key left no state behind and may be retried.
        assert_eq!(queue.pending_states(), 1);
    }

    #[tokio::test]
    async fn workers_resolve_enqueued_keys_and_rearm_them() {
        let upstream_addr = spawn_udp_fixture(Duration::ZERO, 300).await;
        let (resolver, env) = resolver_against(upstream_addr, 256, Duration::from_secs(1), None);

        let handles = spawn_refresh_tasks(
            settings(RefreshGate {
                ahead: Duration::from_secs(30),
                threshold: 1,
                decay: Duration::ZERO,
            }),
            Arc::clone(&env.cache),
            Arc::clone(&env.queue),
            env.take_rx(),
            resolver,
        );

        // Key absent from the cache: warmup-style preload.
        assert!(env.queue.enqueue(a_key("example.com")));
        wait_until(|| env.metrics.refresh_success_total.load(Ordering::Relaxed) == 1).await;
        assert_eq!(env.cache.len(), 1);
        wait_until(|| env.queue.pending_states() == 0).await;

        // Completed job re-arms the key.
        assert!(env.queue.enqueue(a_key("example.com")));

        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn scan_tick_feeds_popular_expiring_entries_to_the_workers() {
        let upstream_addr = spawn_udp_fixture(Duration::ZERO, 300).await;
        let (resolver, env) = resolver_against(upstream_addr, 256, Duration::from_secs(1), None);

        // Seed an entry and make it popular; with `ahead` wider than its
        // TTL the next scan selects it immediately.
        let meta = crate::proto::ResponseMeta {
            rcode: 0,
            answer_count: 1,
            min_rr_ttl: Some(300),
            soa_minimum: None,
        };
        let wire = crate::proto::tests::a_reply(1, "hot.example.", [192, 0, 2, 1], 300);
        let now = Instant::now();
        env.cache.put(a_key("hot.example"), wire.into(), &meta, now);
        let _ = env.cache.get(&a_key("hot.example"), now);

        let handles = spawn_refresh_tasks(
            settings(RefreshGate {
                ahead: Duration::from_secs(3600),
                threshold: 1,
                decay: Duration::ZERO,
            }),
            Arc::clone(&env.cache),
            Arc::clone(&env.queue),
            env.take_rx(),
            resolver,
        );

        wait_until(|| env.metrics.refresh_success_total.load(Ordering::Relaxed) >= 1).await;
        assert!(env.metrics.refresh_enqueued_total.load(Ordering::Relaxed) >= 1);

        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn failed_refresh_preserves_the_existing_entry() {
        // Upstream that never answers: every refresh attempt times out.
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let upstream_addr = silent.local_addr().expect("addr");
        let (resolver, env) =
            resolver_against(upstream_addr, 256, Duration::from_millis(80), None);

        let meta = crate::proto::ResponseMeta {
            rcode: 0,
            answer_count: 1,
            min_rr_ttl: Some(300),
            soa_minimum: None,
        };
        let wire = crate::proto::tests::a_reply(1, "keep.example.", [192, 0, 2, 2], 300);
        env.cache
            .put(a_key("keep.example"), wire.into(), &meta, Instant::now());

        let handles = spawn_refresh_tasks(
            settings(RefreshGate {
                ahead: Duration::from_secs(3600),
                threshold: 10_000, // scan never selects; we enqueue by hand
                decay: Duration::ZERO,
            }),
            Arc::clone(&env.cache),
            Arc::clone(&env.queue),
            env.take_rx(),
            resolver,
        );

        assert!(env.queue.enqueue(a_key("keep.example")));
        wait_until(|| env.metrics.refresh_fail_total.load(Ordering::Relaxed) == 1).await;
        assert_eq!(env.cache.len(), 1, "failed refresh must not evict");
        assert_eq!(
            env.metrics.upstream_udp_timeouts_total.load(Ordering::Relaxed),
            1
        );

        for handle in handles {
            handle.abort();
        }
    }
}
