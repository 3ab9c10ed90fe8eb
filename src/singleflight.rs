use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use tokio::sync::oneshot;

use crate::cache::CacheKey;
use crate::metrics::Metrics;
use crate::upstream::UpstreamError;

pub type FlightResult = Result<Bytes, UpstreamError>;

type WaiterMap = DashMap<CacheKey, Vec<oneshot::Sender<FlightResult>>, FxBuildHasher>;

/// 按键合并并发的上游解析：第一个调用者成为 leader 并真正执行，
/// 其余调用者挂到等待列表，收到同一结果的副本。
/// Per-key coalescing of upstream work: the first caller leads and actually
/// runs; everyone else parks on a oneshot and receives a copy of the same
/// outcome, error classification included.
pub struct SingleFlight {
    inflight: WaiterMap,
    metrics: Arc<Metrics>,
}

/// Removes the map entry if the leader unwinds before publishing, so parked
/// waiters see a closed channel instead of hanging.
struct FlightGuard<'a> {
    inflight: &'a WaiterMap,
    key: &'a CacheKey,
    armed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inflight.remove(self.key);
        }
    }
}

impl SingleFlight {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            inflight: DashMap::with_hasher(FxBuildHasher::default()),
            metrics,
        }
    }

    /// Run `work` for this key, or join the run already in progress. The
    /// entry is removed before publication, so late arrivals start a new
    /// call rather than observing a completed one.
    pub async fn run<F, Fut>(&self, key: &CacheKey, work: F) -> FlightResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlightResult>,
    {
        let parked = match self.inflight.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let (tx, rx) = oneshot::channel();
                entry.get_mut().push(tx);
                Some(rx)
            }
            Entry::Vacant(entry) => {
                entry.insert(Vec::new());
                None
            }
        };

        if let Some(rx) = parked {
            self.metrics
                .singleflight_dedup_total
                .fetch_add(1, Ordering::Relaxed);
            return match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(UpstreamError::FlightAbandoned),
            };
        }

        let mut guard = FlightGuard {
            inflight: &self.inflight,
            key,
            armed: true,
        };
        let outcome = work().await;
        guard.armed = false;

        let waiters = self
            .inflight
            .remove(key)
            .map(|(_, waiters)| waiters)
            .unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(outcome.clone());
        }
        outcome
    }

    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn key() -> CacheKey {
        CacheKey::new("example.com", 1, 1)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flight = Arc::new(SingleFlight::new(Metrics::new()));
        let runs = Arc::new(AtomicU32::new(0));

        let tasks = (0..8)
            .map(|_| {
                let flight = Arc::clone(&flight);
                let runs = Arc::clone(&runs);
                async move {
                    flight
                        .run(&key(), || async {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(Bytes::from_static(b"answer"))
                        })
                        .await
                }
            })
            .collect::<Vec<_>>();

        let results = join_all(tasks).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.expect("outcome"), Bytes::from_static(b"answer"));
        }
        assert_eq!(
            flight.metrics.singleflight_dedup_total.load(Ordering::Relaxed),
            7
        );
        assert_eq!(flight.inflight_len(), 0);
    }

    #[tokio::test]
    async fn waiters_receive_the_leaders_error_kind() {
        let flight = Arc::new(SingleFlight::new(Metrics::new()));

        let leader = {
            let flight = Arc::clone(&flight);
            tokio::spawn(async move {
                flight
                    .run(&key(), || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(UpstreamError::UdpTimeout)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = flight
            .run(&key(), || async {
                panic!("follower must not run its own work");
            })
            .await;

        assert!(matches!(follower, Err(UpstreamError::UdpTimeout)));
        assert!(matches!(
            leader.await.expect("join"),
            Err(UpstreamError::UdpTimeout)
        ));
    }

    #[tokio::test]
    async fn sequential_calls_run_independently() {
        let flight = SingleFlight::new(Metrics::new());
        let runs = AtomicU32::new(0);

        for _ in 0..2 {
            let outcome = flight
                .run(&key(), || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(Bytes::from_static(b"x"))
                })
                .await;
            assert!(outcome.is_ok());
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(
            flight.metrics.singleflight_dedup_total.load(Ordering::Relaxed),
            0
        );
    }

    #[tokio::test]
    async fn distinct_keys_do_not_coalesce() {
        let flight = Arc::new(SingleFlight::new(Metrics::new()));
        let runs = Arc::new(AtomicU32::new(0));

        let tasks = ["a.example", "b.example"]
            .into_iter()
            .map(|name| {
                let flight = Arc::clone(&flight);
                let runs = Arc::clone(&runs);
                async move {
                    flight
                        .run(&CacheKey::new(name, 1, 1), || async {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(Bytes::from_static(b"y"))
                        })
                        .await
                }
            })
            .collect::<Vec<_>>();

        join_all(tasks).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
