use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use rustc_hash::FxBuildHasher;

use crate::metrics::Metrics;
use crate::proto::ResponseMeta;

/// 命中计数封顶，防止热点键溢出。
const HITS_CEILING: u64 = 1 << 31;

/// Canonical (qname, qtype, qclass) triple. The name is ASCII-lowercased
/// with the trailing root dot stripped, so lookups and inserts agree on
/// case and absolute form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub qname: Arc<str>,
    pub qtype: u16,
    pub qclass: u16,
}

impl CacheKey {
    pub fn new(qname: &str, qtype: u16, qclass: u16) -> Self {
        let trimmed = qname.trim_end_matches('.');
        let qname: Arc<str> = if trimmed.bytes().any(|b| b.is_ascii_uppercase()) {
            Arc::from(trimmed.to_ascii_lowercase())
        } else {
            Arc::from(trimmed)
        };
        Self {
            qname,
            qtype,
            qclass,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Full response message as received; recorded TTLs are aged on serve.
    pub wire: Bytes,
    pub negative: bool,
    pub inserted: Instant,
    pub ttl: Duration,
    pub stale_until: Instant,
    pub hits: u64,
    pub last_hit: Instant,
}

impl CacheEntry {
    fn remaining_ttl(&self, now: Instant) -> Duration {
        (self.inserted + self.ttl).saturating_duration_since(now)
    }

    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inserted)
    }

    fn is_fresh(&self, now: Instant) -> bool {
        !self.remaining_ttl(now).is_zero()
    }

    fn is_stale(&self, now: Instant) -> bool {
        !self.is_fresh(now) && now < self.stale_until
    }

    fn gate_allows(&self, now: Instant, gate: &RefreshGate) -> bool {
        let remaining = self.remaining_ttl(now);
        if remaining.is_zero() || remaining > gate.ahead {
            return false;
        }
        if self.hits < gate.threshold {
            return false;
        }
        if !gate.decay.is_zero() && now.saturating_duration_since(self.last_hit) > gate.decay {
            return false;
        }
        true
    }
}

/// Popularity/ttl gate for background refresh eligibility.
#[derive(Debug, Clone, Copy)]
pub struct RefreshGate {
    /// Refresh once the remaining TTL drops inside this window (but is > 0).
    pub ahead: Duration,
    /// Minimum hits since last insert.
    pub threshold: u64,
    /// Zero disables decay; otherwise the last hit must be this recent.
    pub decay: Duration,
}

/// TTL selection at insert time.
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    pub negative_ttl: Duration,
    pub serve_stale_max: Duration,
}

impl TtlPolicy {
    /// Positive replies: minimum RR TTL over answer+authority clamped to
    /// [min_ttl, max_ttl]. Negative replies: SOA MINIMUM capped by
    /// negative_ttl, or negative_ttl when no SOA is present (RFC 2308).
    fn effective_ttl(&self, meta: &ResponseMeta) -> Duration {
        if meta.is_negative() {
            return meta.soa_minimum.map_or(self.negative_ttl, |minimum| {
                Duration::from_secs(u64::from(minimum)).min(self.negative_ttl)
            });
        }
        let observed = Duration::from_secs(u64::from(meta.min_rr_ttl.unwrap_or(0)));
        observed.clamp(self.min_ttl, self.max_ttl)
    }
}

pub enum Lookup {
    Fresh(Hit),
    Stale(Hit),
    Miss,
}

pub struct Hit {
    pub wire: Bytes,
    pub age_secs: u64,
    /// Hit count including this hit; feeds the fresh-path refresh gate.
    pub hits: u64,
    pub remaining: Duration,
}

type Store = LruCache<CacheKey, CacheEntry, FxBuildHasher>;

/// Shared TTL/stale-aware cache. The store is a recency-ordered map under
/// one mutex; lookup and insert are O(1) and never touch I/O while holding
/// the lock. Capacity is enforced by our own two-phase eviction, so the
/// underlying map stays unbounded.
pub struct DnsCache {
    store: Mutex<Store>,
    max_entries: usize,
    policy: TtlPolicy,
    metrics: Arc<Metrics>,
}

impl DnsCache {
    pub fn new(max_entries: usize, policy: TtlPolicy, metrics: Arc<Metrics>) -> Self {
        Self {
            store: Mutex::new(LruCache::unbounded_with_hasher(FxBuildHasher::default())),
            max_entries,
            policy,
            metrics,
        }
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fresh and stale hits both count and both bump recency; a miss leaves
    /// any expired entry in place for eviction to reap.
    pub fn get(&self, key: &CacheKey, now: Instant) -> Lookup {
        let mut store = self.store();
        let Some(entry) = store.get_mut(key) else {
            return Lookup::Miss;
        };

        let fresh = entry.is_fresh(now);
        if !fresh && !entry.is_stale(now) {
            return Lookup::Miss;
        }

        entry.hits = (entry.hits + 1).min(HITS_CEILING);
        entry.last_hit = now;
        if entry.negative {
            self.metrics
                .negative_cache_hit_total
                .fetch_add(1, Ordering::Relaxed);
        }

        let hit = Hit {
            wire: entry.wire.clone(),
            age_secs: entry.age(now).as_secs(),
            hits: entry.hits,
            remaining: entry.remaining_ttl(now),
        };
        if fresh {
            Lookup::Fresh(hit)
        } else {
            Lookup::Stale(hit)
        }
    }

    /// Replace-or-insert; the hit count restarts with the new entry (a
    /// refresh is a replacement). Eviction runs on this path to keep the
    /// read path clean.
    pub fn put(&self, key: CacheKey, wire: Bytes, meta: &ResponseMeta, now: Instant) {
        let ttl = self.policy.effective_ttl(meta);
        let entry = CacheEntry {
            wire,
            negative: meta.is_negative(),
            inserted: now,
            ttl,
            stale_until: now + ttl + self.policy.serve_stale_max,
            hits: 0,
            last_hit: now,
        };

        let mut store = self.store();
        store.push(key, entry);
        self.evict_locked(&mut store, now);
        self.metrics
            .cache_entries
            .store(store.len() as u64, Ordering::Relaxed);
    }

    /// Two phases while over capacity: entries past their stale window go
    /// first (scanning from the least-recently-used end), then plain LRU.
    fn evict_locked(&self, store: &mut Store, now: Instant) {
        if self.max_entries == 0 || store.len() <= self.max_entries {
            return;
        }

        let expired: Vec<CacheKey> = store
            .iter()
            .rev()
            .filter(|(_, entry)| now >= entry.stale_until)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if store.len() <= self.max_entries {
                return;
            }
            if store.pop(&key).is_some() {
                self.metrics.evictions_total.fetch_add(1, Ordering::Relaxed);
            }
        }

        while store.len() > self.max_entries {
            if store.pop_lru().is_none() {
                break;
            }
            self.metrics.evictions_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop everything. In-flight resolutions repopulate the empty map.
    pub fn clear(&self) {
        let mut store = self.store();
        store.clear();
        self.metrics
            .cache_clears_total
            .fetch_add(1, Ordering::Relaxed);
        self.metrics.cache_entries.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.store().len()
    }

    /// Stable-order scan for the refresh ticker: least-recently-used first,
    /// recency untouched, expired entries excluded by the gate.
    pub fn refresh_candidates(&self, now: Instant, gate: &RefreshGate, max: usize) -> Vec<CacheKey> {
        let store = self.store();
        store
            .iter()
            .rev()
            .filter(|(_, entry)| entry.gate_allows(now, gate))
            .take(max)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Worker-side re-validation just before a refresh attempt, without
    /// promoting. An absent key proceeds (warmup preload, and queued jobs
    /// surviving a cache clear repopulate the empty map); an entry someone
    /// already refreshed (`remaining > ahead`) or one past its stale window
    /// is skipped.
    pub fn refresh_still_wanted(&self, key: &CacheKey, now: Instant, ahead: Duration) -> bool {
        let store = self.store();
        match store.peek(key) {
            None => true,
            Some(entry) => {
                let remaining = entry.remaining_ttl(now);
                if remaining > ahead {
                    false
                } else if remaining.is_zero() {
                    now < entry.stale_until
                } else {
                    true
                }
            }
        }
    }
}
