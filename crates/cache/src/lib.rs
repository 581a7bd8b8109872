//! lpx cache: bounded, optionally time-limited memoization per resource kind.
//!
//! [`Cache`] is the generic building block; [`ResourceCache`] holds one
//! instance per archive resource kind and fills misses from an
//! [`lpx_archive::ArchiveClient`].
//!
//! There is no single-flight guarantee. Two threads missing the same key may
//! both run `compute`; the last insert wins. Archive reads are idempotent so
//! this only costs an extra request.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::trace;

mod resource;

pub use resource::{CacheConfig, ResourceCache};

/// Time source for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant { Instant::now() }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self { Self { base: Instant::now(), offset: Mutex::new(Duration::ZERO) } }

    pub fn advance(&self, by: Duration) {
        let mut off = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *off += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self { Self::new() }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Size bound and optional age limit of one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub capacity: usize,
    /// Maximum age since insertion; `None` keeps entries until evicted
    pub ttl: Option<Duration>,
}

impl CachePolicy {
    pub fn lru(capacity: usize) -> Self { Self { capacity: capacity.max(1), ttl: None } }

    pub fn ttl(capacity: usize, ttl: Duration) -> Self { Self { capacity: capacity.max(1), ttl: Some(ttl) } }
}

struct Entry<V> {
    value: V,
    inserted: Instant,
}

struct Inner<K, V> {
    map: FxHashMap<K, Entry<V>>,
    /// Recency order, least recently used at the front
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }

    fn remove(&mut self, key: &K) {
        self.map.remove(key);
        self.order.retain(|k| k != key);
    }
}

/// Memoizing map with LRU eviction at capacity and optional per-entry expiry.
pub struct Cache<K, V> {
    kind: &'static str,
    policy: CachePolicy,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(kind: &'static str, policy: CachePolicy) -> Self {
        Self::with_clock(kind, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(kind: &'static str, policy: CachePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            kind,
            policy,
            clock,
            inner: Mutex::new(Inner { map: FxHashMap::default(), order: VecDeque::new() }),
        }
    }

    pub fn kind(&self) -> &'static str { self.kind }
    pub fn policy(&self) -> CachePolicy { self.policy }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        match self.policy.ttl {
            Some(ttl) => now.saturating_duration_since(entry.inserted) >= ttl,
            None => false,
        }
    }

    /// Live value for `key`, refreshing its recency.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let (value, stale) = match inner.map.get(key) {
            None => return None,
            Some(e) if self.expired(e, now) => (None, true),
            Some(e) => (Some(e.value.clone()), false),
        };
        if stale {
            inner.remove(key);
            counter!("lpx_cache_expired_total", 1u64, "cache" => self.kind);
        } else {
            inner.touch(key);
        }
        value
    }

    pub fn insert(&self, key: K, value: V) {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.map.contains_key(&key) {
            inner.touch(&key);
        } else {
            if inner.map.len() >= self.policy.capacity {
                self.make_room(&mut inner, now);
            }
            inner.order.push_back(key.clone());
        }
        inner.map.insert(key, Entry { value, inserted: now });
    }

    // Drop expired entries first; evict the least recently used one if still full.
    fn make_room(&self, inner: &mut Inner<K, V>, now: Instant) {
        if self.policy.ttl.is_some() {
            let dead: Vec<K> = inner
                .map
                .iter()
                .filter(|(_, e)| self.expired(e, now))
                .map(|(k, _)| k.clone())
                .collect();
            for k in &dead {
                inner.remove(k);
            }
        }
        while inner.map.len() >= self.policy.capacity {
            let Some(old) = inner.order.pop_front() else { break };
            inner.map.remove(&old);
            counter!("lpx_cache_evictions_total", 1u64, "cache" => self.kind);
        }
    }

    /// Return the live entry for `key`, or run `compute`, store and return its value.
    ///
    /// Errors from `compute` are passed through and nothing is cached. The
    /// lock is not held while `compute` runs.
    pub fn get_or_compute<E, F>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(v) = self.get(&key) {
            counter!("lpx_cache_hits_total", 1u64, "cache" => self.kind);
            return Ok(v);
        }
        counter!("lpx_cache_misses_total", 1u64, "cache" => self.kind);
        trace!(cache = self.kind, "miss");
        let value = compute()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn invalidate(&self, key: &K) { self.lock().remove(key); }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.map.clear();
        inner.order.clear();
    }

    /// Number of stored entries, expired ones included until they are touched.
    pub fn len(&self) -> usize { self.lock().map.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn compute_counting(calls: &Cell<usize>, v: u32) -> impl FnOnce() -> Result<u32, ()> + '_ {
        move || {
            calls.set(calls.get() + 1);
            Ok(v)
        }
    }

    #[test]
    fn hit_does_not_recompute() {
        let c: Cache<&str, u32> = Cache::new("t", CachePolicy::lru(4));
        let calls = Cell::new(0);
        assert_eq!(c.get_or_compute("a", compute_counting(&calls, 1)), Ok(1));
        assert_eq!(c.get_or_compute("a", compute_counting(&calls, 2)), Ok(1));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let c: Cache<u8, u8> = Cache::new("t", CachePolicy::lru(2));
        c.insert(1, 10);
        c.insert(2, 20);
        // 1 becomes most recently used; 2 is evicted next
        assert_eq!(c.get(&1), Some(10));
        c.insert(3, 30);
        assert_eq!(c.len(), 2);
        assert_eq!(c.get(&2), None);
        assert_eq!(c.get(&1), Some(10));
        assert_eq!(c.get(&3), Some(30));
    }

    #[test]
    fn errors_are_not_cached() {
        let c: Cache<u8, u8> = Cache::new("t", CachePolicy::lru(2));
        let r: Result<u8, &str> = c.get_or_compute(1, || Err("boom"));
        assert_eq!(r, Err("boom"));
        assert!(c.is_empty());
        assert_eq!(c.get_or_compute(1, || Ok::<_, &str>(5)), Ok(5));
    }

    #[test]
    fn expired_entries_are_dropped_before_lru_victims() {
        let clock = Arc::new(ManualClock::new());
        let c: Cache<u8, u8> = Cache::with_clock("t", CachePolicy::ttl(2, Duration::from_secs(60)), clock.clone());
        c.insert(1, 10);
        clock.advance(Duration::from_secs(45));
        c.insert(2, 20);
        clock.advance(Duration::from_secs(30));
        // 1 is expired, 2 is live; inserting 3 must keep 2
        c.insert(3, 30);
        assert_eq!(c.get(&2), Some(20));
        assert_eq!(c.get(&3), Some(30));
        assert_eq!(c.get(&1), None);
    }
}
