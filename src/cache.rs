use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tracing::debug;

use crate::fetch::PriceValue;

/// A cached price. Entries past `expires_at` are stale but are kept until
/// overwritten: a stale value is the graceful-degradation fallback when an
/// upstream is down.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub value: PriceValue,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntryStats {
    pub key: String,
    /// Seconds since the entry was written.
    pub age: u64,
    /// Remaining seconds of freshness; zero once expired.
    pub ttl: u64,
    pub expired: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub hit_rate: f64,
    pub entries: Vec<EntryStats>,
}

#[derive(Default)]
struct CacheInner {
    store: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    sets: u64,
}

/// In-memory TTL cache over the closed key set. Every write draws an
/// independent TTL uniformly from `[ttl_min, ttl_max]`, de-synchronising
/// refreshes across keys and across restarts.
///
/// Operations never suspend; the store is guarded by a std mutex and no
/// lock is held across an await point anywhere in the crate.
pub struct PriceCache {
    inner: Mutex<CacheInner>,
    ttl_min: Duration,
    ttl_max: Duration,
}

impl PriceCache {
    pub fn new(ttl_min: Duration, ttl_max: Duration) -> Self {
        PriceCache {
            inner: Mutex::new(CacheInner::default()),
            ttl_min,
            ttl_max,
        }
    }

    pub fn set(&self, key: &str, value: PriceValue) {
        self.set_at(key, value, Instant::now());
    }

    fn set_at(&self, key: &str, value: PriceValue, now: Instant) {
        let ttl = self.draw_ttl();
        let mut inner = self.inner.lock().unwrap();
        inner.store.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: now,
                expires_at: now + ttl,
            },
        );
        inner.sets += 1;
        debug!(key, ttl_secs = ttl.as_secs(), "cache entry written");
    }

    fn draw_ttl(&self) -> Duration {
        if self.ttl_min >= self.ttl_max {
            return self.ttl_min;
        }
        let span_ms = (self.ttl_max - self.ttl_min).as_millis() as u64;
        let offset = rand::thread_rng().gen_range(0..=span_ms);
        self.ttl_min + Duration::from_millis(offset)
    }

    /// Fresh value or miss. A miss on an expired entry does not evict it.
    pub fn get(&self, key: &str) -> Option<PriceValue> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<PriceValue> {
        let mut inner = self.inner.lock().unwrap();
        match inner.store.get(key) {
            Some(entry) if entry.is_fresh_at(now) => {
                let value = entry.value.clone();
                inner.hits += 1;
                Some(value)
            }
            _ => {
                inner.misses += 1;
                None
            }
        }
    }

    /// The entry regardless of expiry; the stale-fallback path.
    pub fn get_raw(&self, key: &str) -> Option<CacheEntry> {
        self.inner.lock().unwrap().store.get(key).cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        self.has_at(key, Instant::now())
    }

    fn has_at(&self, key: &str, now: Instant) -> bool {
        self.inner
            .lock()
            .unwrap()
            .store
            .get(key)
            .is_some_and(|entry| entry.is_fresh_at(now))
    }

    /// Zero for absent or expired entries.
    pub fn remaining_ttl(&self, key: &str) -> Duration {
        self.remaining_ttl_at(key, Instant::now())
    }

    fn remaining_ttl_at(&self, key: &str, now: Instant) -> Duration {
        self.inner
            .lock()
            .unwrap()
            .store
            .get(key)
            .map(|entry| entry.expires_at.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Snapshot of every `(key, entry)` pair, for the scheduler.
    pub fn entries(&self) -> Vec<(String, CacheEntry)> {
        self.inner
            .lock()
            .unwrap()
            .store
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// All values if every requested key is fresh, taken under a single
    /// lock so the fast path cannot observe a half-applied refresh or
    /// clear. Does not touch the hit/miss counters.
    pub fn snapshot_if_fresh(&self, keys: &[&str]) -> Option<Vec<(String, PriceValue)>> {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        keys.iter()
            .map(|&key| {
                inner
                    .store
                    .get(key)
                    .filter(|entry| entry.is_fresh_at(now))
                    .map(|entry| (key.to_string(), entry.value.clone()))
            })
            .collect()
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().unwrap().store.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().store.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.stats_at(Instant::now())
    }

    fn stats_at(&self, now: Instant) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<EntryStats> = inner
            .store
            .iter()
            .map(|(key, entry)| EntryStats {
                key: key.clone(),
                age: now.saturating_duration_since(entry.created_at).as_secs(),
                ttl: entry.expires_at.saturating_duration_since(now).as_secs(),
                expired: !entry.is_fresh_at(now),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let reads = inner.hits + inner.misses;
        let hit_rate = if reads == 0 {
            0.0
        } else {
            inner.hits as f64 / reads as f64
        };

        CacheStats {
            size: inner.store.len(),
            hits: inner.hits,
            misses: inner.misses,
            sets: inner.sets,
            hit_rate,
            entries,
        }
    }
}
