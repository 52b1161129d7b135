//! Multi-tier cache (C4): pluggable eviction, TTL, and cross-tier promotion
//! (spec.md §4.4).
//!
//! `L1 ⊂ L2 ⊂ L3` by access-latency expectation. Reads search `L1 → L2 →
//! L3`; a hit below `L1` is promoted to `L1`. Writes always land in `L1`. A
//! single mutex guards every tier so promotion and eviction happen in the
//! same critical section as the triggering operation.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Fifo,
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    ttl: Option<Duration>,
    /// Monotonic insertion order, used as the LRU/FIFO tiebreak and the
    /// FIFO ordering key.
    sequence: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => self.created_at.elapsed() >= ttl,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TierStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Tier<K, V> {
    max_size: usize,
    policy: EvictionPolicy,
    default_ttl: Option<Duration>,
    entries: HashMap<K, CacheEntry<V>>,
    sequence: u64,
    stats: TierStats,
}

impl<K: Eq + Hash + Clone, V: Clone> Tier<K, V> {
    fn new(max_size: usize, policy: EvictionPolicy, default_ttl: Option<Duration>) -> Self {
        Self {
            max_size,
            policy,
            default_ttl,
            entries: HashMap::new(),
            sequence: 0,
            stats: TierStats {
                size: 0,
                max_size,
                ..Default::default()
            },
        }
    }

    /// Evict the TTL-expired entry for `key` if present; returns whether a
    /// miss should be reported because of expiry.
    fn reap_if_expired(&mut self, key: &K) -> bool {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                self.entries.remove(key);
                self.stats.size = self.entries.len();
                return true;
            }
        }
        false
    }

    fn get(&mut self, key: &K) -> Option<V> {
        self.reap_if_expired(key);
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed = Instant::now();
                entry.access_count += 1;
                self.stats.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    fn contains(&mut self, key: &K) -> bool {
        self.reap_if_expired(key);
        self.entries.contains_key(key)
    }

    fn victim(&self) -> Option<K> {
        match self.policy {
            EvictionPolicy::Lru => self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Fifo => self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.sequence)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Lfu => self
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.access_count, e.last_accessed))
                .map(|(k, _)| k.clone()),
        }
    }

    /// Inserts `value` under `key`, evicting a victim first if the tier is
    /// full and `key` isn't already present. Returns the evicted entry, if
    /// any, so the caller can demote it to the next tier.
    fn put(&mut self, key: K, value: V, ttl: Option<Duration>) -> Option<(K, V)> {
        let mut evicted = None;
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_size {
            if let Some(victim_key) = self.victim() {
                if let Some(victim) = self.entries.remove(&victim_key) {
                    self.stats.evictions += 1;
                    evicted = Some((victim_key, victim.value));
                }
            }
        }

        let now = Instant::now();
        self.sequence += 1;
        self.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                last_accessed: now,
                access_count: 0,
                ttl: ttl.or(self.default_ttl),
                sequence: self.sequence,
            },
        );
        self.stats.size = self.entries.len();
        evicted
    }

    fn delete(&mut self, key: &K) -> bool {
        let removed = self.entries.remove(key).is_some();
        self.stats.size = self.entries.len();
        removed
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.stats.size = 0;
    }
}

pub struct TierConfig {
    pub max_size: usize,
    pub policy: EvictionPolicy,
    pub default_ttl: Option<Duration>,
}

/// A multi-tier cache. Construct with one [`TierConfig`] per tier, ordered
/// `L1, L2, L3, ...`.
pub struct MultiTierCache<K, V> {
    tiers: Mutex<Vec<Tier<K, V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> MultiTierCache<K, V> {
    pub fn new(tier_configs: Vec<TierConfig>) -> Self {
        let tiers = tier_configs
            .into_iter()
            .map(|c| Tier::new(c.max_size, c.policy, c.default_ttl))
            .collect();
        Self {
            tiers: Mutex::new(tiers),
        }
    }

    /// Returns a deep copy of the value and whether it was a hit. A hit at
    /// tier > 0 is promoted into L1 within this same critical section.
    pub async fn get(&self, key: &K) -> (Option<V>, bool) {
        let mut tiers = self.tiers.lock().await;
        for i in 0..tiers.len() {
            if let Some(value) = tiers[i].get(key) {
                if i > 0 {
                    if let Some((evicted_key, evicted_value)) =
                        tiers[0].put(key.clone(), value.clone(), None)
                    {
                        Self::demote(&mut tiers, 1, evicted_key, evicted_value);
                    }
                }
                return (Some(value), true);
            }
        }
        (None, false)
    }

    /// Writes always land in L1; an evicted L1 victim demotes into L2, and
    /// so on down the tier chain.
    pub async fn put(&self, key: K, value: V, ttl: Option<Duration>) {
        let mut tiers = self.tiers.lock().await;
        if tiers.is_empty() {
            return;
        }
        if let Some((evicted_key, evicted_value)) = tiers[0].put(key, value, ttl) {
            Self::demote(&mut tiers, 1, evicted_key, evicted_value);
        }
    }

    fn demote(tiers: &mut [Tier<K, V>], start: usize, key: K, value: V) {
        if start >= tiers.len() {
            return;
        }
        if let Some((next_key, next_value)) = tiers[start].put(key, value, None) {
            Self::demote(tiers, start + 1, next_key, next_value);
        }
    }

    pub async fn contains(&self, key: &K) -> bool {
        let mut tiers = self.tiers.lock().await;
        for tier in tiers.iter_mut() {
            if tier.contains(key) {
                return true;
            }
        }
        false
    }

    pub async fn delete(&self, key: &K) {
        let mut tiers = self.tiers.lock().await;
        for tier in tiers.iter_mut() {
            tier.delete(key);
        }
    }

    pub async fn clear(&self) {
        let mut tiers = self.tiers.lock().await;
        for tier in tiers.iter_mut() {
            tier.clear();
        }
    }

    pub async fn stats(&self) -> Vec<TierStats> {
        let tiers = self.tiers.lock().await;
        tiers.iter().map(|t| t.stats.clone()).collect()
    }
}
