//! Last-resort answer cache for the fallback chain.
//!
//! Bounded, insertion-ordered (FIFO eviction) and TTL'd lazily on lookup. Besides
//! exact lookups on the normalized query it can return the answer of the most
//! lexically similar cached query (Jaccard over word sets).

mod similarity;

pub use similarity::{jaccard, normalize, word_set};

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::CacheConfig;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: String,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// A hit from [`ResponseCache::find_similar`].
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarMatch {
    pub key: String,
    pub value: String,
    pub similarity: f64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Keys in insertion order; may hold keys already removed by expiry.
    order: VecDeque<String>,
}

impl CacheState {
    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }

    fn evict_oldest(&mut self) {
        while let Some(oldest) = self.order.pop_front() {
            if self.entries.remove(&oldest).is_some() {
                tracing::debug!(key = %oldest, "Evicted oldest cache entry");
                return;
            }
        }
    }
}

pub struct ResponseCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Exact lookup on the normalized query.
    pub fn get(&self, query: &str) -> Option<String> {
        let key = normalize(query);
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired = state
            .entries
            .get(&key)
            .map(|entry| entry.is_expired(now));
        let found = match expired {
            Some(true) => {
                state.remove(&key);
                None
            }
            Some(false) => state.entries.get(&key).map(|entry| entry.value.clone()),
            None => None,
        };

        self.count(found.is_some());
        found
    }

    /// Store `value` under the normalized query with the default TTL.
    pub fn insert(&self, query: &str, value: impl Into<String>) {
        self.put(query, value, self.config.ttl());
    }

    /// Store `value` under the normalized query.
    ///
    /// Re-inserting an existing key replaces its entry but keeps its place in
    /// the eviction order.
    pub fn put(&self, query: &str, value: impl Into<String>, ttl: Duration) {
        let key = normalize(query);
        if key.is_empty() {
            return;
        }

        let entry = CacheEntry {
            value: value.into(),
            inserted_at: Instant::now(),
            ttl,
        };

        let mut state = self.state.lock();
        if state.entries.contains_key(&key) {
            state.entries.insert(key, entry);
            return;
        }

        while state.entries.len() >= self.config.capacity.max(1) {
            state.evict_oldest();
        }
        state.order.push_back(key.clone());
        state.entries.insert(key, entry);
    }

    /// Answer of the most similar live entry, if its similarity is strictly
    /// above the configured threshold. Ties go to the older entry.
    pub fn find_similar(&self, query: &str) -> Option<SimilarMatch> {
        let normalized = normalize(query);
        let words = word_set(&normalized);
        if words.is_empty() {
            self.count(false);
            return None;
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        let mut expired = Vec::new();
        let mut best: Option<SimilarMatch> = None;

        for key in &state.order {
            let Some(entry) = state.entries.get(key) else {
                continue;
            };
            if entry.is_expired(now) {
                expired.push(key.clone());
                continue;
            }

            let similarity = jaccard(&words, &word_set(key));
            if similarity <= self.config.similarity_threshold {
                continue;
            }
            if best.as_ref().map_or(true, |b| similarity > b.similarity) {
                best = Some(SimilarMatch {
                    key: key.clone(),
                    value: entry.value.clone(),
                    similarity,
                });
            }
        }

        for key in expired {
            state.remove(&key);
        }

        self.count(best.is_some());
        best
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn count(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> ResponseCache {
        ResponseCache::new(CacheConfig {
            capacity,
            ttl_ms: 60_000,
            similarity_threshold: 0.6,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_then_get_within_ttl() {
        let cache = cache(10);
        cache.put("What is Rust?", "A systems language.", Duration::from_millis(5_000));

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert_eq!(
            cache.get("  what is rust?  ").as_deref(),
            Some("A systems language.")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_after_ttl_misses_and_purges() {
        let cache = cache(10);
        cache.put("ping", "pong", Duration::from_millis(1_000));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(cache.get("ping").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_eviction_at_capacity() {
        let cache = cache(2);
        cache.insert("first", "1");
        cache.insert("second", "2");
        cache.insert("third", "3");

        assert_eq!(cache.len(), 2);
        assert!(cache.get("first").is_none());
        assert_eq!(cache.get("second").as_deref(), Some("2"));
        assert_eq!(cache.get("third").as_deref(), Some("3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_keeps_position() {
        let cache = cache(2);
        cache.insert("first", "1");
        cache.insert("second", "2");
        cache.insert("FIRST", "one");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("first").as_deref(), Some("one"));

        // "first" is still the oldest insertion
        cache.insert("third", "3");
        assert!(cache.get("first").is_none());
        assert_eq!(cache.get("second").as_deref(), Some("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_similar_above_threshold() {
        let cache = cache(10);
        cache.insert("what is the weather today", "Sunny.");
        cache.insert("tell me a joke", "Knock knock.");

        let hit = cache
            .find_similar("What is the weather tomorrow")
            .expect("expected a near-duplicate hit");
        assert_eq!(hit.value, "Sunny.");
        assert_eq!(hit.key, "what is the weather today");
        assert!(hit.similarity > 0.6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_similar_rejects_at_or_below_threshold() {
        let cache = cache(10);
        cache.insert("what is the weather today", "Sunny.");
        // 2 shared words of 10 distinct
        assert!(cache.find_similar("what is your favourite colour of car").is_none());

        // Exactly 0.6 is not enough: 3 shared of 5 distinct
        cache.insert("a b c d", "x");
        assert!(cache.find_similar("a b c e").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_similar_picks_best_match() {
        let cache = cache(10);
        cache.insert("how do i reset my password now", "generic");
        cache.insert("how do i reset my password", "exact-ish");

        let hit = cache.find_similar("how do i reset my password please").unwrap();
        assert_eq!(hit.value, "exact-ish");
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_similar_skips_expired() {
        let cache = cache(10);
        cache.put("what is the weather today", "Sunny.", Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(cache.find_similar("what is the weather today please").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_and_miss_counters() {
        let cache = cache(10);
        cache.insert("a", "b");
        cache.get("a");
        cache.get("missing");
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }
}
