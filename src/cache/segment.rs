//! `SegmentCache`: LRU + global byte budget (spec §4.4).
//!
//! Grounded in the `lru` crate usage pattern from
//! `other_examples/65cfeb6c_evanc577-livestream-dl__src-livestream-mod.rs.rs`
//! (an `LruCache` behind an async mutex) and the nested teacher crate's own
//! `lru = "0.16.1"` dependency. An item larger than `max_item_bytes` is
//! never cached — it still streams to the client (§3 invariant); eviction
//! beyond that is driven by LRU order and the total-byte budget, never TTL.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::Mutex;

struct Inner {
    cache: LruCache<String, Arc<Vec<u8>>>,
    total_bytes: u64,
    max_total_bytes: u64,
    max_item_bytes: u64,
}

pub struct SegmentCache {
    inner: Mutex<Inner>,
}

impl SegmentCache {
    pub fn new(max_items: usize, max_total_bytes: u64, max_item_bytes: u64) -> Self {
        let cap = NonZeroUsize::new(max_items.max(1)).unwrap();
        Self {
            inner: Mutex::new(Inner {
                cache: LruCache::new(cap),
                total_bytes: 0,
                max_total_bytes,
                max_item_bytes,
            }),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock().await;
        inner.cache.get(key).cloned()
    }

    /// Insert `value` under `key`. No-op (but not an error) if `value`
    /// exceeds `max_item_bytes` — the caller still streams it to the client,
    /// it just never lands in cache. Evicts least-recently-used entries
    /// until both the item-count cap and the byte budget are satisfied.
    pub async fn put(&self, key: String, value: Vec<u8>) {
        let size = value.len() as u64;
        let mut inner = self.inner.lock().await;
        if size > inner.max_item_bytes {
            tracing::debug!(
                "segment {key} ({size} bytes) exceeds max_item_bytes ({}), not caching",
                inner.max_item_bytes
            );
            return;
        }

        if let Some(old) = inner.cache.put(key, Arc::new(value)) {
            inner.total_bytes = inner.total_bytes.saturating_sub(old.len() as u64);
        }
        inner.total_bytes += size;

        while inner.total_bytes > inner.max_total_bytes {
            match inner.cache.pop_lru() {
                Some((_, evicted)) => {
                    inner.total_bytes = inner.total_bytes.saturating_sub(evicted.len() as u64);
                }
                None => break,
            }
        }
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.cache.clear();
        inner.total_bytes = 0;
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.cache.len()
    }

    pub async fn total_bytes(&self) -> u64 {
        self.inner.lock().await.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn items_over_max_item_bytes_are_not_cached() {
        let cache = SegmentCache::new(10, 1_000_000, 100);
        cache.put("seg".to_string(), vec![0u8; 200]).await;
        assert!(cache.get("seg").await.is_none());
        assert_eq!(cache.total_bytes().await, 0);
    }

    #[tokio::test]
    async fn total_bytes_never_exceeds_budget_across_many_puts() {
        let cache = SegmentCache::new(1000, 1000, 10_000);
        for i in 0..50 {
            cache.put(format!("seg{i}"), vec![0u8; 50]).await;
            assert!(cache.total_bytes().await <= 1000);
        }
    }

    #[tokio::test]
    async fn cache_hit_returns_previously_cached_bytes() {
        let cache = SegmentCache::new(10, 1_000_000, 1_000_000);
        cache.put("seg".to_string(), b"hello".to_vec()).await;
        let cached = cache.get("seg").await.unwrap();
        assert_eq!(&**cached, b"hello");
    }

    #[tokio::test]
    async fn lru_eviction_drops_least_recently_used_first() {
        let cache = SegmentCache::new(2, 1_000_000, 1_000_000);
        cache.put("a".to_string(), vec![1]).await;
        cache.put("b".to_string(), vec![2]).await;
        // touch "a" so "b" becomes the least-recently-used
        cache.get("a").await;
        cache.put("c".to_string(), vec![3]).await;
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn clear_resets_bytes_and_entries() {
        let cache = SegmentCache::new(10, 1_000_000, 1_000_000);
        cache.put("a".to_string(), vec![0u8; 100]).await;
        cache.clear().await;
        assert_eq!(cache.total_bytes().await, 0);
        assert_eq!(cache.len().await, 0);
    }
}
