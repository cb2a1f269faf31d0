//! `PlaylistCache`: small, TTL-bounded store (spec §4.4).
//!
//! Keyed by `(url, canonicalised forwarded-header set)` (spec §3/§4.4) —
//! two requests for the same URL with different forwarded headers are
//! distinct entries. Never serves a stale entry; a periodic sweep (every
//! Nth request, driven by the caller) evicts expired entries in O(entries)
//! without blocking request handlers for longer than that.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::headers::HeaderParams;

#[derive(Debug, Clone)]
pub struct CachedPlaylist {
    pub body: String,
    pub content_type: &'static str,
}

struct Entry {
    value: CachedPlaylist,
    inserted_at: Instant,
}

pub struct PlaylistCache {
    max_entries: usize,
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry>>,
}

impl PlaylistCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn key(url: &str, headers: &HeaderParams) -> String {
        format!("{url}\0{}", headers.encode())
    }

    pub async fn get(&self, key: &str) -> Option<CachedPlaylist> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    pub async fn put(&self, key: String, value: CachedPlaylist) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            // Evict the single oldest entry to make room — this store is
            // small (≤200 entries per spec §4.4) so a linear scan is fine.
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest_key);
            }
        }
        entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop every expired entry. O(entries); safe to call from a request
    /// handler on every Nth request (spec §4.4).
    pub async fn remove_expired(&self) {
        let ttl = self.ttl;
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playlist(body: &str) -> CachedPlaylist {
        CachedPlaylist {
            body: body.to_string(),
            content_type: "application/vnd.apple.mpegurl",
        }
    }

    #[tokio::test]
    async fn different_forwarded_headers_are_distinct_entries() {
        let cache = PlaylistCache::new(200, Duration::from_secs(60));
        let mut headers_a = HeaderParams::new();
        headers_a.insert("Referer", "https://a.example/");
        let headers_b = HeaderParams::new();

        let key_a = PlaylistCache::key("https://x.example/chan.m3u8", &headers_a);
        let key_b = PlaylistCache::key("https://x.example/chan.m3u8", &headers_b);
        assert_ne!(key_a, key_b);

        cache.put(key_a.clone(), playlist("a")).await;
        cache.put(key_b.clone(), playlist("b")).await;

        assert_eq!(cache.get(&key_a).await.unwrap().body, "a");
        assert_eq!(cache.get(&key_b).await.unwrap().body, "b");
    }

    #[tokio::test]
    async fn expired_entries_are_never_served() {
        let cache = PlaylistCache::new(200, Duration::from_millis(10));
        let key = "k".to_string();
        cache.put(key.clone(), playlist("body")).await;
        assert!(cache.get(&key).await.is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn remove_expired_drops_only_stale_entries() {
        let cache = PlaylistCache::new(200, Duration::from_millis(10));
        cache.put("stale".to_string(), playlist("a")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.put("fresh".to_string(), playlist("b")).await;

        cache.remove_expired().await;
        assert_eq!(cache.len().await, 1);
        assert!(cache.get("fresh").await.is_some());
    }

    #[tokio::test]
    async fn clear_empties_the_store() {
        let cache = PlaylistCache::new(200, Duration::from_secs(60));
        cache.put("k".to_string(), playlist("body")).await;
        cache.clear().await;
        assert_eq!(cache.len().await, 0);
    }
}
