//! `KeyCache`: plain LRU store for AES-128 keys (spec §4.4). Same shape as
//! `SegmentCache` minus the byte budget — keys are a handful of bytes each.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::Mutex;

pub struct KeyCache {
    cache: Mutex<LruCache<String, Arc<Vec<u8>>>>,
}

impl KeyCache {
    pub fn new(max_items: usize) -> Self {
        let cap = NonZeroUsize::new(max_items.max(1)).unwrap();
        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.cache.lock().await.get(key).cloned()
    }

    pub async fn put(&self, key: String, value: Vec<u8>) {
        self.cache.lock().await.put(key, Arc::new(value));
    }

    pub async fn clear(&self) {
        self.cache.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }
}
