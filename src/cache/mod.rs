//! Bounded multi-tier caches (spec §4.4).

pub mod key;
pub mod playlist;
pub mod segment;

pub use key::KeyCache;
pub use playlist::PlaylistCache;
pub use segment::SegmentCache;

use serde::Serialize;

/// Aggregate stats body for `GET /cache/stats` (spec §4.7).
#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub playlist_entries: usize,
    pub segment_entries: usize,
    pub segment_total_bytes: u64,
    pub key_entries: usize,
}

/// Owns all three cache tiers and exposes the stats/clear operations shared
/// by `/cache/stats` and `/cache/clear`.
pub struct Caches {
    pub playlists: PlaylistCache,
    pub segments: SegmentCache,
    pub keys: KeyCache,
}

impl Caches {
    pub fn new(config: &crate::config::CacheConfig) -> Self {
        Self {
            playlists: PlaylistCache::new(config.playlist_max_entries, config.playlist_ttl()),
            segments: SegmentCache::new(
                config.segment_max_items,
                config.segment_max_total_bytes,
                config.segment_max_item_bytes,
            ),
            keys: KeyCache::new(config.key_max_items),
        }
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            playlist_entries: self.playlists.len().await,
            segment_entries: self.segments.len().await,
            segment_total_bytes: self.segments.total_bytes().await,
            key_entries: self.keys.len().await,
        }
    }

    pub async fn clear(&self) {
        self.playlists.clear().await;
        self.segments.clear().await;
        self.keys.clear().await;
    }
}
