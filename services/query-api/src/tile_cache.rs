//! In-memory LRU cache for tile responses.
//!
//! Keys combine tile coordinate, variable, valid time and the store's
//! promotion stamp, so entries built from a replaced publication can never
//! be served after a re-promotion. The TTL only bounds entry lifetime on
//! top of that; expiry is lazy on read.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::sync::Mutex;

use pipeline_common::TileCoord;

/// A cached tile response body with its content type.
#[derive(Clone)]
pub struct CachedTile {
    pub content_type: &'static str,
    pub body: Bytes,
    inserted_at: Instant,
}

impl CachedTile {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() > ttl
    }
}

pub struct TileCache {
    entries: Mutex<LruCache<String, CachedTile>>,
    ttl: Duration,
}

impl TileCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn key(
        coord: &TileCoord,
        variable: &str,
        time: DateTime<Utc>,
        promoted_at: Option<DateTime<Utc>>,
    ) -> String {
        format!(
            "{}:{}:{}:{}",
            coord.cache_key(),
            variable,
            time.timestamp(),
            promoted_at.map(|p| p.timestamp_micros()).unwrap_or(0)
        )
    }

    pub async fn get(
        &self,
        coord: &TileCoord,
        variable: &str,
        time: DateTime<Utc>,
        promoted_at: Option<DateTime<Utc>>,
    ) -> Option<CachedTile> {
        let key = Self::key(coord, variable, time, promoted_at);
        let mut entries = self.entries.lock().await;
        match entries.get(&key) {
            Some(entry) if !entry.is_expired(self.ttl) => Some(entry.clone()),
            Some(_) => {
                entries.pop(&key);
                None
            }
            None => None,
        }
    }

    pub async fn put(
        &self,
        coord: &TileCoord,
        variable: &str,
        time: DateTime<Utc>,
        promoted_at: Option<DateTime<Utc>>,
        content_type: &'static str,
        body: Bytes,
    ) {
        let key = Self::key(coord, variable, time, promoted_at);
        let entry = CachedTile {
            content_type,
            body,
            inserted_at: Instant::now(),
        };
        self.entries.lock().await.put(key, entry);
    }
}
