/// Bounded local cache backing channel reads when the backplane is unreachable
///
/// Capacity-bounded with least-recently-used eviction; every entry carries an
/// expiry so stale values are not served forever.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CachedValue {
    value: String,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct LocalCache {
    entries: LruCache<String, CachedValue>,
    default_ttl: Duration,
}

impl LocalCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            default_ttl,
        }
    }

    /// Insert or refresh an entry; `ttl` overrides the default expiry
    pub fn put(&mut self, key: &str, value: String, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        if let Some((evicted, _)) = self.entries.push(
            key.to_string(),
            CachedValue {
                value,
                expires_at: Instant::now() + ttl,
            },
        ) {
            if evicted != key {
                tracing::trace!(key = %evicted, "Evicted least recently used cache entry");
            }
        }
    }

    /// Fresh value for `key`, dropping it if expired
    pub fn get(&mut self, key: &str) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.pop(key);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
