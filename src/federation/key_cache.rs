//! Public Key Caching
//!
//! Caches fetched public keys to reduce remote requests.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::AppError;

/// Cached public key entry
#[derive(Debug, Clone)]
struct CachedKey {
    /// PEM-encoded public key
    pem: String,
    /// When this entry was cached
    cached_at: Instant,
}

/// Public key cache
///
/// Thread-safe TTL cache for remote actor public keys, keyed by keyId.
/// The lock is only held around map access, never across a fetch.
pub struct PublicKeyCache {
    cache: RwLock<HashMap<String, CachedKey>>,
    ttl: Duration,
}

impl PublicKeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    fn is_valid(&self, entry: &CachedKey) -> bool {
        entry.cached_at.elapsed() < self.ttl
    }

    /// Get a cached key, or run `fetch` and cache its result.
    pub async fn get_or_fetch<F, Fut>(&self, key_id: &str, fetch: F) -> Result<String, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, AppError>>,
    {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(key_id) {
                if self.is_valid(cached) {
                    tracing::debug!(key_id, "Public key cache hit");
                    return Ok(cached.pem.clone());
                }
                tracing::debug!(key_id, "Public key cache expired");
            }
        }

        tracing::debug!(key_id, "Public key cache miss, fetching");
        let pem = fetch().await?;

        self.cache.write().await.insert(
            key_id.to_string(),
            CachedKey {
                pem: pem.clone(),
                cached_at: Instant::now(),
            },
        );

        Ok(pem)
    }

    /// Invalidate a cached key
    pub async fn invalidate(&self, key_id: &str) {
        self.cache.write().await.remove(key_id);
        tracing::debug!(key_id, "Invalidated public key cache entry");
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.read().await;
        let total = cache.len();
        let valid = cache.values().filter(|v| self.is_valid(v)).count();

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
        }
    }

    /// Prune expired entries
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        let ttl = self.ttl;
        cache.retain(|_, v| v.cached_at.elapsed() < ttl);
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!("Pruned {} expired public key cache entries", removed);
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_second_lookup_is_served_from_cache() {
        let cache = PublicKeyCache::new(Duration::from_secs(60));
        let fetches = AtomicUsize::new(0);

        for _ in 0..2 {
            let pem = cache
                .get_or_fetch("key", || async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok("pem".to_string())
                })
                .await
                .unwrap();
            assert_eq!(pem, "pem");
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let cache = PublicKeyCache::new(Duration::from_secs(60));

        let result = cache
            .get_or_fetch("key", || async {
                Err(AppError::PublicKeyFetchFailed("down".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cache.stats().await.total_entries, 0);
    }

    #[tokio::test]
    async fn test_cache_expiry() {
        let cache = PublicKeyCache::new(Duration::from_millis(100));
        cache
            .get_or_fetch("test-key", || async { Ok("test-pem".to_string()) })
            .await
            .unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.valid_entries, 1);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let stats = cache.stats().await;
        assert_eq!(stats.expired_entries, 1);

        cache.prune_expired().await;
        let stats = cache.stats().await;
        assert_eq!(stats.total_entries, 0);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let cache = PublicKeyCache::new(Duration::from_secs(60));
        cache
            .get_or_fetch("key", || async { Ok("old".to_string()) })
            .await
            .unwrap();
        cache.invalidate("key").await;

        let pem = cache
            .get_or_fetch("key", || async { Ok("new".to_string()) })
            .await
            .unwrap();
        assert_eq!(pem, "new");
    }
}
