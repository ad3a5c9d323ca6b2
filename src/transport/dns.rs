//! Cached resolver for the fronting domain
//!
//! A bounded LRU cache in front of the system resolver. The DC address
//! book carries IP literals, so this only serves the fronting host; a
//! DNS-over-HTTPS client can replace the lookup seam without touching the
//! cache or its metrics.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ProxyError, Result};

const DEFAULT_CACHE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsCacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

struct CacheEntry {
    addrs: Vec<SocketAddr>,
    expires_at: Instant,
}

pub struct Resolver {
    cache: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Resolver {
    pub fn new(cache_size: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(cache_size.max(1))
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CACHE_SIZE).expect("non-zero"));

        Self {
            cache: Mutex::new(LruCache::new(cap)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let key = format!("{host}:{port}");

        {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get(&key) {
                if entry.expires_at > Instant::now() {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.addrs.clone());
                }
                cache.pop(&key);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| ProxyError::DnsFailure {
                host: host.to_string(),
                source: e,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(ProxyError::DnsFailure {
                host: host.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "resolver returned no addresses",
                ),
            });
        }

        let mut cache = self.cache.lock();
        let evicted = cache.push(
            key,
            CacheEntry {
                addrs: addrs.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        if evicted.is_some_and(|(_, entry)| entry.expires_at > Instant::now()) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        Ok(addrs)
    }

    /// Resolve ahead of time so the first client does not pay the lookup
    /// latency.
    pub async fn warm_up(&self, host: &str, port: u16) {
        if let Err(e) = self.resolve(host, port).await {
            debug!(host = host, error = %e, "dns pre-warming failed");
        }
    }

    pub fn metrics(&self) -> DnsCacheMetrics {
        DnsCacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.cache.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_localhost_resolution_and_cache_hit() {
        let resolver = Resolver::new(16, Duration::from_secs(60));

        let first = resolver.resolve("localhost", 443).await.unwrap();
        assert!(!first.is_empty());

        let second = resolver.resolve("localhost", 443).await.unwrap();
        assert_eq!(first, second);

        let metrics = resolver.metrics();
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.size, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let resolver = Resolver::new(16, Duration::from_millis(1));

        resolver.resolve("localhost", 443).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        resolver.resolve("localhost", 443).await.unwrap();

        assert_eq!(resolver.metrics().misses, 2);
    }

    #[tokio::test]
    async fn test_ip_literal_resolves() {
        let resolver = Resolver::new(16, Duration::from_secs(60));
        let addrs = resolver.resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse().unwrap()]);
    }
}
