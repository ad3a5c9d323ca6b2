//! Per-IP admission control

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::debug;

/// Token-bucket rate limiter keyed by source address.
///
/// The allow decision runs before any crypto work so a hostile source can
/// burn at most one map lookup per connection. The map is hard-capped:
/// once `max_entries` distinct sources are tracked, connections from new
/// sources are rejected without inserting anything.
pub struct RateLimiter {
    buckets: RwLock<HashMap<IpAddr, Arc<Mutex<TokenBucket>>>>,
    rate: f64,
    burst: f64,
    max_entries: usize,
    cleanup_interval: Duration,
    stop_tx: watch::Sender<bool>,
}

struct TokenBucket {
    tokens: f64,
    refilled_at: Instant,
    last_used: Instant,
}

impl TokenBucket {
    fn new(burst: f64) -> Self {
        let now = Instant::now();
        Self {
            tokens: burst,
            refilled_at: now,
            last_used: now,
        }
    }

    fn try_acquire(&mut self, rate: f64, burst: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.refilled_at = now;
        self.last_used = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl RateLimiter {
    /// `rate` is handshakes per second per address, `burst` the bucket
    /// depth. Callers gate on `rate > 0` themselves: a zero rate means the
    /// limiter is disabled and should not be constructed at all.
    pub fn new(rate: f64, burst: u32, max_entries: usize, cleanup_interval: Duration) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);

        let limiter = Arc::new(Self {
            buckets: RwLock::new(HashMap::new()),
            rate,
            burst: f64::from(burst),
            max_entries,
            cleanup_interval,
            stop_tx,
        });

        tokio::spawn(cleanup_loop(Arc::clone(&limiter), stop_rx));

        limiter
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        // Fast path: existing sources only need the read lock.
        if let Some(bucket) = self.buckets.read().get(&ip).cloned() {
            return bucket.lock().try_acquire(self.rate, self.burst);
        }

        // Slow path: escalate to the write lock, double-check after the
        // escalation window, then create the bucket.
        let mut buckets = self.buckets.write();
        if let Some(bucket) = buckets.get(&ip).cloned() {
            drop(buckets);
            return bucket.lock().try_acquire(self.rate, self.burst);
        }

        if buckets.len() >= self.max_entries {
            debug!(tracked = buckets.len(), "rate limiter at capacity, rejecting new source");
            return false;
        }

        let bucket = Arc::new(Mutex::new(TokenBucket::new(self.burst)));
        buckets.insert(ip, Arc::clone(&bucket));
        drop(buckets);

        let allowed = bucket.lock().try_acquire(self.rate, self.burst);
        allowed
    }

    pub fn size(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn evict_stale(&self) {
        let deadline = self.cleanup_interval * 2;
        let now = Instant::now();

        self.buckets
            .write()
            .retain(|_, bucket| now.duration_since(bucket.lock().last_used) <= deadline);
    }
}

async fn cleanup_loop(limiter: Arc<RateLimiter>, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(limiter.cleanup_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // immediate first tick

    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = ticker.tick() => limiter.evict_stale(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_burst_then_reject() {
        let limiter = RateLimiter::new(1.0, 3, 1000, Duration::from_secs(60));
        let addr = ip("192.0.2.1");

        assert!(limiter.allow(addr));
        assert!(limiter.allow(addr));
        assert!(limiter.allow(addr));
        assert!(!limiter.allow(addr));

        limiter.stop();
    }

    #[tokio::test]
    async fn test_sources_are_independent() {
        let limiter = RateLimiter::new(1.0, 1, 1000, Duration::from_secs(60));

        assert!(limiter.allow(ip("192.0.2.1")));
        assert!(!limiter.allow(ip("192.0.2.1")));
        assert!(limiter.allow(ip("192.0.2.2")));

        limiter.stop();
    }

    #[tokio::test]
    async fn test_hard_cap_rejects_without_insert() {
        let limiter = RateLimiter::new(1.0, 10, 2, Duration::from_secs(60));

        assert!(limiter.allow(ip("192.0.2.1")));
        assert!(limiter.allow(ip("192.0.2.2")));
        assert_eq!(limiter.size(), 2);

        assert!(!limiter.allow(ip("192.0.2.3")));
        assert_eq!(limiter.size(), 2);

        // Known sources keep working at the cap.
        assert!(limiter.allow(ip("192.0.2.1")));

        limiter.stop();
    }

    #[tokio::test]
    async fn test_tokens_refill_over_time() {
        let limiter = RateLimiter::new(1000.0, 1, 1000, Duration::from_secs(60));
        let addr = ip("192.0.2.9");

        assert!(limiter.allow(addr));
        assert!(!limiter.allow(addr));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(limiter.allow(addr));

        limiter.stop();
    }

    #[tokio::test]
    async fn test_stale_entries_evicted() {
        let limiter = RateLimiter::new(1.0, 5, 1000, Duration::from_millis(10));
        assert!(limiter.allow(ip("192.0.2.77")));
        assert_eq!(limiter.size(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(limiter.size(), 0);

        limiter.stop();
    }

    #[tokio::test]
    async fn test_ipv6_keys() {
        let limiter = RateLimiter::new(1.0, 1, 1000, Duration::from_secs(60));
        assert!(limiter.allow(ip("2001:db8::1")));
        assert!(!limiter.allow(ip("2001:db8::1")));
        assert!(limiter.allow(ip("2001:db8::2")));

        limiter.stop();
    }
}
