//! Per-DC connection pool

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::TcpStream;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections kept per DC.
    pub max_idle: usize,
    /// Must stay shorter than Telegram's own server-side idle timeout
    /// (~30 s) so we drop connections before the peer silently does.
    pub idle_timeout: Duration,
    /// Absolute connection age bound regardless of usage.
    pub max_age: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 5,
            idle_timeout: Duration::from_secs(20),
            max_age: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// The sweeper runs at half the idle timeout and no less often than
    /// every 5 seconds, so a stale entry cannot be handed to the next
    /// client after a pause.
    pub fn sweep_interval(&self) -> Duration {
        (self.idle_timeout / 2)
            .min(Duration::from_secs(5))
            .max(Duration::from_secs(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub dc: i16,
    pub hits: u64,
    pub misses: u64,
    pub created: u64,
    pub closed: u64,
    pub unhealthy: u64,
    pub idle: usize,
}

#[derive(Debug)]
struct IdleConn {
    stream: TcpStream,
    created_at: Instant,
    last_used: Instant,
}

impl IdleConn {
    /// Purely time-based: no zero-timeout read probing. Telegram closes
    /// idle connections without RST, so the socket looks fine until the
    /// first write; the pipeline covers that with a broken-pipe retry.
    fn is_healthy(&self, config: &PoolConfig) -> bool {
        let now = Instant::now();
        now.duration_since(self.last_used) < config.idle_timeout
            && now.duration_since(self.created_at) < config.max_age
    }
}

/// Bounded idle-connection pool for one DC.
#[derive(Debug)]
pub struct DcPool {
    dc: i16,
    config: PoolConfig,
    conns: Mutex<VecDeque<IdleConn>>,
    closed: AtomicBool,

    hits: AtomicU64,
    misses: AtomicU64,
    created: AtomicU64,
    closed_count: AtomicU64,
    unhealthy: AtomicU64,
}

impl DcPool {
    pub fn new(dc: i16, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            dc,
            config,
            conns: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            created: AtomicU64::new(0),
            closed_count: AtomicU64::new(0),
            unhealthy: AtomicU64::new(0),
        })
    }

    /// Take the first healthy idle connection, discarding expired ones
    /// along the way. `None` means the caller has to dial (a miss).
    pub fn get(&self) -> Option<(TcpStream, Instant)> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let mut conns = self.conns.lock();
        while let Some(conn) = conns.pop_front() {
            if conn.is_healthy(&self.config) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some((conn.stream, conn.created_at));
            }
            self.unhealthy.fetch_add(1, Ordering::Relaxed);
            // Dropping the stream closes the socket.
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Return a connection. It is closed instead of pooled when the pool
    /// is shut down, over capacity, or the connection fails the health
    /// predicate.
    pub fn put(&self, stream: TcpStream, created_at: Instant) {
        let conn = IdleConn {
            stream,
            created_at,
            last_used: Instant::now(),
        };

        if self.closed.load(Ordering::Acquire) || !conn.is_healthy(&self.config) {
            self.closed_count.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut conns = self.conns.lock();
        if conns.len() >= self.config.max_idle {
            self.closed_count.fetch_add(1, Ordering::Relaxed);
            return;
        }

        conns.push_back(conn);
    }

    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop expired idle entries.
    pub fn sweep(&self) {
        let mut conns = self.conns.lock();
        let before = conns.len();
        conns.retain(|conn| conn.is_healthy(&self.config));
        let removed = (before - conns.len()) as u64;
        if removed > 0 {
            self.unhealthy.fetch_add(removed, Ordering::Relaxed);
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut conns = self.conns.lock();
        self.closed_count
            .fetch_add(conns.len() as u64, Ordering::Relaxed);
        conns.clear();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            dc: self.dc,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            closed: self.closed_count.load(Ordering::Relaxed),
            unhealthy: self.unhealthy.load(Ordering::Relaxed),
            idle: self.conns.lock().len(),
        }
    }
}

/// A connection leased from a pool. Dropping it returns the connection;
/// `unwrap` detaches it once per-session cipher state makes reuse
/// impossible, after which dropping closes the socket.
#[derive(Debug)]
pub struct LeasedConn {
    stream: Option<TcpStream>,
    created_at: Instant,
    pool: Option<Arc<DcPool>>,
}

impl LeasedConn {
    pub fn pooled(stream: TcpStream, created_at: Instant, pool: Arc<DcPool>) -> Self {
        Self {
            stream: Some(stream),
            created_at,
            pool: Some(pool),
        }
    }

    /// Lease without a backing pool; dropping closes the socket.
    pub fn direct(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
            created_at: Instant::now(),
            pool: None,
        }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("leased connection already consumed")
    }

    /// Detach the socket from the pool. After an Obfuscated2 handshake the
    /// connection carries per-session cipher state and must never be
    /// reused, so Close has to mean close.
    pub fn unwrap(mut self) -> TcpStream {
        self.pool = None;
        self.stream.take().expect("leased connection already consumed")
    }

    /// Close the socket instead of returning it, for connections that
    /// failed mid-operation.
    pub fn force_close(mut self) {
        self.pool = None;
        self.stream.take();
    }
}

impl Drop for LeasedConn {
    fn drop(&mut self) {
        if let (Some(stream), Some(pool)) = (self.stream.take(), self.pool.take()) {
            pool.put(stream, self.created_at);
        }
    }
}
