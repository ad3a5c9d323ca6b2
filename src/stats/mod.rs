//! Statistics

pub mod antireplay;

pub use antireplay::{AntiReplayMetrics, ReplayChecker};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Process-wide counters bumped from the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Counter {
    /// Accepted connections, before any validation.
    Connects = 0,
    /// Connections that failed FakeTLS or Obfuscated2.
    BadClients = 1,
    /// Handshakes killed by the deadline.
    HandshakeTimeouts = 2,
    /// Connections spliced to the fronting domain.
    Fronted = 3,
}

const COUNTER_SLOTS: usize = 4;

/// Direction of relayed bytes, relative to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    FromClient,
    ToClient,
}

#[derive(Default)]
struct DcTraffic {
    sessions: AtomicU64,
    active: AtomicU64,
    octets_from_client: AtomicU64,
    octets_to_client: AtomicU64,
}

/// Thread-safe process statistics.
pub struct Stats {
    started_at: Instant,
    counters: [AtomicU64; COUNTER_SLOTS],
    per_dc: DashMap<i16, DcTraffic>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            counters: Default::default(),
            per_dc: DashMap::new(),
        }
    }

    pub fn count(&self, counter: Counter) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    /// Open a relayed DC session. The returned guard keeps the active
    /// gauge up; dropping it retires the session.
    pub fn begin_dc_session(self: &Arc<Self>, dc: i16) -> DcSessionGuard {
        let traffic = self.per_dc.entry(dc).or_default();
        traffic.sessions.fetch_add(1, Ordering::Relaxed);
        traffic.active.fetch_add(1, Ordering::Relaxed);
        drop(traffic);

        DcSessionGuard {
            stats: Arc::clone(self),
            dc,
        }
    }

    pub fn add_octets(&self, dc: i16, direction: Direction, bytes: u64) {
        let traffic = self.per_dc.entry(dc).or_default();
        let cell = match direction {
            Direction::FromClient => &traffic.octets_from_client,
            Direction::ToClient => &traffic.octets_to_client,
        };
        cell.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn active_sessions(&self, dc: i16) -> u64 {
        self.per_dc
            .get(&dc)
            .map(|traffic| traffic.active.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn octets(&self, dc: i16, direction: Direction) -> u64 {
        self.per_dc
            .get(&dc)
            .map(|traffic| match direction {
                Direction::FromClient => traffic.octets_from_client.load(Ordering::Relaxed),
                Direction::ToClient => traffic.octets_to_client.load(Ordering::Relaxed),
            })
            .unwrap_or(0)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// RAII handle for one relayed DC session.
pub struct DcSessionGuard {
    stats: Arc<Stats>,
    dc: i16,
}

impl Drop for DcSessionGuard {
    fn drop(&mut self) {
        if let Some(traffic) = self.stats.per_dc.get(&self.dc) {
            traffic.active.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
