//! Anti-replay cache
//!
//! A Stable Bloom Filter (Deng & Rafiei 2006): before every insert a fixed
//! number of random cells is reset, which keeps the false-positive rate
//! constant over an unbounded stream of session ids. Memory is fixed at
//! construction and inserts never allocate.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use twox_hash::XxHash64;

/// Default filter memory: 1 MiB of cells.
pub const DEFAULT_MAX_SIZE_BYTES: usize = 1024 * 1024;

/// Default target false-positive rate: 1%.
pub const DEFAULT_ERROR_RATE: f64 = 0.01;

/// Replay attack checker over FakeTLS session ids.
///
/// The digest was already authenticated by the HMAC check upstream, so a
/// non-cryptographic hash (xxhash) is sufficient for cell addressing.
pub struct ReplayChecker {
    filter: Mutex<StableBloomFilter>,

    // Metrics: atomic counters outside the filter mutex.
    total_checks: AtomicU64,
    replay_detected: AtomicU64,
    unique_messages: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AntiReplayMetrics {
    pub total_checks: u64,
    pub replay_detected: u64,
    pub unique_messages: u64,
    /// Percentage of checks that were replays, 0.0..=100.0.
    pub replay_rate: f64,
    /// Fraction of set cells, 0.0..=1.0.
    pub fill_ratio: f64,
}

impl ReplayChecker {
    /// `byte_size` is the cell memory (0 selects the 1 MiB default),
    /// `error_rate` the target false-positive rate (non-positive selects
    /// the 1% default).
    pub fn new(byte_size: usize, error_rate: f64) -> Self {
        let byte_size = if byte_size == 0 {
            DEFAULT_MAX_SIZE_BYTES
        } else {
            byte_size
        };
        let error_rate = if error_rate <= 0.0 {
            DEFAULT_ERROR_RATE
        } else {
            error_rate
        };

        Self {
            filter: Mutex::new(StableBloomFilter::new(byte_size, error_rate)),
            total_checks: AtomicU64::new(0),
            replay_detected: AtomicU64::new(0),
            unique_messages: AtomicU64::new(0),
        }
    }

    /// Atomically test and insert a digest. Returns true if it was already
    /// present: no false negatives for recently inserted items, false
    /// positives at the configured rate.
    pub fn seen_before(&self, digest: &[u8]) -> bool {
        self.total_checks.fetch_add(1, Ordering::Relaxed);

        let duplicate = self.filter.lock().test_and_add(digest);

        if duplicate {
            self.replay_detected.fetch_add(1, Ordering::Relaxed);
        } else {
            self.unique_messages.fetch_add(1, Ordering::Relaxed);
        }

        duplicate
    }

    pub fn metrics(&self) -> AntiReplayMetrics {
        let total_checks = self.total_checks.load(Ordering::Relaxed);
        let replay_detected = self.replay_detected.load(Ordering::Relaxed);
        let unique_messages = self.unique_messages.load(Ordering::Relaxed);

        let replay_rate = if total_checks > 0 {
            replay_detected as f64 / total_checks as f64 * 100.0
        } else {
            0.0
        };

        let fill_ratio = self.filter.lock().fill_ratio();

        AntiReplayMetrics {
            total_checks,
            replay_detected,
            unique_messages,
            replay_rate,
            fill_ratio,
        }
    }
}

struct StableBloomFilter {
    bits: Vec<u64>,
    /// Number of cells.
    m: u64,
    /// Hash functions per item.
    k: u32,
    /// Cells reset before each insert.
    p: u32,
    rng: SmallRng,
}

impl StableBloomFilter {
    fn new(byte_size: usize, error_rate: f64) -> Self {
        let m = (byte_size as u64) * 8;
        let k = optimal_k(error_rate);
        let p = stable_p(m, k, error_rate);

        Self {
            bits: vec![0u64; byte_size.div_ceil(8)],
            m,
            k,
            p,
            rng: SmallRng::from_entropy(),
        }
    }

    fn test_and_add(&mut self, data: &[u8]) -> bool {
        let (lower, upper) = hash_kernel(data);

        let mut member = true;
        for i in 0..self.k {
            let idx = index_of(lower, upper, i, self.m);
            if !self.get(idx) {
                member = false;
            }
        }

        // Random decay first, then set: an item inserted in this very call
        // cannot evict its own cells.
        for _ in 0..self.p {
            let idx = self.rng.gen_range(0..self.m);
            self.clear(idx);
        }

        for i in 0..self.k {
            let idx = index_of(lower, upper, i, self.m);
            self.set(idx);
        }

        member
    }

    fn fill_ratio(&self) -> f64 {
        let ones: u64 = self.bits.iter().map(|w| u64::from(w.count_ones())).sum();
        ones as f64 / self.m as f64
    }

    fn get(&self, idx: u64) -> bool {
        self.bits[(idx / 64) as usize] & (1u64 << (idx % 64)) != 0
    }

    fn set(&mut self, idx: u64) {
        self.bits[(idx / 64) as usize] |= 1u64 << (idx % 64);
    }

    fn clear(&mut self, idx: u64) {
        self.bits[(idx / 64) as usize] &= !(1u64 << (idx % 64));
    }
}

/// Double hashing: one xxhash64 pass yields the two 32-bit kernels that
/// generate all k indices.
fn hash_kernel(data: &[u8]) -> (u32, u32) {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    let sum = hasher.finish();
    (sum as u32, (sum >> 32) as u32)
}

fn index_of(lower: u32, upper: u32, i: u32, m: u64) -> u64 {
    (u64::from(lower).wrapping_add(u64::from(upper).wrapping_mul(u64::from(i)))) % m
}

fn optimal_k(error_rate: f64) -> u32 {
    let k = (1.0 / error_rate).log2().ceil() as u32;
    k.clamp(4, 6)
}

/// Eviction parameter P from the Stable Bloom Filter paper, specialised to
/// one-bit cells.
fn stable_p(m: u64, k: u32, error_rate: f64) -> u32 {
    let k = f64::from(k);
    let m = m as f64;

    let sub_denom = 1.0 - error_rate.powf(1.0 / k);
    let denom = (1.0 / sub_denom - 1.0) * (1.0 / k - 1.0 / m);
    let p = (1.0 / denom) as u32;

    p.max(1)
}
