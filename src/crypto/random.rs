//! Process-wide secure random source

use rand::rngs::OsRng;
use rand::RngCore;

/// Cryptographically secure byte generator shared by every component that
/// needs randomness (handshake frames, welcome-packet padding, stream ids,
/// IP hash salt).
///
/// OS entropy failure aborts the process. Predictable output on any
/// key-generating path would silently void the transport encryption, so
/// there is no degraded mode.
pub struct SecureRandom;

impl SecureRandom {
    pub fn new() -> Self {
        Self
    }

    pub fn fill(&self, buf: &mut [u8]) {
        if let Err(e) = OsRng.try_fill_bytes(buf) {
            // No recovery possible: /dev/urandom (or equivalent) is gone.
            eprintln!("fatal: OS random source failed: {e}");
            std::process::abort();
        }
    }

    pub fn bytes(&self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.fill(&mut buf);
        buf
    }

    pub fn array<const N: usize>(&self) -> [u8; N] {
        let mut buf = [0u8; N];
        self.fill(&mut buf);
        buf
    }

    /// Uniform value in `[0, n)`.
    pub fn below(&self, n: u64) -> u64 {
        debug_assert!(n > 0);

        // Rejection sampling keeps the distribution uniform; the modulo
        // shortcut would bias small remainders for large n.
        let zone = u64::MAX - (u64::MAX % n);
        loop {
            let mut buf = [0u8; 8];
            self.fill(&mut buf);
            let v = u64::from_le_bytes(buf);
            if v < zone {
                return v % n;
            }
        }
    }

    /// Uniform value in `[lo, hi]`.
    pub fn between(&self, lo: u64, hi: u64) -> u64 {
        debug_assert!(lo <= hi);
        lo + self.below(hi - lo + 1)
    }
}

impl Default for SecureRandom {
    fn default() -> Self {
        Self::new()
    }
}
