//! IP privacy for logs

use std::net::IpAddr;
use std::sync::OnceLock;

use crate::crypto::{sha256_concat, SecureRandom};

const SALT_SIZE: usize = 32;

/// Hashes client addresses before they reach logs.
///
/// The salt is generated lazily on first use and lives only in memory, so
/// hashes correlate within one process lifetime and nothing else: a leaked
/// log cannot be joined across restarts or reversed with a rainbow table.
/// 48 bits of output keep collisions negligible for any realistic number
/// of clients a single process sees.
pub struct IpHasher {
    salt: OnceLock<[u8; SALT_SIZE]>,
}

impl IpHasher {
    pub fn new() -> Self {
        Self {
            salt: OnceLock::new(),
        }
    }

    /// 12 hex characters identifying `ip` within this process.
    pub fn hash(&self, ip: IpAddr) -> String {
        // SecureRandom aborts the process on entropy failure; an
        // unsalted hash of an IPv4 address is reversible by enumeration,
        // so falling back to no salt is not an option.
        let salt = self
            .salt
            .get_or_init(|| SecureRandom::new().array());

        let sum = match ip {
            IpAddr::V4(v4) => sha256_concat(salt, &v4.octets()),
            IpAddr::V6(v6) => sha256_concat(salt, &v6.octets()),
        };

        hex::encode(&sum[..6])
    }
}

impl Default for IpHasher {
    fn default() -> Self {
        Self::new()
    }
}
