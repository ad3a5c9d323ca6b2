//! Crypto primitives

mod random;

pub use random::SecureRandom;

use aes::cipher::{generic_array::GenericArray, KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type Ctr256 = ctr::Ctr128BE<aes::Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

/// Streaming AES-256-CTR state.
///
/// Both directions of an obfuscated connection keep their own instance;
/// the counter advances with every byte pushed through `apply_keystream`.
pub struct AesCtr {
    inner: Ctr256,
}

impl AesCtr {
    pub fn new(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Self {
        Self {
            inner: Ctr256::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            ),
        }
    }

    /// XOR `data` with the keystream in place, advancing the counter.
    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 over two concatenated chunks, avoiding an intermediate copy.
pub fn sha256_concat(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

pub fn hmac_sha256(key: &[u8], chunks: &[&[u8]]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    for chunk in chunks {
        mac.update(chunk);
    }
    mac.finalize().into_bytes().into()
}

/// Constant-time equality for digests. Never use `==` on anything derived
/// from the proxy secret.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes_ctr_roundtrip() {
        let key = [0x42u8; KEY_LEN];
        let iv = [0x24u8; IV_LEN];

        let plaintext = b"attack at dawn, bring snacks".to_vec();
        let mut data = plaintext.clone();

        AesCtr::new(&key, &iv).apply_keystream(&mut data);
        assert_ne!(data, plaintext);

        AesCtr::new(&key, &iv).apply_keystream(&mut data);
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_aes_ctr_streaming_matches_oneshot() {
        let key = [7u8; KEY_LEN];
        let iv = [9u8; IV_LEN];

        let mut oneshot = vec![0u8; 100];
        AesCtr::new(&key, &iv).apply_keystream(&mut oneshot);

        let mut streamed = vec![0u8; 100];
        let mut cipher = AesCtr::new(&key, &iv);
        for chunk in streamed.chunks_mut(17) {
            cipher.apply_keystream(chunk);
        }

        assert_eq!(oneshot, streamed);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn test_sha256_concat() {
        let joined = sha256(b"hello world");
        let split = sha256_concat(b"hello ", b"world");
        assert_eq!(joined, split);
    }
}
