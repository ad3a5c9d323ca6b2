//! Proxy secret

use std::fmt;

use base64::Engine;
use zeroize::Zeroize;

use crate::error::{ProxyError, Result};

/// Secret tag announcing FakeTLS mode.
pub const TAG_FAKETLS: u8 = 0xee;

/// Secret tag announcing padded-intermediate mode; accepted for
/// compatibility, the proxy still requires FakeTLS on the wire.
pub const TAG_SECURE: u8 = 0xdd;

pub const SECRET_KEY_LEN: usize = 16;

const MAX_HOST_LEN: usize = 253;

/// Parsed proxy secret: a 16-byte key plus the SNI hostname clients must
/// present. The raw blob is `tag || key[16] || host`, hex or base64
/// encoded.
#[derive(Clone)]
pub struct Secret {
    pub key: [u8; SECRET_KEY_LEN],
    pub host: String,
}

impl Secret {
    /// Parse a secret from its textual form. Error messages never include
    /// the secret material.
    pub fn parse(encoded: &str) -> Result<Self> {
        let trimmed = encoded.trim();
        if trimmed.is_empty() {
            return Err(ProxyError::InvalidSecret("secret is empty".into()));
        }

        let blob = hex::decode(trimmed)
            .ok()
            .or_else(|| {
                base64::engine::general_purpose::URL_SAFE_NO_PAD
                    .decode(trimmed)
                    .ok()
            })
            .or_else(|| {
                base64::engine::general_purpose::STANDARD_NO_PAD
                    .decode(trimmed)
                    .ok()
            })
            .ok_or_else(|| {
                ProxyError::InvalidSecret("secret is neither hex nor base64".into())
            })?;

        Self::from_bytes(&blob)
    }

    pub fn from_bytes(blob: &[u8]) -> Result<Self> {
        if blob.len() <= 1 + SECRET_KEY_LEN {
            return Err(ProxyError::InvalidSecret(
                "secret is too short: tag, 16-byte key and hostname are required".into(),
            ));
        }

        match blob[0] {
            TAG_FAKETLS | TAG_SECURE => {}
            _ => {
                return Err(ProxyError::InvalidSecret(
                    "secret has an unsupported tag byte".into(),
                ))
            }
        }

        let mut key = [0u8; SECRET_KEY_LEN];
        key.copy_from_slice(&blob[1..1 + SECRET_KEY_LEN]);

        if key.iter().all(|&b| b == 0) {
            return Err(ProxyError::InvalidSecret("secret key is all zeroes".into()));
        }

        let host = std::str::from_utf8(&blob[1 + SECRET_KEY_LEN..])
            .map_err(|_| ProxyError::InvalidSecret("hostname is not valid UTF-8".into()))?
            .to_string();

        if host.is_empty() || host.len() > MAX_HOST_LEN {
            return Err(ProxyError::InvalidSecret(
                "hostname must be 1-253 bytes long".into(),
            ));
        }

        if !host
            .bytes()
            .all(|b| b.is_ascii_graphic())
        {
            return Err(ProxyError::InvalidSecret(
                "hostname contains non-printable characters".into(),
            ));
        }

        Ok(Self { key, host })
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

// Never leak key material through logs.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("key", &"[redacted]")
            .field("host", &self.host)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_blob() -> Vec<u8> {
        let mut blob = vec![TAG_FAKETLS];
        blob.extend_from_slice(&(0..16).collect::<Vec<u8>>());
        blob.extend_from_slice(b"example.com");
        blob
    }

    #[test]
    fn test_parse_hex() {
        let secret = Secret::parse(&hex::encode(sample_blob())).unwrap();
        assert_eq!(secret.host, "example.com");
        assert_eq!(secret.key[1], 1);
    }

    #[test]
    fn test_parse_base64() {
        let encoded =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sample_blob());
        let secret = Secret::parse(&encoded).unwrap();
        assert_eq!(secret.host, "example.com");
    }

    #[test]
    fn test_dd_tag_accepted() {
        let mut blob = sample_blob();
        blob[0] = TAG_SECURE;
        assert!(Secret::from_bytes(&blob).is_ok());
    }

    #[test]
    fn test_bad_tag_rejected() {
        let mut blob = sample_blob();
        blob[0] = 0x17;
        assert!(Secret::from_bytes(&blob).is_err());
    }

    #[test]
    fn test_zero_key_rejected() {
        let mut blob = sample_blob();
        for b in &mut blob[1..17] {
            *b = 0;
        }
        assert!(Secret::from_bytes(&blob).is_err());
    }

    #[test]
    fn test_missing_host_rejected() {
        let blob = sample_blob()[..17].to_vec();
        assert!(Secret::from_bytes(&blob).is_err());
    }

    #[test]
    fn test_error_does_not_echo_secret() {
        let err = Secret::parse("ZZZZ-definitely-not-a-secret").unwrap_err();
        assert!(!err.to_string().contains("ZZZZ"));
    }

    #[test]
    fn test_debug_redacts_key() {
        let secret = Secret::from_bytes(&sample_blob()).unwrap();
        let rendered = format!("{secret:?}");
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("01"));
    }
}
