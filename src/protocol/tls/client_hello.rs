//! FakeTLS ClientHello parsing and validation

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::crypto::{constant_time_eq, hmac_sha256};
use crate::error::{ProxyError, Result};

const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

const RANDOM_POS: usize = 6;
const RANDOM_LEN: usize = 32;
const SESSION_ID_LEN: usize = 32;

const EXTENSION_SNI: u16 = 0x0000;

/// Parsed FakeTLS ClientHello.
///
/// A valid hello carries an HMAC over the whole message (with the Random
/// field zeroed) in its Random field, XORed with 4 trailing bytes of
/// little-endian timestamp.
pub struct ClientHello {
    pub session_id: [u8; SESSION_ID_LEN],
    pub host: String,
    pub timestamp: u32,
    /// The digest-bearing Random exactly as it appeared on the wire; the
    /// welcome packet mixes it into its own authentication digest.
    pub wire_random: [u8; RANDOM_LEN],
}

impl ClientHello {
    /// Parse and authenticate a ClientHello handshake message (the payload
    /// of the first Handshake record). Any parse or authentication failure
    /// is reported as `InvalidHandshake`; the caller routes those to the
    /// fronting domain.
    pub fn parse(secret_key: &[u8], payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);

        if cursor.take_u8()? != HANDSHAKE_TYPE_CLIENT_HELLO {
            return Err(bad("not a client hello"));
        }

        let body_len = cursor.take_u24()? as usize;
        if body_len != payload.len() - 4 {
            return Err(bad("handshake length mismatch"));
        }

        cursor.skip(2)?; // legacy_version

        let random: [u8; RANDOM_LEN] = cursor
            .take(RANDOM_LEN)?
            .try_into()
            .expect("cursor returned requested length");

        let session_id_len = cursor.take_u8()? as usize;
        if session_id_len != SESSION_ID_LEN {
            return Err(bad("unexpected session id length"));
        }
        let session_id: [u8; SESSION_ID_LEN] = cursor
            .take(SESSION_ID_LEN)?
            .try_into()
            .expect("cursor returned requested length");

        let cipher_suites_len = cursor.take_u16()? as usize;
        cursor.skip(cipher_suites_len)?;

        let compression_len = cursor.take_u8()? as usize;
        cursor.skip(compression_len)?;

        let host = parse_sni(&mut cursor)?;

        // HMAC over the hello with the Random field zeroed, keyed by the
        // proxy secret. The client put this digest (XOR timestamp) where
        // the Random belongs.
        let mut zeroed = payload.to_vec();
        zeroed[RANDOM_POS..RANDOM_POS + RANDOM_LEN].fill(0);
        let digest = hmac_sha256(secret_key, &[zeroed.as_slice()]);

        let mut xored = [0u8; RANDOM_LEN];
        for (i, byte) in xored.iter_mut().enumerate() {
            *byte = digest[i] ^ random[i];
        }

        // First 28 bytes of the XOR must be zero; comparison must not leak
        // the matching prefix length.
        if !constant_time_eq(&xored[..28], &[0u8; 28]) {
            return Err(bad("digest mismatch"));
        }

        let timestamp = u32::from_le_bytes(
            xored[28..32].try_into().expect("4-byte slice"),
        );

        Ok(Self {
            session_id,
            host,
            timestamp,
            wire_random: random,
        })
    }

    /// Post-parse validation: SNI must match the configured host and the
    /// embedded timestamp must be within the tolerated skew.
    pub fn valid(&self, host: &str, tolerate_skew: Duration) -> Result<()> {
        if !self.host.eq_ignore_ascii_case(host) {
            return Err(bad("server name mismatch"));
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let ts = u64::from(self.timestamp);
        let skew = now.abs_diff(ts);

        if skew > tolerate_skew.as_secs() {
            return Err(bad("timestamp is out of tolerated skew"));
        }

        Ok(())
    }
}

fn bad(msg: &str) -> ProxyError {
    ProxyError::InvalidHandshake(msg.to_string())
}

fn parse_sni(cursor: &mut Cursor<'_>) -> Result<String> {
    let extensions_len = cursor.take_u16()? as usize;
    let mut remaining = cursor.take(extensions_len)?;

    while remaining.len() >= 4 {
        let ext_type = u16::from_be_bytes([remaining[0], remaining[1]]);
        let ext_len = u16::from_be_bytes([remaining[2], remaining[3]]) as usize;
        remaining = remaining
            .get(4..)
            .ok_or_else(|| bad("truncated extension"))?;

        let body = remaining
            .get(..ext_len)
            .ok_or_else(|| bad("truncated extension body"))?;

        if ext_type == EXTENSION_SNI {
            // server_name_list: u16 list length, u8 name type (0 = host),
            // u16 name length, name bytes.
            if body.len() < 5 || body[2] != 0 {
                return Err(bad("malformed server name extension"));
            }
            let name_len = u16::from_be_bytes([body[3], body[4]]) as usize;
            let name = body
                .get(5..5 + name_len)
                .ok_or_else(|| bad("truncated server name"))?;

            return String::from_utf8(name.to_vec())
                .map_err(|_| bad("server name is not valid UTF-8"));
        }

        remaining = &remaining[ext_len..];
    }

    Err(bad("no server name extension"))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let slice = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| bad("client hello is truncated"))?;
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn take_u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }
}
