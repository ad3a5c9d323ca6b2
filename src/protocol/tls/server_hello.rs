//! FakeTLS welcome packet

use x25519_dalek::{EphemeralSecret, PublicKey};

use super::client_hello::ClientHello;
use super::record::{RecordType, TlsRecord};
use crate::crypto::{hmac_sha256, SecureRandom};

const SERVER_RANDOM_POS: usize = 5 + 6; // record header + type/len/version
const SERVER_RANDOM_LEN: usize = 32;

const CIPHER_TLS_AES_128_GCM_SHA256: u16 = 0x1301;

const EXTENSION_SUPPORTED_VERSIONS: u16 = 0x002b;
const EXTENSION_KEY_SHARE: u16 = 0x0033;
const GROUP_X25519: u16 = 0x001d;

/// Bounds for the trailing ApplicationData padding record. The size is
/// drawn fresh per connection so the welcome packet length is not a
/// constant.
const PADDING_MIN: u64 = 1024;
const PADDING_MAX: u64 = 4116;

/// Build the full welcome packet: ServerHello + ChangeCipherSpec +
/// ApplicationData padding, with the server Random replaced by
/// HMAC-SHA256(secret, client random || packet-with-zero-random).
///
/// The client performs the mirror computation to authenticate us, so the
/// digest has to be written into the serialized packet in place.
pub fn build_welcome_packet(
    secret_key: &[u8],
    hello: &ClientHello,
    rng: &SecureRandom,
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(4096);

    TlsRecord::new(RecordType::Handshake, server_hello_payload(hello)).write_to(&mut packet);
    TlsRecord::new(RecordType::ChangeCipherSpec, vec![0x01]).write_to(&mut packet);

    let padding_len = rng.between(PADDING_MIN, PADDING_MAX) as usize;
    TlsRecord::new(RecordType::ApplicationData, rng.bytes(padding_len))
        .write_to(&mut packet);

    let digest = hmac_sha256(secret_key, &[hello.wire_random.as_slice(), packet.as_slice()]);
    packet[SERVER_RANDOM_POS..SERVER_RANDOM_POS + SERVER_RANDOM_LEN]
        .copy_from_slice(&digest);

    packet
}

fn server_hello_payload(hello: &ClientHello) -> Vec<u8> {
    let mut extensions = Vec::with_capacity(48);

    extensions.extend_from_slice(&EXTENSION_SUPPORTED_VERSIONS.to_be_bytes());
    extensions.extend_from_slice(&2u16.to_be_bytes());
    extensions.extend_from_slice(&[0x03, 0x04]); // TLS 1.3

    // The key share is a throwaway X25519 public key; the EphemeralSecret
    // scalar is zeroized when it drops at the end of this function,
    // including early-return paths.
    let scalar = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&scalar);

    extensions.extend_from_slice(&EXTENSION_KEY_SHARE.to_be_bytes());
    extensions.extend_from_slice(&36u16.to_be_bytes());
    extensions.extend_from_slice(&GROUP_X25519.to_be_bytes());
    extensions.extend_from_slice(&32u16.to_be_bytes());
    extensions.extend_from_slice(public.as_bytes());

    let mut body = Vec::with_capacity(128);
    body.extend_from_slice(&[0x03, 0x03]); // legacy_version
    body.extend_from_slice(&[0u8; SERVER_RANDOM_LEN]); // filled in later
    body.push(32);
    body.extend_from_slice(&hello.session_id); // session id echo
    body.extend_from_slice(&CIPHER_TLS_AES_128_GCM_SHA256.to_be_bytes());
    body.push(0x00); // no compression
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut payload = Vec::with_capacity(body.len() + 4);
    payload.push(0x02); // ServerHello
    payload.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    payload.extend_from_slice(&body);

    payload
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::super::client_hello::testutil::build_client_hello;
    use super::*;

    const KEY: [u8; 16] = [7u8; 16];

    fn parsed_hello() -> ClientHello {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32;
        let raw = build_client_hello(&KEY, &[9u8; 32], "example.com", ts);
        ClientHello::parse(&KEY, &raw).unwrap()
    }

    #[test]
    fn test_welcome_packet_structure() {
        let rng = SecureRandom::new();
        let hello = parsed_hello();
        let packet = build_welcome_packet(&KEY, &hello, &rng);

        // ServerHello record.
        assert_eq!(packet[0], RecordType::Handshake as u8);
        let sh_len = u16::from_be_bytes([packet[3], packet[4]]) as usize;
        assert_eq!(packet[5], 0x02);

        // Session id echo.
        let sid_pos = 5 + 6 + 32 + 1;
        assert_eq!(&packet[sid_pos..sid_pos + 32], &[9u8; 32]);

        // ChangeCipherSpec record follows.
        let ccs_pos = 5 + sh_len;
        assert_eq!(packet[ccs_pos], RecordType::ChangeCipherSpec as u8);
        assert_eq!(packet[ccs_pos + 5], 0x01);

        // ApplicationData padding record closes the packet.
        let ad_pos = ccs_pos + 6;
        assert_eq!(packet[ad_pos], RecordType::ApplicationData as u8);
        let ad_len =
            u16::from_be_bytes([packet[ad_pos + 3], packet[ad_pos + 4]]) as usize;
        assert!((1024..=4116).contains(&ad_len));
        assert_eq!(packet.len(), ad_pos + 5 + ad_len);
    }

    #[test]
    fn test_server_random_is_authenticating_digest() {
        let rng = SecureRandom::new();
        let hello = parsed_hello();
        let packet = build_welcome_packet(&KEY, &hello, &rng);

        let mut zeroed = packet.clone();
        zeroed[SERVER_RANDOM_POS..SERVER_RANDOM_POS + SERVER_RANDOM_LEN].fill(0);
        let expected = hmac_sha256(&KEY, &[hello.wire_random.as_slice(), zeroed.as_slice()]);

        assert_eq!(
            &packet[SERVER_RANDOM_POS..SERVER_RANDOM_POS + SERVER_RANDOM_LEN],
            &expected
        );
    }

    #[test]
    fn test_padding_size_varies() {
        let rng = SecureRandom::new();
        let hello = parsed_hello();

        let sizes: Vec<usize> = (0..16)
            .map(|_| build_welcome_packet(&KEY, &hello, &rng).len())
            .collect();
        assert!(sizes.iter().any(|&s| s != sizes[0]));
    }
}
