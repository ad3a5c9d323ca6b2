//! Obfuscated2 transport handshakes
//!
//! A 64-byte frame carries an AES-256-CTR key, IV and DC selector. The
//! client→proxy leg mixes the proxy secret into the key derivation; the
//! proxy→Telegram leg uses the seed bytes directly, which is what Telegram
//! derives from on its side.

use crate::crypto::{sha256_concat, AesCtr, SecureRandom};
use crate::error::{ProxyError, Result};
use crate::protocol::constants::*;

/// Cipher pair for one post-handshake connection. The encryptor and
/// decryptor each carry independent CTR state.
pub struct CipherPair {
    pub encryptor: AesCtr,
    pub decryptor: AesCtr,
}

/// Outcome of the client-side handshake.
pub struct ClientHandshake {
    pub dc: i16,
    pub ciphers: CipherPair,
}

/// 64-byte handshake frame with the standard field layout.
#[derive(Clone, Copy)]
struct HandshakeFrame {
    data: [u8; HANDSHAKE_LEN],
}

impl HandshakeFrame {
    fn new(data: [u8; HANDSHAKE_LEN]) -> Self {
        Self { data }
    }

    fn seed(&self) -> &[u8] {
        &self.data[KEY_POS..IV_POS + IV_LEN]
    }

    fn key(&self) -> [u8; KEY_LEN] {
        self.data[KEY_POS..KEY_POS + KEY_LEN]
            .try_into()
            .expect("fixed slice")
    }

    fn iv(&self) -> [u8; IV_LEN] {
        self.data[IV_POS..IV_POS + IV_LEN]
            .try_into()
            .expect("fixed slice")
    }

    /// Frame with the seed bytes reversed, used for the opposite
    /// direction's key material.
    fn invert(&self) -> Self {
        let mut inverted = *self;
        inverted.data[KEY_POS..IV_POS + IV_LEN].reverse();
        inverted
    }

    fn connection_type(&self) -> [u8; 4] {
        self.data[PROTO_TAG_POS..PROTO_TAG_POS + 4]
            .try_into()
            .expect("fixed slice")
    }

    fn dc(&self) -> i16 {
        i16::from_le_bytes(
            self.data[DC_IDX_POS..DC_IDX_POS + 2]
                .try_into()
                .expect("fixed slice"),
        )
    }

    /// Plaintext prefix patterns that announce some other transport.
    fn has_reserved_prefix(&self) -> bool {
        if RESERVED_FIRST_BYTES.contains(&self.data[0]) {
            return true;
        }

        let beginning = u32::from_le_bytes(self.data[..4].try_into().expect("fixed slice"));
        if RESERVED_BEGINNINGS.contains(&beginning) {
            return true;
        }

        self.data[4] | self.data[5] | self.data[6] | self.data[7] == 0
    }
}

/// Process the 64-byte frame a client sent through the FakeTLS tunnel.
///
/// Key derivation reads the unmodified frame: forward keys come from the
/// seed as written, backward keys from the reversed seed, each hashed with
/// the proxy secret. The returned decryptor has already consumed the frame
/// itself, so its counter lines up with the client's stream.
pub fn client_handshake(secret_key: &[u8], raw: &[u8; HANDSHAKE_LEN]) -> Result<ClientHandshake> {
    let frame = HandshakeFrame::new(*raw);

    if frame.has_reserved_prefix() {
        return Err(ProxyError::InvalidHandshake(
            "frame prefix belongs to another transport".into(),
        ));
    }

    let inverted = frame.invert();

    let mut decryptor = AesCtr::new(
        &sha256_concat(&frame.key(), secret_key),
        &frame.iv(),
    );
    let encryptor = AesCtr::new(
        &sha256_concat(&inverted.key(), secret_key),
        &inverted.iv(),
    );

    let mut decrypted = *raw;
    decryptor.apply_keystream(&mut decrypted);
    let decrypted = HandshakeFrame::new(decrypted);

    if decrypted.connection_type() != CONNECTION_TYPE_SECURE {
        return Err(ProxyError::InvalidHandshake(
            "unexpected connection type".into(),
        ));
    }

    let dc = decrypted.dc().unsigned_abs() as i16;

    Ok(ClientHandshake {
        dc,
        ciphers: CipherPair {
            encryptor,
            decryptor,
        },
    })
}

/// Generate the frame for the proxy→Telegram leg and the ciphers derived
/// from it. Returns the wire bytes ready to send: the whole frame is XORed
/// with the encryptor keystream, then the seed is restored from the
/// plaintext copy so Telegram can derive the same keys, leaving the tail
/// (connection type + DC) as ciphertext.
pub fn server_handshake(rng: &SecureRandom) -> Result<(Vec<u8>, CipherPair)> {
    let frame = generate_server_frame(rng)?;
    let inverted = frame.invert();

    let mut encryptor = AesCtr::new(&frame.key(), &frame.iv());
    let decryptor = AesCtr::new(&inverted.key(), &inverted.iv());

    let mut wire = frame.data;
    encryptor.apply_keystream(&mut wire);
    wire[KEY_POS..IV_POS + IV_LEN].copy_from_slice(frame.seed());

    Ok((
        wire.to_vec(),
        CipherPair {
            encryptor,
            decryptor,
        },
    ))
}

fn generate_server_frame(rng: &SecureRandom) -> Result<HandshakeFrame> {
    for _ in 0..FRAME_GENERATION_ATTEMPTS {
        let mut frame = HandshakeFrame::new(rng.array());

        if frame.has_reserved_prefix() {
            continue;
        }

        frame.data[PROTO_TAG_POS..PROTO_TAG_POS + 4]
            .copy_from_slice(&CONNECTION_TYPE_SECURE);

        return Ok(frame);
    }

    // ~0.4% rejection per attempt makes 100 consecutive rejections
    // impossible with a working RNG.
    Err(ProxyError::InvalidHandshake(format!(
        "failed to generate a valid handshake frame after {FRAME_GENERATION_ATTEMPTS} attempts"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c,
        0x0d, 0x0e, 0x0f,
    ];

    /// Build a frame the way a real client does: random bytes, tag and DC
    /// written in plaintext, then the whole frame XORed with the client's
    /// encryptor (= our decryptor) keystream, with the seed restored.
    fn build_client_frame(rng: &SecureRandom, dc: i16) -> [u8; HANDSHAKE_LEN] {
        loop {
            let mut plain = HandshakeFrame::new(rng.array());
            if plain.has_reserved_prefix() {
                continue;
            }

            plain.data[PROTO_TAG_POS..PROTO_TAG_POS + 4]
                .copy_from_slice(&CONNECTION_TYPE_SECURE);
            plain.data[DC_IDX_POS..DC_IDX_POS + 2].copy_from_slice(&dc.to_le_bytes());

            let mut cipher = AesCtr::new(
                &sha256_concat(&plain.key(), &SECRET),
                &plain.iv(),
            );

            let mut wire = plain.data;
            cipher.apply_keystream(&mut wire);
            wire[KEY_POS..IV_POS + IV_LEN].copy_from_slice(plain.seed());

            // The server screens the wire bytes too; regenerate on the
            // rare collision, like a real client would reconnect.
            if HandshakeFrame::new(wire).has_reserved_prefix() {
                continue;
            }

            return wire;
        }
    }

    #[test]
    fn test_client_handshake_extracts_dc() {
        let rng = SecureRandom::new();
        for dc in [1i16, 2, 3, 4, 5, -2, 203] {
            let wire = build_client_frame(&rng, dc);
            let hs = client_handshake(&SECRET, &wire).unwrap();
            assert_eq!(hs.dc, dc.unsigned_abs() as i16);
        }
    }

    #[test]
    fn test_client_handshake_cipher_state_continues() {
        let rng = SecureRandom::new();
        let wire = build_client_frame(&rng, 2);

        // Client-side cipher that produced the frame, advanced past it.
        let plain_key: [u8; KEY_LEN] = wire[KEY_POS..KEY_POS + KEY_LEN].try_into().unwrap();
        let plain_iv: [u8; IV_LEN] = wire[IV_POS..IV_POS + IV_LEN].try_into().unwrap();
        let mut client_cipher = AesCtr::new(&sha256_concat(&plain_key, &SECRET), &plain_iv);
        let mut skip = [0u8; HANDSHAKE_LEN];
        client_cipher.apply_keystream(&mut skip);

        let mut payload = b"first payload after the handshake".to_vec();
        client_cipher.apply_keystream(&mut payload);

        let mut hs = client_handshake(&SECRET, &wire).unwrap();
        hs.ciphers.decryptor.apply_keystream(&mut payload);
        assert_eq!(payload, b"first payload after the handshake");
    }

    #[test]
    fn test_reserved_prefixes_rejected() {
        let rng = SecureRandom::new();

        let mut wire = build_client_frame(&rng, 2);
        wire[0] = 0xef;
        assert!(client_handshake(&SECRET, &wire).is_err());

        let mut wire = build_client_frame(&rng, 2);
        wire[..4].copy_from_slice(b"HEAD");
        assert!(client_handshake(&SECRET, &wire).is_err());

        let mut wire = build_client_frame(&rng, 2);
        wire[..4].copy_from_slice(&0xeeee_eeeeu32.to_le_bytes());
        assert!(client_handshake(&SECRET, &wire).is_err());

        let mut wire = build_client_frame(&rng, 2);
        wire[4..8].fill(0);
        assert!(client_handshake(&SECRET, &wire).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let rng = SecureRandom::new();
        let wire = build_client_frame(&rng, 2);

        let mut other = SECRET;
        other[0] ^= 0xff;

        // With the wrong secret the decrypted tag is effectively random;
        // the chance of it matching 0xefefefef is 2^-32.
        assert!(client_handshake(&other, &wire).is_err());
    }

    #[test]
    fn test_server_frame_decrypts_to_tag() {
        let rng = SecureRandom::new();
        let (wire, _) = server_handshake(&rng).unwrap();
        assert_eq!(wire.len(), HANDSHAKE_LEN);

        // Telegram's view: derive the key from the plaintext seed and
        // decrypt; positions 56..60 must carry the connection type.
        let key: [u8; KEY_LEN] = wire[KEY_POS..KEY_POS + KEY_LEN].try_into().unwrap();
        let iv: [u8; IV_LEN] = wire[IV_POS..IV_POS + IV_LEN].try_into().unwrap();

        let mut decrypted = [0u8; HANDSHAKE_LEN];
        decrypted.copy_from_slice(&wire);
        AesCtr::new(&key, &iv).apply_keystream(&mut decrypted);

        assert_eq!(&decrypted[PROTO_TAG_POS..PROTO_TAG_POS + 4], &CONNECTION_TYPE_SECURE);
    }

    #[test]
    fn test_server_cipher_state_continues_past_frame() {
        let rng = SecureRandom::new();
        let (wire, mut ciphers) = server_handshake(&rng).unwrap();

        // Telegram-side decryptor, advanced past the 64-byte frame.
        let key: [u8; KEY_LEN] = wire[KEY_POS..KEY_POS + KEY_LEN].try_into().unwrap();
        let iv: [u8; IV_LEN] = wire[IV_POS..IV_POS + IV_LEN].try_into().unwrap();
        let mut tg_side = AesCtr::new(&key, &iv);
        let mut skip = [0u8; HANDSHAKE_LEN];
        tg_side.apply_keystream(&mut skip);

        let mut payload = b"hello telegram".to_vec();
        ciphers.encryptor.apply_keystream(&mut payload);
        tg_side.apply_keystream(&mut payload);
        assert_eq!(payload, b"hello telegram");
    }

    #[test]
    fn test_encrypt_decrypt_identity_on_fresh_state() {
        let rng = SecureRandom::new();
        let key: [u8; 32] = rng.array();
        let iv: [u8; 16] = rng.array();

        let original = rng.bytes(1000);
        let mut data = original.clone();
        AesCtr::new(&key, &iv).apply_keystream(&mut data);
        AesCtr::new(&key, &iv).apply_keystream(&mut data);
        assert_eq!(data, original);
    }
}
