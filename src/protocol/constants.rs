//! Protocol constants

/// Obfuscated2 handshake frame length.
pub const HANDSHAKE_LEN: usize = 64;

/// Random prefix before the key material starts.
pub const SKIP_LEN: usize = 8;

/// AES-256 key offset/length inside the frame.
pub const KEY_POS: usize = 8;
pub const KEY_LEN: usize = 32;

/// CTR IV offset/length inside the frame.
pub const IV_POS: usize = 40;
pub const IV_LEN: usize = 16;

/// Connection-type tag offset (4 bytes).
pub const PROTO_TAG_POS: usize = 56;

/// DC selector offset (little-endian i16).
pub const DC_IDX_POS: usize = 60;

/// The only connection type this proxy speaks: padded intermediate
/// ("secure"), which is what FakeTLS clients always use.
pub const CONNECTION_TYPE_SECURE: [u8; 4] = [0xef, 0xef, 0xef, 0xef];

/// First bytes a freshly generated frame must avoid: 0xef announces the
/// abridged transport.
pub const RESERVED_FIRST_BYTES: [u8; 1] = [0xef];

/// Four-byte prefixes a frame must avoid (taken from tg sources):
/// "HEAD", "POST", "GET ", "OPTI" and the intermediate transport tag.
pub const RESERVED_BEGINNINGS: [u32; 5] =
    [0x4441_4548, 0x5453_4f50, 0x2054_4547, 0x4954_504f, 0xeeee_eeee];

/// Attempts to generate a valid random frame before giving up. A single
/// rejection has probability < 0.4%, so hitting this bound means the RNG
/// is catastrophically broken.
pub const FRAME_GENERATION_ATTEMPTS: usize = 100;
