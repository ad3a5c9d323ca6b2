//! FakeTLS: a TLS-1.3-shaped outer encapsulation.
//!
//! Passive observers see an ordinary HTTPS exchange; clients that fail the
//! HMAC check are forwarded to the fronting domain instead of being
//! disconnected, so the proxy is indistinguishable from a reverse proxy.

mod client_hello;
mod record;
mod server_hello;

#[cfg(test)]
pub(crate) use client_hello::testutil;

pub use client_hello::ClientHello;
pub use record::{
    encode_application_data, RecordType, TlsRecord, MAX_RECORD_PAYLOAD, TLS_VERSION,
};
pub use server_hello::build_welcome_packet;

/// Quick sniff on the first bytes of a connection: a TLS handshake record
/// starts with 0x16 0x03.
pub fn looks_like_tls_handshake(first_bytes: &[u8]) -> bool {
    first_bytes.len() >= 3
        && first_bytes[0] == RecordType::Handshake as u8
        && first_bytes[1] == 0x03
}
