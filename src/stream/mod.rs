//! Connection stream wrappers and buffer pooling

mod crypto_stream;
mod faketls_stream;

pub use crypto_stream::{CryptoReader, CryptoWriter};
pub use faketls_stream::{FakeTlsReader, FakeTlsWriter};

use parking_lot::Mutex;

/// FakeTLS record payload class.
pub const RECORD_BUFFER_SIZE: usize = 16 * 1024;

/// Relay copy buffer class: roughly the bandwidth-delay product of a
/// 100 Mbps * 20 ms mobile path.
pub const RELAY_BUFFER_SIZE: usize = 256 * 1024;

/// Buffers larger than this are dropped instead of returned, so a single
/// oversized write cannot pin memory in the pool forever.
const MAX_POOLED_CAPACITY: usize = RELAY_BUFFER_SIZE;

/// Free-list buffer pool with two size classes. Writers take a scratch
/// buffer for ciphertext, the relay takes copy buffers; both return them
/// here on drop.
pub struct BufferPool {
    record: Mutex<Vec<Vec<u8>>>,
    relay: Mutex<Vec<Vec<u8>>>,
    max_record: usize,
    max_relay: usize,
}

impl BufferPool {
    pub fn with_config(max_record: usize, max_relay: usize) -> Self {
        Self {
            record: Mutex::new(Vec::new()),
            relay: Mutex::new(Vec::new()),
            max_record,
            max_relay,
        }
    }

    /// Empty buffer with at least one record payload of capacity.
    pub fn acquire_record(&self) -> Vec<u8> {
        self.record
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(RECORD_BUFFER_SIZE))
    }

    /// Zero-filled relay copy buffer.
    pub fn acquire_relay(&self) -> Vec<u8> {
        let mut buf = self
            .relay
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(RELAY_BUFFER_SIZE));
        buf.resize(RELAY_BUFFER_SIZE, 0);
        buf
    }

    pub fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }

        buf.clear();

        if buf.capacity() >= RELAY_BUFFER_SIZE {
            let mut relay = self.relay.lock();
            if relay.len() < self.max_relay {
                relay.push(buf);
            }
        } else {
            let mut record = self.record.lock();
            if record.len() < self.max_record {
                record.push(buf);
            }
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        // ~64 MiB of record buffers plus ~32 MiB of relay buffers at the
        // absolute cap; in practice the lists stay far smaller.
        Self::with_config(4096, 128)
    }
}
