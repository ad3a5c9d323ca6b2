//! TLS record layer

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Wire version in every record header (TLS 1.2; TLS 1.3 keeps it for
/// middlebox compatibility).
pub const TLS_VERSION: [u8; 2] = [0x03, 0x03];

/// Maximum payload this implementation writes per record. Real TLS stacks
/// fill records to this size during bulk transfer; anything else is a
/// fingerprint.
pub const MAX_RECORD_PAYLOAD: usize = 16384;

/// Upper bound accepted on reads: plaintext limit plus the expansion TLS
/// 1.3 allows for ciphertext.
const MAX_INBOUND_PAYLOAD: usize = MAX_RECORD_PAYLOAD + 2048;

const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    ChangeCipherSpec = 0x14,
    Handshake = 0x16,
    ApplicationData = 0x17,
}

impl RecordType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x14 => Some(Self::ChangeCipherSpec),
            0x16 => Some(Self::Handshake),
            0x17 => Some(Self::ApplicationData),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsRecord {
    pub record_type: RecordType,
    pub payload: Vec<u8>,
}

impl TlsRecord {
    pub fn new(record_type: RecordType, payload: Vec<u8>) -> Self {
        Self {
            record_type,
            payload,
        }
    }

    /// Append the serialized record to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.record_type as u8);
        out.extend_from_slice(&TLS_VERSION);
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        self.write_to(&mut out);
        out
    }

    /// Read one record from an async stream.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;

        Self::read_body(reader, &header).await
    }

    /// Read the record body when the 5-byte header was already consumed by
    /// the caller (the pipeline sniffs the header before committing).
    pub async fn read_body<R: AsyncRead + Unpin>(
        reader: &mut R,
        header: &[u8; HEADER_LEN],
    ) -> io::Result<Self> {
        let record_type = RecordType::from_byte(header[0]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported record type 0x{:02x}", header[0]),
            )
        })?;

        if header[1] != 0x03 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unsupported record version",
            ));
        }

        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if len > MAX_INBOUND_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "record length exceeds TLS maximum",
            ));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;

        Ok(Self {
            record_type,
            payload,
        })
    }
}

/// Split `data` into full-sized ApplicationData records plus a final short
/// record, serialized back to back into one buffer.
pub fn encode_application_data(data: &[u8], out: &mut Vec<u8>) {
    for chunk in data.chunks(MAX_RECORD_PAYLOAD) {
        out.push(RecordType::ApplicationData as u8);
        out.extend_from_slice(&TLS_VERSION);
        out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
        out.extend_from_slice(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_roundtrip() {
        let rec = TlsRecord::new(RecordType::ApplicationData, vec![1, 2, 3, 4, 5]);
        let bytes = rec.to_bytes();

        let mut cursor = io::Cursor::new(bytes);
        let parsed = TlsRecord::read_from(&mut cursor).await.unwrap();

        assert_eq!(parsed.record_type, RecordType::ApplicationData);
        assert_eq!(parsed.payload, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_unknown_record_type_rejected() {
        let mut bytes = vec![0x15, 0x03, 0x03, 0x00, 0x01, 0x00];
        let mut cursor = io::Cursor::new(std::mem::take(&mut bytes));
        assert!(TlsRecord::read_from(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_record_rejected() {
        let rec = TlsRecord::new(RecordType::Handshake, vec![0u8; 32]);
        let mut bytes = rec.to_bytes();
        bytes.truncate(20);

        let mut cursor = io::Cursor::new(bytes);
        assert!(TlsRecord::read_from(&mut cursor).await.is_err());
    }

    #[test]
    fn test_encode_application_data_chunking() {
        let data = vec![0xabu8; MAX_RECORD_PAYLOAD * 3 + 100];
        let mut out = Vec::new();
        encode_application_data(&data, &mut out);

        // 3 full records + 1 short record.
        let mut sizes = Vec::new();
        let mut pos = 0;
        while pos < out.len() {
            assert_eq!(out[pos], RecordType::ApplicationData as u8);
            let len = u16::from_be_bytes([out[pos + 3], out[pos + 4]]) as usize;
            sizes.push(len);
            pos += HEADER_LEN + len;
        }

        assert_eq!(
            sizes,
            vec![MAX_RECORD_PAYLOAD, MAX_RECORD_PAYLOAD, MAX_RECORD_PAYLOAD, 100]
        );
    }

    #[test]
    fn test_encode_rejoin_is_identity() {
        let data: Vec<u8> = (0..40000u32).map(|i| (i % 251) as u8).collect();
        let mut wire = Vec::new();
        encode_application_data(&data, &mut wire);

        let mut rejoined = Vec::new();
        let mut pos = 0;
        while pos < wire.len() {
            let len = u16::from_be_bytes([wire[pos + 3], wire[pos + 4]]) as usize;
            rejoined.extend_from_slice(&wire[pos + HEADER_LEN..pos + HEADER_LEN + len]);
            pos += HEADER_LEN + len;
        }

        assert_eq!(rejoined, data);
    }
}
