//! FakeTLS record-layer stream wrappers

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::BufferPool;
use crate::protocol::tls::{encode_application_data, RecordType, MAX_RECORD_PAYLOAD};

const HEADER_LEN: usize = 5;
const MAX_INBOUND_PAYLOAD: usize = MAX_RECORD_PAYLOAD + 2048;

/// Reassembles ApplicationData payloads from the record stream.
/// ChangeCipherSpec records are dropped for compatibility with older
/// peers; any other record type after the handshake is a hard error.
pub struct FakeTlsReader<R> {
    inner: R,
    pending: Vec<u8>,
    pending_pos: usize,
    state: ReadState,
}

enum ReadState {
    Header { buf: [u8; HEADER_LEN], filled: usize },
    Payload {
        record_type: RecordType,
        buf: Vec<u8>,
        filled: usize,
    },
}

impl ReadState {
    fn fresh_header() -> Self {
        ReadState::Header {
            buf: [0u8; HEADER_LEN],
            filled: 0,
        }
    }
}

impl<R> FakeTlsReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            pending_pos: 0,
            state: ReadState::fresh_header(),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for FakeTlsReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.pending_pos < this.pending.len() {
                let available = &this.pending[this.pending_pos..];
                let n = available.len().min(out.remaining());
                out.put_slice(&available[..n]);
                this.pending_pos += n;
                return Poll::Ready(Ok(()));
            }

            match &mut this.state {
                ReadState::Header { buf, filled } => {
                    while *filled < HEADER_LEN {
                        let mut read_buf = ReadBuf::new(&mut buf[*filled..]);
                        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;

                        let n = read_buf.filled().len();
                        if n == 0 {
                            return if *filled == 0 {
                                // Clean EOF between records.
                                Poll::Ready(Ok(()))
                            } else {
                                Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()))
                            };
                        }
                        *filled += n;
                    }

                    let record_type = RecordType::from_byte(buf[0]).ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("unsupported record type 0x{:02x}", buf[0]),
                        )
                    })?;

                    if record_type == RecordType::Handshake {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "handshake record after handshake completion",
                        )));
                    }

                    let len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
                    if len > MAX_INBOUND_PAYLOAD {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "record length exceeds TLS maximum",
                        )));
                    }

                    this.state = ReadState::Payload {
                        record_type,
                        buf: vec![0u8; len],
                        filled: 0,
                    };
                }
                ReadState::Payload {
                    record_type,
                    buf,
                    filled,
                } => {
                    while *filled < buf.len() {
                        let mut read_buf = ReadBuf::new(&mut buf[*filled..]);
                        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;

                        let n = read_buf.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                        }
                        *filled += n;
                    }

                    let is_data = *record_type == RecordType::ApplicationData;
                    let payload = std::mem::take(buf);
                    this.state = ReadState::fresh_header();

                    if is_data {
                        this.pending = payload;
                        this.pending_pos = 0;
                    }
                    // ChangeCipherSpec payloads are discarded silently.
                }
            }
        }
    }
}

/// Chunks writes into full-sized ApplicationData records plus one short
/// trailing record. Only full 16384-byte records are allowed for bulk
/// data: real TLS stacks fill records to the maximum, and anything else
/// is a distinguisher.
pub struct FakeTlsWriter<W> {
    inner: W,
    pool: Arc<BufferPool>,
    out: Vec<u8>,
    out_pos: usize,
}

impl<W> FakeTlsWriter<W> {
    pub fn new(inner: W, pool: Arc<BufferPool>) -> Self {
        let out = pool.acquire_record();
        Self {
            inner,
            pool,
            out,
            out_pos: 0,
        }
    }
}

impl<W: AsyncWrite + Unpin> FakeTlsWriter<W> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.out_pos < self.out.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.out[self.out_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.out_pos += n;
        }

        self.out.clear();
        self.out_pos = 0;

        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for FakeTlsWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        ready!(this.poll_drain(cx))?;

        encode_application_data(buf, &mut this.out);

        match this.poll_drain(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) | Poll::Pending => {}
        }

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<W> Drop for FakeTlsWriter<W> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.out));
    }
}
