//! AES-CTR stream wrappers

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::BufferPool;
use crate::crypto::AesCtr;

/// Decrypts in place after every read from the underlying stream.
pub struct CryptoReader<R> {
    inner: R,
    cipher: AesCtr,
}

impl<R> CryptoReader<R> {
    pub fn new(inner: R, cipher: AesCtr) -> Self {
        Self { inner, cipher }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CryptoReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let filled = buf.filled_mut();
        this.cipher.apply_keystream(&mut filled[before..]);

        Poll::Ready(Ok(()))
    }
}

/// Encrypts into a pooled scratch buffer and writes the ciphertext.
///
/// The caller's buffer is never mutated: a duplex wrapper must leave its
/// input untouched because the relay reuses its copy buffer across
/// iterations.
pub struct CryptoWriter<W> {
    inner: W,
    cipher: AesCtr,
    pool: Arc<BufferPool>,
    out: Vec<u8>,
    out_pos: usize,
}

impl<W> CryptoWriter<W> {
    pub fn new(inner: W, cipher: AesCtr, pool: Arc<BufferPool>) -> Self {
        let out = pool.acquire_record();
        Self {
            inner,
            cipher,
            pool,
            out,
            out_pos: 0,
        }
    }
}

impl<W: AsyncWrite + Unpin> CryptoWriter<W> {
    /// Push pending ciphertext into the underlying writer until the
    /// scratch buffer is empty.
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

impl<W: AsyncWrite + Unpin> AsyncWrite for CryptoWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // Previous ciphertext must leave before new plaintext is pushed
        // through the keystream; otherwise a Pending retry would advance
        // the counter twice for the same bytes.
        ready!(this.poll_drain(cx))?;

        let start = this.out.len();
        this.out.extend_from_slice(buf);
        this.cipher.apply_keystream(&mut this.out[start..]);

        // Opportunistic drain; leftovers go out on the next write or flush.
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

impl<W> Drop for CryptoWriter<W> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.out));
    }
}
