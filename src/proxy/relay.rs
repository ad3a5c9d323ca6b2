//! Full-duplex relay

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

use crate::events::{Event, EventBus, StreamId};
use crate::stats::{Direction, Stats};
use crate::stream::BufferPool;

/// Emit a traffic event once this many bytes accumulated in a direction;
/// per-read events would flood the bus for no metric benefit.
const TRAFFIC_FLUSH_THRESHOLD: u64 = 32 * 1024;

struct TrafficMeter {
    events: EventBus,
    stream_id: StreamId,
    is_read: bool,
    accumulated: u64,
}

impl TrafficMeter {
    fn new(events: EventBus, stream_id: StreamId, is_read: bool) -> Self {
        Self {
            events,
            stream_id,
            is_read,
            accumulated: 0,
        }
    }

    async fn add(&mut self, bytes: u64) {
        self.accumulated += bytes;
        if self.accumulated >= TRAFFIC_FLUSH_THRESHOLD {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        if self.accumulated > 0 {
            self.events
                .send(Event::Traffic {
                    stream_id: self.stream_id,
                    bytes: self.accumulated,
                    is_read: self.is_read,
                })
                .await;
            self.accumulated = 0;
        }
    }
}

/// Pump bytes between the client-side and remote-side wrappers until both
/// directions finish. Cancellation half-closes the writes so each peer
/// observes an ordinary EOF; the sockets themselves are closed by the
/// caller dropping the wrappers.
///
/// Kernel splice is impossible here: both sides sit behind streaming
/// ciphers, so every byte crosses user space through pooled 256 KiB
/// buffers.
#[allow(clippy::too_many_arguments)]
pub async fn relay_bidirectional<CR, CW, RR, RW>(
    client_reader: CR,
    client_writer: CW,
    remote_reader: RR,
    remote_writer: RW,
    stream_id: StreamId,
    dc: Option<i16>,
    stats: Arc<Stats>,
    events: EventBus,
    buffer_pool: Arc<BufferPool>,
    cancel: watch::Receiver<bool>,
) where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    RR: AsyncRead + Unpin + Send + 'static,
    RW: AsyncWrite + Unpin + Send + 'static,
{
    // Upload: client -> remote.
    let upload_meter = TrafficMeter::new(events.clone(), stream_id, false);
    let upload = tokio::spawn(pump(
        client_reader,
        remote_writer,
        upload_meter,
        "client to remote",
        stream_id,
        buffer_pool.clone(),
        cancel.clone(),
    ));

    // Download: remote -> client, the high-priority direction, runs on the
    // connection's own task.
    let download_meter = TrafficMeter::new(events.clone(), stream_id, true);
    let downloaded = pump(
        remote_reader,
        client_writer,
        download_meter,
        "remote to client",
        stream_id,
        buffer_pool,
        cancel,
    )
    .await;

    // Let the sibling direction drain before the caller tears down.
    let uploaded = upload.await.unwrap_or(0);

    if let Some(dc) = dc {
        stats.add_octets(dc, Direction::FromClient, uploaded);
        stats.add_octets(dc, Direction::ToClient, downloaded);
    }

    debug!(
        stream_id = %stream_id,
        uploaded = uploaded,
        downloaded = downloaded,
        "relay finished"
    );
}

async fn pump<R, W>(
    mut src: R,
    mut dst: W,
    mut meter: TrafficMeter,
    direction: &'static str,
    stream_id: StreamId,
    buffer_pool: Arc<BufferPool>,
    mut cancel: watch::Receiver<bool>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = buffer_pool.acquire_relay();
    let mut total = 0u64;

    let outcome: Result<&str, std::io::Error> = loop {
        let n = tokio::select! {
            biased;
            _ = cancel.changed() => break Ok("cancelled"),
            read = src.read(&mut buf) => match read {
                Ok(0) => break Ok("eof"),
                Ok(n) => n,
                Err(e) => break Err(e),
            },
        };

        if let Err(e) = dst.write_all(&buf[..n]).await {
            break Err(e);
        }
        if let Err(e) = dst.flush().await {
            break Err(e);
        }

        total += n as u64;
        meter.add(n as u64).await;
    };

    meter.flush().await;
    buffer_pool.release(buf);

    // Half-close so the peer sees EOF; full close happens when the caller
    // drops the halves.
    let _ = dst.shutdown().await;

    match outcome {
        Ok(reason) => {
            debug!(stream_id = %stream_id, direction = direction, bytes = total, reason = reason, "pump finished");
        }
        Err(e) => {
            debug!(stream_id = %stream_id, direction = direction, bytes = total, error = %e, "pump finished with error");
        }
    }

    total
}
