//! Domain fronting for clients that fail FakeTLS
//!
//! Whatever was already read from the socket is replayed to the fronting
//! host and the connection becomes a plain TCP splice. On the wire this is
//! exactly what a reverse proxy forwarding an unknown client would do.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

use crate::events::{EventBus, StreamId};
use crate::stats::{Counter, Stats};
use crate::stream::BufferPool;
use crate::transport::dns::Resolver;
use crate::transport::{dial, sockopts};

use super::relay::relay_bidirectional;

pub struct FrontingTarget {
    pub host: String,
    pub port: u16,
    pub dial_timeout: Duration,
    pub fastopen: bool,
}

/// Splice a rejected client to the fronting host, replaying `already_read`
/// first. Errors end the connection quietly; an unreachable front is
/// indistinguishable from a front that closed on its own.
#[allow(clippy::too_many_arguments)]
pub async fn handle_bad_client<R, W>(
    client_reader: R,
    client_writer: W,
    already_read: &[u8],
    target: &FrontingTarget,
    resolver: &Resolver,
    stream_id: StreamId,
    stats: Arc<Stats>,
    events: EventBus,
    buffer_pool: Arc<BufferPool>,
    cancel: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    stats.count(Counter::Fronted);

    let addrs = match resolver.resolve(&target.host, target.port).await {
        Ok(addrs) => addrs,
        Err(e) => {
            debug!(stream_id = %stream_id, host = %target.host, error = %e, "cannot resolve fronting domain");
            return;
        }
    };

    let mut front = None;
    for addr in addrs {
        match dial(addr, target.dial_timeout, target.fastopen).await {
            Ok(stream) => {
                front = Some(stream);
                break;
            }
            Err(e) => {
                debug!(stream_id = %stream_id, addr = %addr, error = %e, "fronting dial attempt failed");
            }
        }
    }

    let Some(front) = front else {
        debug!(stream_id = %stream_id, host = %target.host, "cannot dial the fronting domain");
        return;
    };

    sockopts::tune_for_relay(&front, 30_000);

    let (front_reader, mut front_writer) = front.into_split();

    if !already_read.is_empty() {
        if let Err(e) = front_writer.write_all(already_read).await {
            debug!(stream_id = %stream_id, error = %e, "cannot replay buffered bytes to front");
            return;
        }
        if let Err(e) = front_writer.flush().await {
            debug!(stream_id = %stream_id, error = %e, "cannot flush buffered bytes to front");
            return;
        }
    }

    relay_bidirectional(
        client_reader,
        client_writer,
        front_reader,
        front_writer,
        stream_id,
        None,
        stats,
        events,
        buffer_pool,
        cancel,
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecureRandom;
    use crate::events::Observer;
    use tokio::io::{AsyncReadExt, duplex};
    use tokio::net::TcpListener;

    struct Noop;
    impl Observer for Noop {}

    fn noop_bus() -> EventBus {
        let factories: Vec<Box<dyn Fn() -> Box<dyn Observer + Send> + Send + Sync>> =
            vec![Box::new(|| Box::new(Noop))];
        EventBus::start(&factories, Arc::new(SecureRandom::new())).0
    }

    #[tokio::test]
    async fn test_prefix_and_stream_are_forwarded_verbatim() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Fake front: records everything it receives, then answers.
        let front_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = vec![0u8; 25];
            stream.read_exact(&mut received).await.unwrap();
            stream.write_all(b"front-reply").await.unwrap();
            stream.shutdown().await.unwrap();
            received
        });

        let (client_near, client_far) = duplex(1 << 16);
        let (client_r, client_w) = tokio::io::split(client_near);
        let (mut far_r, mut far_w) = tokio::io::split(client_far);

        let target = FrontingTarget {
            host: "127.0.0.1".into(),
            port,
            dial_timeout: Duration::from_secs(2),
            fastopen: false,
        };
        let resolver = Resolver::new(16, Duration::from_secs(60));
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let rng = SecureRandom::new();

        let fronting = tokio::spawn(async move {
            handle_bad_client(
                client_r,
                client_w,
                b"GET / HTTP",
                &target,
                &resolver,
                StreamId::generate(&rng),
                Arc::new(Stats::new()),
                noop_bus(),
                Arc::new(BufferPool::default()),
                cancel_rx,
            )
            .await;
        });

        // The client keeps talking after the sniffed prefix.
        far_w.write_all(b"/1.1\r\nHost: x\r\n").await.unwrap();
        far_w.shutdown().await.unwrap();

        let received = front_task.await.unwrap();
        assert_eq!(&received[..10], b"GET / HTTP");
        assert_eq!(&received[10..], b"/1.1\r\nHost: x\r\n");

        let mut reply = vec![0u8; 11];
        far_r.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"front-reply");

        fronting.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_front_ends_quietly() {
        let (client_near, _client_far) = duplex(1 << 16);
        let (client_r, client_w) = tokio::io::split(client_near);

        let target = FrontingTarget {
            host: "127.0.0.1".into(),
            port: 1, // nothing listens here
            dial_timeout: Duration::from_millis(200),
            fastopen: false,
        };
        let resolver = Resolver::new(16, Duration::from_secs(60));
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let rng = SecureRandom::new();
        let stats = Arc::new(Stats::new());

        handle_bad_client(
            client_r,
            client_w,
            b"junk",
            &target,
            &resolver,
            StreamId::generate(&rng),
            stats.clone(),
            noop_bus(),
            Arc::new(BufferPool::default()),
            cancel_rx,
        )
        .await;

        assert_eq!(stats.counter(Counter::Fronted), 1);
    }
}
