//! Event bus
//!
//! A sharded, bounded multi-producer queue routing per-stream events to
//! observers. Events that carry a stream id always land on the same shard,
//! so observers see them in order. Traffic events are advisory and high
//! frequency: when a shard is full they are dropped and counted instead of
//! stalling the relay. Every other kind blocks up to the shard buffer.

mod observer;

pub use observer::{LogObserver, MultiObserver, Observer, StreamInfo, StreamTracker};

use std::fmt;
use std::hash::Hasher;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use twox_hash::XxHash32;

use crate::crypto::SecureRandom;

/// Shard queue depth. Deep enough to ride out an observer hiccup, small
/// enough that a stuck observer cannot buffer the world.
const SHARD_BUFFER: usize = 64;

/// Random 128-bit stream identifier, rendered as hex in logs.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId([u8; 16]);

impl StreamId {
    pub fn generate(rng: &SecureRandom) -> Self {
        Self(rng.array())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Start {
        stream_id: StreamId,
        remote_ip: IpAddr,
    },
    ConnectedToDc {
        stream_id: StreamId,
        remote_ip: IpAddr,
        dc: i16,
    },
    /// Byte counts from the relay. `is_read` means bytes fetched from the
    /// remote side (Telegram or the front domain) on their way to the
    /// client.
    Traffic {
        stream_id: StreamId,
        bytes: u64,
        is_read: bool,
    },
    Finish {
        stream_id: StreamId,
    },
    DomainFronting {
        stream_id: StreamId,
    },
    ConcurrencyLimited,
    ReplayAttack {
        stream_id: StreamId,
    },
    IpListed {
        remote_ip: IpAddr,
        is_blocklist: bool,
    },
    IpListSize {
        size: usize,
        is_blocklist: bool,
    },
    DnsCacheMetrics {
        delta_hits: u64,
        delta_misses: u64,
        delta_evictions: u64,
        size: usize,
    },
    PoolMetrics {
        dc: i16,
        delta_hits: u64,
        delta_misses: u64,
        delta_unhealthy: u64,
        idle: usize,
    },
}

impl Event {
    fn stream_id(&self) -> Option<StreamId> {
        match self {
            Event::Start { stream_id, .. }
            | Event::ConnectedToDc { stream_id, .. }
            | Event::Traffic { stream_id, .. }
            | Event::Finish { stream_id }
            | Event::DomainFronting { stream_id }
            | Event::ReplayAttack { stream_id } => Some(*stream_id),
            _ => None,
        }
    }

    fn is_traffic(&self) -> bool {
        matches!(self, Event::Traffic { .. })
    }
}

/// Sharded event bus handle. Cheap to clone; all clones feed the same
/// consumers.
#[derive(Clone)]
pub struct EventBus {
    shards: Arc<Vec<mpsc::Sender<Event>>>,
    dropped: Arc<AtomicU64>,
    rng: Arc<SecureRandom>,
}

impl EventBus {
    /// Spawn one consumer task per shard (shard count = CPU count), each
    /// dispatching to its own set of observers built by `factories`.
    pub fn start(
        factories: &[Box<dyn Fn() -> Box<dyn Observer + Send> + Send + Sync>],
        rng: Arc<SecureRandom>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let shard_count = num_cpus::get().max(1);

        let mut shards = Vec::with_capacity(shard_count);
        let mut consumers = Vec::with_capacity(shard_count);

        for _ in 0..shard_count {
            let (tx, rx) = mpsc::channel(SHARD_BUFFER);
            shards.push(tx);

            let mut observers: Vec<Box<dyn Observer + Send>> =
                factories.iter().map(|f| f()).collect();
            let observer: Box<dyn Observer + Send> = match observers.len() {
                1 => observers.pop().expect("length checked"),
                _ => Box::new(MultiObserver::new(observers)),
            };
            consumers.push(tokio::spawn(consume_shard(rx, observer)));
        }

        (
            Self {
                shards: Arc::new(shards),
                dropped: Arc::new(AtomicU64::new(0)),
                rng,
            },
            consumers,
        )
    }

    pub async fn send(&self, event: Event) {
        let shard_no = match event.stream_id() {
            Some(id) => {
                let mut hasher = XxHash32::with_seed(0);
                hasher.write(id.as_bytes());
                hasher.finish() as u32
            }
            None => {
                let mut buf = [0u8; 4];
                self.rng.fill(&mut buf);
                u32::from_le_bytes(buf)
            }
        };

        let shard = &self.shards[shard_no as usize % self.shards.len()];

        if event.is_traffic() {
            // Never stall the relay on metrics: full shard drops the event.
            if shard.try_send(event).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        // Security-relevant events block up to the shard capacity; a closed
        // shard means shutdown is in progress and the event is moot.
        let _ = shard.send(event).await;
    }

    /// Traffic events dropped because their shard was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn consume_shard(mut rx: mpsc::Receiver<Event>, mut observer: Box<dyn Observer + Send>) {
    while let Some(event) = rx.recv().await {
        observer.handle(&event);
    }

    observer.on_shutdown();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    struct Counting {
        seen: Arc<AtomicUsize>,
        traffic: Arc<AtomicUsize>,
    }

    impl Observer for Counting {
        fn on_start(&mut self, _stream_id: StreamId, _remote_ip: IpAddr) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }

        fn on_traffic(&mut self, _stream_id: StreamId, _bytes: u64, _is_read: bool) {
            self.traffic.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_bus(
        seen: Arc<AtomicUsize>,
        traffic: Arc<AtomicUsize>,
    ) -> (EventBus, Vec<JoinHandle<()>>) {
        let factories: Vec<Box<dyn Fn() -> Box<dyn Observer + Send> + Send + Sync>> =
            vec![Box::new(move || {
                Box::new(Counting {
                    seen: seen.clone(),
                    traffic: traffic.clone(),
                })
            })];
        EventBus::start(&factories, Arc::new(SecureRandom::new()))
    }

    #[tokio::test]
    async fn test_events_reach_observers() {
        let seen = Arc::new(AtomicUsize::new(0));
        let traffic = Arc::new(AtomicUsize::new(0));
        let (bus, consumers) = test_bus(seen.clone(), traffic.clone());

        let rng = SecureRandom::new();
        for _ in 0..10 {
            bus.send(Event::Start {
                stream_id: StreamId::generate(&rng),
                remote_ip: "127.0.0.1".parse().unwrap(),
            })
            .await;
        }

        drop(bus);
        for handle in consumers {
            handle.await.unwrap();
        }

        assert_eq!(seen.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_same_stream_same_shard_order() {
        let seen = Arc::new(AtomicUsize::new(0));
        let traffic = Arc::new(AtomicUsize::new(0));
        let (bus, consumers) = test_bus(seen.clone(), traffic.clone());

        let rng = SecureRandom::new();
        let id = StreamId::generate(&rng);

        bus.send(Event::Start {
            stream_id: id,
            remote_ip: "10.0.0.1".parse().unwrap(),
        })
        .await;
        bus.send(Event::Traffic {
            stream_id: id,
            bytes: 100,
            is_read: true,
        })
        .await;
        bus.send(Event::Finish { stream_id: id }).await;

        drop(bus);
        for handle in consumers {
            handle.await.unwrap();
        }

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(traffic.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_traffic_overflow_drops_not_blocks() {
        // A consumer that never drains: saturate one shard with traffic
        // events; sends must return promptly and count the overflow.
        let (tx, _rx) = mpsc::channel(SHARD_BUFFER);
        let bus = EventBus {
            shards: Arc::new(vec![tx]),
            dropped: Arc::new(AtomicU64::new(0)),
            rng: Arc::new(SecureRandom::new()),
        };

        let rng = SecureRandom::new();
        let id = StreamId::generate(&rng);

        let send_all = async {
            for _ in 0..SHARD_BUFFER + 40 {
                bus.send(Event::Traffic {
                    stream_id: id,
                    bytes: 1,
                    is_read: false,
                })
                .await;
            }
        };
        tokio::time::timeout(Duration::from_secs(1), send_all)
            .await
            .expect("traffic sends must never block");

        assert_eq!(bus.dropped(), 40);
    }

    #[test]
    fn test_stream_id_display() {
        let id = StreamId([0xab; 16]);
        assert_eq!(id.to_string(), "ab".repeat(16));
    }
}
