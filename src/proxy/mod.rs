//! Proxy runtime and per-connection pipeline

pub mod admission;
pub mod client;
pub mod masking;
pub mod relay;

pub use client::ClientHandler;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ProxyConfig;
use crate::crypto::SecureRandom;
use crate::error::Result;
use crate::events::{
    Event, EventBus, LogObserver, Observer, StreamId, StreamInfo, StreamTracker,
};
use crate::protocol::Secret;
use crate::proxy::admission::RateLimiter;
use crate::stats::{AntiReplayMetrics, Counter, ReplayChecker, Stats};
use crate::stream::BufferPool;
use crate::transport::dns::{DnsCacheMetrics, Resolver};
use crate::transport::upstream::{PoolStats, UpstreamManager};
use crate::util::IpHasher;

/// Owns every process-wide singleton and their lifecycle: construction at
/// startup, cancellation and draining at shutdown. Nothing in the pipeline
/// reaches for globals; it all flows in from here.
pub struct ProxyRuntime {
    config: Arc<ProxyConfig>,
    secret: Arc<Secret>,
    stats: Arc<Stats>,
    replay_checker: Arc<ReplayChecker>,
    upstream: Arc<UpstreamManager>,
    buffer_pool: Arc<BufferPool>,
    rng: Arc<SecureRandom>,
    events: EventBus,
    resolver: Arc<Resolver>,
    ip_hasher: Arc<IpHasher>,
    rate_limiter: Option<Arc<RateLimiter>>,
    workers: Arc<Semaphore>,
    cancel_tx: watch::Sender<bool>,
    streams: Arc<DashMap<StreamId, StreamInfo>>,
}

impl ProxyRuntime {
    /// Build the runtime and spawn its background tasks. The returned
    /// handles join the event-bus consumers once the last `EventBus`
    /// clone is gone.
    pub async fn new(config: ProxyConfig) -> Result<(Arc<Self>, Vec<JoinHandle<()>>)> {
        config.validate()?;

        let secret = Arc::new(config.parsed_secret()?);
        let rng = Arc::new(SecureRandom::new());
        let stats = Arc::new(Stats::new());

        let replay_checker = Arc::new(ReplayChecker::new(
            config.antireplay.max_size_bytes,
            config.antireplay.error_rate,
        ));

        let upstream = UpstreamManager::new(config.upstream_config()?);

        let buffer_pool = Arc::new(BufferPool::default());

        let resolver = Arc::new(Resolver::new(
            config.dns.cache_size,
            Duration::from_secs(config.dns.ttl_secs),
        ));
        // Resolve the fronting host ahead of the first rejected client.
        resolver.warm_up(&secret.host, config.fronting.port).await;

        let streams = StreamTracker::shared_map();
        let tracker_map = streams.clone();
        let factories: Vec<Box<dyn Fn() -> Box<dyn Observer + Send> + Send + Sync>> = vec![
            Box::new(|| Box::new(LogObserver)),
            Box::new(move || Box::new(StreamTracker::new(tracker_map.clone()))),
        ];
        let (events, consumers) = EventBus::start(&factories, rng.clone());

        let rate_limiter = if config.rate_limit.per_second > 0.0 {
            Some(RateLimiter::new(
                config.rate_limit.per_second,
                config.rate_limit.burst,
                config.rate_limit.max_entries,
                Duration::from_secs(config.rate_limit.cleanup_interval_secs),
            ))
        } else {
            None
        };

        let workers = Arc::new(Semaphore::new(config.server.max_concurrency));
        let (cancel_tx, _) = watch::channel(false);

        let runtime = Arc::new(Self {
            config: Arc::new(config),
            secret,
            stats,
            replay_checker,
            upstream,
            buffer_pool,
            rng,
            events,
            resolver,
            ip_hasher: Arc::new(IpHasher::new()),
            rate_limiter,
            workers,
            cancel_tx,
            streams,
        });

        tokio::spawn(metrics_loop(Arc::clone(&runtime)));

        Ok((runtime, consumers))
    }

    /// Accept loop. Exits cleanly when `shutdown` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut cancel = self.cancel_tx.subscribe();

        loop {
            let accepted = tokio::select! {
                _ = cancel.changed() => return Ok(()),
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            // Worker pool overload: close without doing any work.
            let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
                info!(ip = %self.ip_hasher.hash(peer.ip()), "connection was concurrency limited");
                self.events.send(Event::ConcurrencyLimited).await;
                drop(stream);
                continue;
            };

            let handler = ClientHandler::new(
                stream,
                peer,
                self.config.clone(),
                self.secret.clone(),
                self.stats.clone(),
                self.replay_checker.clone(),
                self.upstream.clone(),
                self.buffer_pool.clone(),
                self.rng.clone(),
                self.events.clone(),
                self.resolver.clone(),
                self.ip_hasher.clone(),
                self.rate_limiter.clone(),
                self.cancel_tx.subscribe(),
            );

            tokio::spawn(async move {
                let _permit = permit;
                // Per-stream errors are logged inside the handler; nothing
                // useful remains to do with them here.
                let _ = handler.run().await;
            });
        }
    }

    /// Cancel the root signal, drain in-flight connections, then stop
    /// background tasks. Event consumers exit once the caller drops the
    /// runtime (and with it the last bus handle).
    pub async fn shutdown(&self) {
        let _ = self.cancel_tx.send(true);

        // Waitgroup equivalent: every connection holds one permit, so
        // acquiring all of them means everything drained.
        let _ = self
            .workers
            .acquire_many(self.config.server.max_concurrency as u32)
            .await;

        self.upstream.close();
        if let Some(limiter) = &self.rate_limiter {
            limiter.stop();
        }
    }

    // Accessors pulled periodically by metric exporters; these do not go
    // through the event bus.

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.upstream.pool_stats()
    }

    pub fn rate_limiter_size(&self) -> usize {
        self.rate_limiter
            .as_ref()
            .map(|limiter| limiter.size())
            .unwrap_or(0)
    }

    pub fn dns_cache_metrics(&self) -> DnsCacheMetrics {
        self.resolver.metrics()
    }

    pub fn antireplay_metrics(&self) -> AntiReplayMetrics {
        self.replay_checker.metrics()
    }

    pub fn event_bus_dropped(&self) -> u64 {
        self.events.dropped()
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }
}

/// Metrics are pulled, not pushed: this loop reads the accessor methods
/// once a minute, publishes the deltas on the event bus and leaves a
/// summary in the log.
async fn metrics_loop(runtime: Arc<ProxyRuntime>) {
    const INTERVAL: Duration = Duration::from_secs(60);

    let mut cancel = runtime.cancel_tx.subscribe();
    let mut ticker = tokio::time::interval(INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    let mut last_pool: Vec<PoolStats> = runtime.pool_stats();
    let mut last_dns: DnsCacheMetrics = runtime.dns_cache_metrics();

    loop {
        tokio::select! {
            _ = cancel.changed() => return,
            _ = ticker.tick() => {}
        }

        let pool = runtime.pool_stats();
        for (current, previous) in pool.iter().zip(last_pool.iter()) {
            runtime
                .events
                .send(Event::PoolMetrics {
                    dc: current.dc,
                    delta_hits: current.hits.saturating_sub(previous.hits),
                    delta_misses: current.misses.saturating_sub(previous.misses),
                    delta_unhealthy: current.unhealthy.saturating_sub(previous.unhealthy),
                    idle: current.idle,
                })
                .await;
        }
        last_pool = pool;

        let dns = runtime.dns_cache_metrics();
        runtime
            .events
            .send(Event::DnsCacheMetrics {
                delta_hits: dns.hits.saturating_sub(last_dns.hits),
                delta_misses: dns.misses.saturating_sub(last_dns.misses),
                delta_evictions: dns.evictions.saturating_sub(last_dns.evictions),
                size: dns.size,
            })
            .await;
        last_dns = dns;

        let antireplay = runtime.antireplay_metrics();
        let stats = runtime.stats();
        info!(
            uptime_secs = stats.uptime().as_secs(),
            connects_all = stats.counter(Counter::Connects),
            connects_bad = stats.counter(Counter::BadClients),
            handshake_timeouts = stats.counter(Counter::HandshakeTimeouts),
            fronted = stats.counter(Counter::Fronted),
            active_streams = runtime.active_streams(),
            rate_limiter_size = runtime.rate_limiter_size(),
            events_dropped = runtime.event_bus_dropped(),
            replay_detected = antireplay.replay_detected,
            antireplay_fill = antireplay.fill_ratio,
            "periodic metrics"
        );
    }
}
