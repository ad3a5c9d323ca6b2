//! Event observers

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, info};

use super::{Event, StreamId};

/// Fixed capability set of an event consumer. Every method has a no-op
/// default so observers implement only what they care about.
pub trait Observer {
    fn on_start(&mut self, _stream_id: StreamId, _remote_ip: IpAddr) {}
    fn on_connected_to_dc(&mut self, _stream_id: StreamId, _remote_ip: IpAddr, _dc: i16) {}
    fn on_traffic(&mut self, _stream_id: StreamId, _bytes: u64, _is_read: bool) {}
    fn on_finish(&mut self, _stream_id: StreamId) {}
    fn on_domain_fronting(&mut self, _stream_id: StreamId) {}
    fn on_concurrency_limited(&mut self) {}
    fn on_ip_listed(&mut self, _remote_ip: IpAddr, _is_blocklist: bool) {}
    fn on_replay_attack(&mut self, _stream_id: StreamId) {}
    fn on_ip_list_size(&mut self, _size: usize, _is_blocklist: bool) {}
    fn on_dns_cache_metrics(
        &mut self,
        _delta_hits: u64,
        _delta_misses: u64,
        _delta_evictions: u64,
        _size: usize,
    ) {
    }
    fn on_pool_metrics(
        &mut self,
        _dc: i16,
        _delta_hits: u64,
        _delta_misses: u64,
        _delta_unhealthy: u64,
        _idle: usize,
    ) {
    }
    fn on_shutdown(&mut self) {}

    /// Dispatch one event to the matching capability.
    fn handle(&mut self, event: &Event) {
        match *event {
            Event::Start {
                stream_id,
                remote_ip,
            } => self.on_start(stream_id, remote_ip),
            Event::ConnectedToDc {
                stream_id,
                remote_ip,
                dc,
            } => self.on_connected_to_dc(stream_id, remote_ip, dc),
            Event::Traffic {
                stream_id,
                bytes,
                is_read,
            } => self.on_traffic(stream_id, bytes, is_read),
            Event::Finish { stream_id } => self.on_finish(stream_id),
            Event::DomainFronting { stream_id } => self.on_domain_fronting(stream_id),
            Event::ConcurrencyLimited => self.on_concurrency_limited(),
            Event::ReplayAttack { stream_id } => self.on_replay_attack(stream_id),
            Event::IpListed {
                remote_ip,
                is_blocklist,
            } => self.on_ip_listed(remote_ip, is_blocklist),
            Event::IpListSize { size, is_blocklist } => {
                self.on_ip_list_size(size, is_blocklist)
            }
            Event::DnsCacheMetrics {
                delta_hits,
                delta_misses,
                delta_evictions,
                size,
            } => self.on_dns_cache_metrics(delta_hits, delta_misses, delta_evictions, size),
            Event::PoolMetrics {
                dc,
                delta_hits,
                delta_misses,
                delta_unhealthy,
                idle,
            } => self.on_pool_metrics(dc, delta_hits, delta_misses, delta_unhealthy, idle),
        }
    }
}

/// Dispatches every event to a list of observers in order.
pub struct MultiObserver {
    observers: Vec<Box<dyn Observer + Send>>,
}

impl MultiObserver {
    pub fn new(observers: Vec<Box<dyn Observer + Send>>) -> Self {
        Self { observers }
    }
}

impl Observer for MultiObserver {
    fn handle(&mut self, event: &Event) {
        for observer in self.observers.iter_mut() {
            observer.handle(event);
        }
    }

    fn on_shutdown(&mut self) {
        for observer in self.observers.iter_mut() {
            observer.on_shutdown();
        }
    }
}

/// Structured-log observer for the rare, security-relevant events.
pub struct LogObserver;

impl Observer for LogObserver {
    fn on_replay_attack(&mut self, stream_id: StreamId) {
        info!(stream_id = %stream_id, "replay attack detected");
    }

    fn on_domain_fronting(&mut self, stream_id: StreamId) {
        debug!(stream_id = %stream_id, "connection routed to fronting domain");
    }

    fn on_concurrency_limited(&mut self) {
        info!("connection rejected by concurrency limit");
    }

    fn on_ip_listed(&mut self, remote_ip: IpAddr, is_blocklist: bool) {
        debug!(ip = %remote_ip, blocklist = is_blocklist, "ip matched an ip list");
    }

    fn on_shutdown(&mut self) {
        debug!("event stream shut down");
    }
}

#[derive(Debug, Default)]
pub struct StreamInfo {
    pub started_at: Option<Instant>,
    pub dc: Option<i16>,
    pub bytes_to_client: u64,
    pub bytes_from_client: u64,
    pub domain_fronted: bool,
}

/// Tracks live streams. The map is shared between the per-shard instances
/// and whoever pulls aggregate numbers; per-stream entries are only ever
/// touched from the owning shard consumer because events of one stream
/// always hash to the same shard.
pub struct StreamTracker {
    streams: Arc<DashMap<StreamId, StreamInfo>>,
}

impl StreamTracker {
    pub fn new(streams: Arc<DashMap<StreamId, StreamInfo>>) -> Self {
        Self { streams }
    }

    pub fn shared_map() -> Arc<DashMap<StreamId, StreamInfo>> {
        Arc::new(DashMap::new())
    }
}

impl Observer for StreamTracker {
    fn on_start(&mut self, stream_id: StreamId, _remote_ip: IpAddr) {
        self.streams.insert(
            stream_id,
            StreamInfo {
                started_at: Some(Instant::now()),
                ..Default::default()
            },
        );
    }

    fn on_connected_to_dc(&mut self, stream_id: StreamId, _remote_ip: IpAddr, dc: i16) {
        if let Some(mut info) = self.streams.get_mut(&stream_id) {
            info.dc = Some(dc);
        }
    }

    fn on_traffic(&mut self, stream_id: StreamId, bytes: u64, is_read: bool) {
        if let Some(mut info) = self.streams.get_mut(&stream_id) {
            if is_read {
                info.bytes_to_client += bytes;
            } else {
                info.bytes_from_client += bytes;
            }
        }
    }

    fn on_domain_fronting(&mut self, stream_id: StreamId) {
        if let Some(mut info) = self.streams.get_mut(&stream_id) {
            info.domain_fronted = true;
        }
    }

    fn on_finish(&mut self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
    }
}
