//! Telegram upstream connection management

mod address_book;
mod circuit_breaker;
mod pool;

pub use address_book::{
    parse_dc_config, production_table, test_table, AddressBook, AddressTable, PreferIp,
    KNOWN_DCS,
};
pub use circuit_breaker::{CooldownConfig, CooldownGate};
pub use pool::{DcPool, LeasedConn, PoolConfig, PoolStats};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};
use crate::transport::dial;
use crate::transport::proxy_dialer::ProxyDialer;

/// Minimum refresh cadence for the DC address file.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub prefer_ip: PreferIp,
    pub use_test_dcs: bool,
    pub dial_timeout: Duration,
    pub pooling_enabled: bool,
    pub pool: PoolConfig,
    pub dc_config_file: Option<PathBuf>,
    pub dc_refresh_interval: Duration,
    /// Route DC dials through a SOCKS5 proxy instead of connecting
    /// directly.
    pub outbound_proxy: Option<ProxyDialer>,
    /// Ask for TCP Fast Open on direct DC dials.
    pub enable_tfo: bool,
    pub circuit: CooldownConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            prefer_ip: PreferIp::PreferIpv4,
            use_test_dcs: false,
            dial_timeout: Duration::from_secs(10),
            pooling_enabled: true,
            pool: PoolConfig::default(),
            dc_config_file: None,
            dc_refresh_interval: Duration::from_secs(24 * 3600),
            outbound_proxy: None,
            enable_tfo: false,
            circuit: CooldownConfig::default(),
        }
    }
}

/// Dials Telegram datacenters, reusing pooled connections when enabled,
/// and keeps the address book fresh in the background.
pub struct UpstreamManager {
    address_book: AddressBook,
    pools: Vec<Arc<DcPool>>,
    gates: Vec<CooldownGate>,
    config: UpstreamConfig,
    stop_tx: watch::Sender<bool>,
}

impl UpstreamManager {
    pub fn new(config: UpstreamConfig) -> Arc<Self> {
        let table = if config.use_test_dcs {
            test_table()
        } else {
            production_table()
        };

        let pools = (1..=KNOWN_DCS)
            .map(|dc| DcPool::new(dc, config.pool.clone()))
            .collect();

        // One dial gate per DC: an unreachable DC cools down on its own
        // without affecting the others.
        let gates = (1..=KNOWN_DCS)
            .map(|_| CooldownGate::new(config.circuit.clone()))
            .collect();

        let (stop_tx, _) = watch::channel(false);

        let manager = Arc::new(Self {
            address_book: AddressBook::new(table, config.prefer_ip),
            pools,
            gates,
            config,
            stop_tx,
        });

        manager.spawn_background_tasks();
        manager
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        if self.config.pooling_enabled {
            tokio::spawn(sweep_loop(Arc::clone(self), self.stop_tx.subscribe()));
        }

        if self.config.dc_config_file.is_some() {
            tokio::spawn(refresh_loop(Arc::clone(self), self.stop_tx.subscribe()));
        }
    }

    pub fn is_known_dc(&self, dc: i16) -> bool {
        self.address_book.is_known_dc(dc)
    }

    pub fn fallback_dc(&self) -> i16 {
        self.address_book.random_dc()
    }

    pub fn fallback_dc_excluding(&self, exclude: i16) -> i16 {
        self.address_book.random_dc_excluding(exclude)
    }

    /// Lease a connection to `dc`, from the pool when one is warm.
    pub async fn connect(&self, dc: i16) -> Result<LeasedConn> {
        if !self.config.pooling_enabled {
            return Ok(LeasedConn::direct(self.dial_dc(dc).await?));
        }

        let pool = self.pool_for(dc)?;

        if let Some((stream, created_at)) = pool.get() {
            return Ok(LeasedConn::pooled(stream, created_at, pool));
        }

        let stream = self.dial_dc(dc).await?;
        pool.record_created();
        Ok(LeasedConn::pooled(stream, Instant::now(), pool))
    }

    /// Fresh dial bypassing the pool, for the broken-pipe retry after a
    /// stale pooled connection died on first use.
    pub async fn connect_direct(&self, dc: i16) -> Result<LeasedConn> {
        Ok(LeasedConn::direct(self.dial_dc(dc).await?))
    }

    async fn dial_dc(&self, dc: i16) -> Result<tokio::net::TcpStream> {
        let gate = self.gate_for(dc)?;
        if !gate.permits() {
            return Err(ProxyError::CircuitOpen(dc));
        }

        let addresses = self.address_book.addresses(dc);
        if addresses.is_empty() {
            return Err(ProxyError::NoAddresses(dc));
        }

        let mut last_err = None;
        for addr in addresses {
            let attempt = match &self.config.outbound_proxy {
                Some(proxy) => proxy.connect(addr, self.config.dial_timeout).await,
                None => dial(addr, self.config.dial_timeout, self.config.enable_tfo).await,
            };

            match attempt {
                Ok(stream) => {
                    gate.record_success();
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(dc = dc, addr = %addr, error = %e, "dial attempt failed");
                    last_err = Some(e);
                }
            }
        }

        gate.record_failure();

        Err(ProxyError::DcUnreachable {
            dc,
            source: last_err.expect("at least one address was tried"),
        })
    }

    fn pool_for(&self, dc: i16) -> Result<Arc<DcPool>> {
        if !(1..=KNOWN_DCS).contains(&dc) {
            return Err(ProxyError::UnknownDc(dc));
        }
        Ok(Arc::clone(&self.pools[(dc - 1) as usize]))
    }

    fn gate_for(&self, dc: i16) -> Result<&CooldownGate> {
        if !(1..=KNOWN_DCS).contains(&dc) {
            return Err(ProxyError::UnknownDc(dc));
        }
        Ok(&self.gates[(dc - 1) as usize])
    }

    /// Swap in a freshly parsed address table; the built-in table stays
    /// untouched as the fallback.
    pub fn update_address_table(&self, table: AddressTable) {
        self.address_book.update(table);
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(|pool| pool.stats()).collect()
    }

    /// Stop background tasks and close every pool.
    pub fn close(&self) {
        let _ = self.stop_tx.send(true);
        for pool in &self.pools {
            pool.close();
        }
    }
}

async fn sweep_loop(manager: Arc<UpstreamManager>, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(manager.config.pool.sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = ticker.tick() => {
                for pool in &manager.pools {
                    pool.sweep();
                }
            }
        }
    }
}

async fn refresh_loop(manager: Arc<UpstreamManager>, mut stop_rx: watch::Receiver<bool>) {
    let path = manager
        .config
        .dc_config_file
        .clone()
        .expect("refresh loop spawned only with a config file");
    let interval = manager.config.dc_refresh_interval.max(MIN_REFRESH_INTERVAL);

    // Initial load before the first tick; errors keep the built-in table.
    refresh_once(&manager, &path).await;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = ticker.tick() => refresh_once(&manager, &path).await,
        }
    }
}

async fn refresh_once(manager: &UpstreamManager, path: &std::path::Path) {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read DC config file, keeping current table");
            return;
        }
    };

    match parse_dc_config(&data) {
        Ok(table) => {
            manager.update_address_table(table);
            debug!(path = %path.display(), "DC address table refreshed");
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot parse DC config file, keeping current table");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn local_manager(pooling: bool) -> (Arc<UpstreamManager>, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
                });
            }
        });

        let manager = UpstreamManager::new(UpstreamConfig {
            pooling_enabled: pooling,
            dial_timeout: Duration::from_secs(2),
            ..Default::default()
        });

        // Point every DC at the local sink.
        let json = format!(
            r#"{{"v4": {{"1": ["{addr}"], "2": ["{addr}"], "3": ["{addr}"], "4": ["{addr}"], "5": ["{addr}"]}}}}"#
        );
        manager
            .address_book
            .update(parse_dc_config(json.as_bytes()).unwrap());

        (manager, addr)
    }

    #[tokio::test]
    async fn test_warm_pool_hit_after_return() {
        let (manager, _) = local_manager(true).await;

        let lease = manager.connect(2).await.unwrap();
        drop(lease); // back into the pool

        let lease = manager.connect(2).await.unwrap();
        drop(lease);

        let stats = &manager.pool_stats()[1];
        assert_eq!(stats.dc, 2);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.hits, 1);
        manager.close();
    }

    #[tokio::test]
    async fn test_unwrap_prevents_reuse() {
        let (manager, _) = local_manager(true).await;

        let lease = manager.connect(3).await.unwrap();
        let raw = lease.unwrap();
        drop(raw);

        let stats = &manager.pool_stats()[2];
        assert_eq!(stats.idle, 0);

        let _second = manager.connect(3).await.unwrap();
        let stats = &manager.pool_stats()[2];
        assert_eq!(stats.created, 2);
        manager.close();
    }

    #[tokio::test]
    async fn test_pooling_disabled_always_dials() {
        let (manager, _) = local_manager(false).await;

        drop(manager.connect(1).await.unwrap());
        drop(manager.connect(1).await.unwrap());

        let stats = &manager.pool_stats()[0];
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.idle, 0);
        manager.close();
    }

    #[tokio::test]
    async fn test_unreachable_dc_reports_last_error() {
        let manager = UpstreamManager::new(UpstreamConfig {
            dial_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        let json = r#"{"v4": {"2": ["192.0.2.1:443"]}}"#;
        manager
            .address_book
            .update(parse_dc_config(json.as_bytes()).unwrap());

        let err = manager.connect(2).await.unwrap_err();
        assert!(matches!(err, ProxyError::DcUnreachable { dc: 2, .. }));

        let err = manager.connect(1).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoAddresses(1)));
        manager.close();
    }

    #[tokio::test]
    async fn test_circuit_breaker_cools_down_unreachable_dc() {
        let manager = UpstreamManager::new(UpstreamConfig {
            dial_timeout: Duration::from_millis(50),
            circuit: CooldownConfig {
                open_threshold: 1,
                reconnect_timeout: Duration::from_secs(60),
            },
            ..Default::default()
        });
        let json = r#"{"v4": {"2": ["192.0.2.1:443"]}}"#;
        manager
            .address_book
            .update(parse_dc_config(json.as_bytes()).unwrap());

        let err = manager.connect(2).await.unwrap_err();
        assert!(matches!(err, ProxyError::DcUnreachable { dc: 2, .. }));

        // The gate opened: the next attempt fails fast, no connect timeout.
        let started = std::time::Instant::now();
        let err = manager.connect(2).await.unwrap_err();
        assert!(matches!(err, ProxyError::CircuitOpen(2)));
        assert!(started.elapsed() < Duration::from_millis(40));

        // Other DCs are unaffected.
        let err = manager.connect(1).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoAddresses(1)));
        manager.close();
    }

    #[tokio::test]
    async fn test_outbound_proxy_path_is_used() {
        // A sink the DC table points at; a direct dial would succeed.
        let (direct, sink_addr) = local_manager(false).await;
        direct.close();

        let manager = UpstreamManager::new(UpstreamConfig {
            pooling_enabled: false,
            dial_timeout: Duration::from_millis(300),
            outbound_proxy: Some(
                ProxyDialer::from_url("socks5://127.0.0.1:1").unwrap(),
            ),
            ..Default::default()
        });
        let json = format!(r#"{{"v4": {{"1": ["{sink_addr}"]}}}}"#);
        manager
            .address_book
            .update(parse_dc_config(json.as_bytes()).unwrap());

        // The dead SOCKS endpoint proves the dial went through the proxy
        // path rather than straight to the sink.
        let err = manager.connect(1).await.unwrap_err();
        assert!(matches!(err, ProxyError::DcUnreachable { dc: 1, .. }));
        manager.close();
    }
}
