//! Configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use crate::protocol::Secret;
use crate::stats::antireplay;
use crate::transport::proxy_dialer::ProxyDialer;
use crate::transport::upstream::{CooldownConfig, PoolConfig, PreferIp, UpstreamConfig};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    pub server: ServerConfig,
    pub access: AccessConfig,
    pub fronting: FrontingConfig,
    pub telegram: TelegramConfig,
    pub pool: PoolSection,
    pub antireplay: AntiReplaySection,
    pub rate_limit: RateLimitSection,
    pub timeouts: TimeoutsSection,
    pub dns: DnsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Worker pool size; connections beyond it are closed on accept.
    pub max_concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:443".parse().expect("static addr"),
            max_concurrency: 8192,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Hex or base64 secret blob: tag, 16-byte key, SNI host.
    pub secret: String,
    pub tolerate_time_skew_secs: u64,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            tolerate_time_skew_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontingConfig {
    /// Port used when splicing rejected clients to the SNI host.
    pub port: u16,
}

impl Default for FrontingConfig {
    fn default() -> Self {
        Self { port: 443 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub prefer_ip: String,
    pub use_test_dcs: bool,
    /// Serve unknown DC ids from a random known DC instead of closing.
    pub allow_fallback_on_unknown_dc: bool,
    /// Retry one other DC when the requested DC does not answer.
    pub fallback_on_dial_error: bool,
    pub dc_config_file: Option<PathBuf>,
    pub dc_refresh_interval_secs: u64,
    /// Optional `socks5://[user:password@]host:port` egress proxy for DC
    /// dials.
    pub outbound_proxy: Option<String>,
    /// Request TCP Fast Open on outbound dials (kernel permitting).
    pub enable_tfo: bool,
    /// Consecutive dial failures before a DC goes on cooldown.
    pub circuit_open_threshold: u32,
    pub circuit_reconnect_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            prefer_ip: "prefer-ipv4".into(),
            use_test_dcs: false,
            allow_fallback_on_unknown_dc: false,
            fallback_on_dial_error: true,
            dc_config_file: None,
            dc_refresh_interval_secs: 24 * 3600,
            outbound_proxy: None,
            enable_tfo: false,
            circuit_open_threshold: 5,
            circuit_reconnect_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub enabled: bool,
    pub max_idle: usize,
    pub idle_timeout_secs: u64,
    pub max_age_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_idle: 5,
            idle_timeout_secs: 20,
            max_age_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiReplaySection {
    pub max_size_bytes: usize,
    pub error_rate: f64,
}

impl Default for AntiReplaySection {
    fn default() -> Self {
        Self {
            max_size_bytes: antireplay::DEFAULT_MAX_SIZE_BYTES,
            error_rate: antireplay::DEFAULT_ERROR_RATE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// Handshakes per second per source address; 0 disables the limiter
    /// (front proxies often collapse many clients into one address).
    pub per_second: f64,
    pub burst: u32,
    pub max_entries: usize,
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            per_second: 0.0,
            burst: 20,
            max_entries: 50_000,
            cleanup_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    pub handshake_secs: u64,
    pub dc_dial_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            handshake_secs: 30,
            dc_dial_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSection {
    pub cache_size: usize,
    pub ttl_secs: u64,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            cache_size: 1000,
            ttl_secs: 300,
        }
    }
}

impl ProxyConfig {
    pub fn load(path: &str) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::InvalidConfig(format!("cannot read {path}: {e}")))?;

        toml::from_str(&data)
            .map_err(|e| ProxyError::InvalidConfig(format!("cannot parse {path}: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        self.parsed_secret()?;
        // Covers ip preference and the outbound proxy url.
        self.upstream_config()?;

        if self.server.max_concurrency == 0 {
            return Err(ProxyError::InvalidConfig(
                "server.max_concurrency must be positive".into(),
            ));
        }

        if self.fronting.port == 0 {
            return Err(ProxyError::InvalidConfig(
                "fronting.port must be positive".into(),
            ));
        }

        if !(0.0..1.0).contains(&self.antireplay.error_rate) || self.antireplay.error_rate <= 0.0 {
            return Err(ProxyError::InvalidConfig(
                "antireplay.error_rate must be within (0, 1)".into(),
            ));
        }

        if self.rate_limit.per_second < 0.0 {
            return Err(ProxyError::InvalidConfig(
                "rate_limit.per_second must not be negative".into(),
            ));
        }

        Ok(())
    }

    pub fn parsed_secret(&self) -> Result<Secret> {
        Secret::parse(&self.access.secret)
    }

    pub fn prefer_ip(&self) -> Result<PreferIp> {
        self.telegram.prefer_ip.parse()
    }

    pub fn tolerate_time_skew(&self) -> Duration {
        Duration::from_secs(self.access.tolerate_time_skew_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.handshake_secs)
    }

    pub fn upstream_config(&self) -> Result<UpstreamConfig> {
        let outbound_proxy = self
            .telegram
            .outbound_proxy
            .as_deref()
            .map(ProxyDialer::from_url)
            .transpose()?;

        Ok(UpstreamConfig {
            prefer_ip: self.prefer_ip()?,
            use_test_dcs: self.telegram.use_test_dcs,
            dial_timeout: Duration::from_secs(self.timeouts.dc_dial_secs),
            pooling_enabled: self.pool.enabled,
            pool: PoolConfig {
                max_idle: self.pool.max_idle,
                idle_timeout: Duration::from_secs(self.pool.idle_timeout_secs),
                max_age: Duration::from_secs(self.pool.max_age_secs),
            },
            dc_config_file: self.telegram.dc_config_file.clone(),
            dc_refresh_interval: Duration::from_secs(self.telegram.dc_refresh_interval_secs),
            outbound_proxy,
            enable_tfo: self.telegram.enable_tfo,
            circuit: CooldownConfig {
                open_threshold: self.telegram.circuit_open_threshold.max(1),
                reconnect_timeout: Duration::from_secs(
                    self.telegram.circuit_reconnect_timeout_secs,
                ),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_secret() -> String {
        let mut blob = vec![0xee];
        blob.extend_from_slice(&[0x11; 16]);
        blob.extend_from_slice(b"example.com");
        hex::encode(blob)
    }

    #[test]
    fn test_defaults_parse_from_empty_toml() {
        let config: ProxyConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.max_concurrency, 8192);
        assert_eq!(config.pool.idle_timeout_secs, 20);
        assert_eq!(config.rate_limit.per_second, 0.0);
        assert_eq!(config.timeouts.handshake_secs, 30);
    }

    #[test]
    fn test_validate_requires_secret() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::default();
        config.access.secret = sample_secret();
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ProxyConfig::default();
        config.access.secret = sample_secret();

        config.antireplay.error_rate = 1.5;
        assert!(config.validate().is_err());
        config.antireplay.error_rate = 0.01;

        config.server.max_concurrency = 0;
        assert!(config.validate().is_err());
        config.server.max_concurrency = 100;

        config.telegram.prefer_ip = "prefer-carrier-pigeon".into();
        assert!(config.validate().is_err());
        config.telegram.prefer_ip = "prefer-ipv4".into();

        config.telegram.outbound_proxy = Some("http://127.0.0.1:8080".into());
        assert!(config.validate().is_err());

        config.telegram.outbound_proxy = Some("socks5://127.0.0.1:1080".into());
        config.validate().unwrap();
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let mut config = ProxyConfig::default();
        config.access.secret = sample_secret();

        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed: ProxyConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.access.secret, config.access.secret);
        assert_eq!(parsed.server.listen, config.server.listen);
    }

    #[test]
    fn test_upstream_config_conversion() {
        let mut config = ProxyConfig::default();
        config.access.secret = sample_secret();
        config.pool.idle_timeout_secs = 7;

        let upstream = config.upstream_config().unwrap();
        assert_eq!(upstream.pool.idle_timeout, Duration::from_secs(7));
        assert!(upstream.pooling_enabled);
    }
}
