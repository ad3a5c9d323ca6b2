//! telefront - MTPROTO proxy with FakeTLS camouflage

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

mod config;
mod crypto;
mod error;
mod events;
mod protocol;
mod proxy;
mod stats;
mod stream;
mod transport;
mod util;

use crate::config::ProxyConfig;
use crate::proxy::ProxyRuntime;
use crate::transport::{create_listener, ListenOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = match ProxyConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            // If config doesn't exist, create a default one to edit.
            if std::path::Path::new(&config_path).exists() {
                error!("Failed to load config: {}", e);
                std::process::exit(1);
            } else {
                let default = ProxyConfig::default();
                let toml = toml::to_string_pretty(&default).unwrap();
                std::fs::write(&config_path, toml).unwrap();
                info!("Created default config at {}, set access.secret and restart", config_path);
                std::process::exit(1);
            }
        }
    };

    config.validate()?;

    let secret = config.parsed_secret()?;
    info!("=== Configuration Loaded ===");
    info!("SNI / fronting host: {}", secret.host);
    info!("Fronting port: {}", config.fronting.port);
    info!("Listen address: {}", config.server.listen);
    info!("Connection pooling: {}", config.pool.enabled);
    info!(
        "Rate limiting: {}",
        if config.rate_limit.per_second > 0.0 {
            "enabled"
        } else {
            "disabled"
        }
    );
    info!(
        "Proxy link: tg://proxy?server={}&port={}&secret={}",
        config.server.listen.ip(),
        config.server.listen.port(),
        config.access.secret
    );
    info!("============================");

    let listener = create_listener(config.server.listen, &ListenOptions::default())?;
    let listener = TcpListener::from_std(listener)?;
    info!("Listening on {}", config.server.listen);

    let (runtime, event_consumers) = ProxyRuntime::new(config).await?;

    let serve = tokio::spawn(runtime.clone().serve(listener));

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Signal error: {}", e),
    }

    runtime.shutdown().await;

    if let Ok(Err(e)) = serve.await {
        error!("Serve loop error: {}", e);
    }

    // The last bus handle lives in the runtime; dropping it lets the
    // event consumers drain and exit.
    drop(runtime);
    for consumer in event_consumers {
        let _ = consumer.await;
    }

    info!("Shutdown complete");
    Ok(())
}
