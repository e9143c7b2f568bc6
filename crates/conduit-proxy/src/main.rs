mod auth;
mod backend;
mod command;
mod config;
mod error;
mod events;
mod forwarding;
mod ping;
mod players;
mod proxy;
mod query;
mod ratelimit;
mod servers;
mod session;
mod wire;

use std::path::PathBuf;
use std::process::ExitCode;

use config::ProxyConfig;
use proxy::Proxy;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("velocity.toml"));

    let config = match ProxyConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!("could not load {}: {err}", config_path.display());
            return ExitCode::from(1);
        }
    };

    let proxy = match Proxy::new(config) {
        Ok(proxy) => proxy,
        Err(err) => {
            error!("startup failed: {err:#}");
            return ExitCode::from(1);
        }
    };

    info!("starting Conduit proxy");

    let shutdown = proxy.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    match proxy.run().await {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("proxy failed: {err:#}");
            ExitCode::from(1)
        }
    }
}
