use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use cache_proxy::{
    config::{self, LoggingConfig},
    telemetry, CacheStore, CliArgs, FileConfig, ProxyConfig, RedisStore, STORE_CONNECT_TIMEOUT,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse();

    let file = match &cli.config_file {
        Some(path) => FileConfig::load(path).await?,
        None => FileConfig::default(),
    };

    telemetry::init(&LoggingConfig::resolve(&file, &cli)?)?;

    if cli.clear_cache {
        return clear_cache(&config::store_url(&file, &cli)).await;
    }

    let config = ProxyConfig::resolve(&file, &cli)?;

    let store = RedisStore::connect(&config.store_url, STORE_CONNECT_TIMEOUT)
        .await
        .context("unable to reach cache store")?;

    let addr: SocketAddr = format!("{}:{}", config.listen, config.port)
        .parse()
        .context("invalid listen address")?;
    let listener = TcpListener::bind(addr).await.context("failed to bind to address")?;

    info!(
        port = config.port,
        origin = %config.origin,
        max_age = ?config.max_age,
        "proxy server starting"
    );

    let report = cache_proxy::serve(config, Arc::new(store.clone()), listener, shutdown_signal())
        .await
        .context("server failed")?;
    info!(
        written = report.written,
        failed = report.failed,
        abandoned = report.abandoned,
        "write-back totals"
    );

    if let Err(e) = store.quit().await {
        warn!(error = %e, "failed to close cache store connection");
    }
    Ok(())
}

async fn clear_cache(store_url: &str) -> Result<()> {
    let store = RedisStore::connect(store_url, STORE_CONNECT_TIMEOUT)
        .await
        .context("unable to reach cache store")?;
    store.flush_all().await.context("failed to clear cache")?;
    info!("cache cleared");
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for SIGINT: {:?}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to create SIGTERM handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    select! {
        _ = terminate => info!("Received SIGTERM"),
        _ = interrupt => info!("Received SIGINT"),
    }
}
