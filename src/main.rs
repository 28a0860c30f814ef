//! discovery-proxy - Main Entry Point
//!
//! Forward HTTP(S) proxy backed by registry-based service discovery

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use discovery_proxy::discovery::{CatalogConfig, NacosRegistry, Selector, ServiceCatalog};
use discovery_proxy::proxy::ProxyFrontend;
use discovery_proxy::Config;

/// Forward HTTP/HTTPS proxy with registry-backed service discovery
#[derive(Debug, Parser)]
#[command(name = "discovery-proxy", version, about)]
struct Cli {
    /// Registry namespace id
    #[arg(long)]
    namespace: String,

    /// Registry group name
    #[arg(long)]
    group: String,

    /// Registry cluster name
    #[arg(long)]
    cluster: String,

    /// Comma-separated registry nodes, ip:port
    #[arg(long)]
    nodes: String,

    /// Proxy listen address, e.g. 0.0.0.0:1080
    #[arg(long)]
    listen: String,

    /// Attempts per proxied request
    #[arg(long, default_value_t = 3)]
    retry: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let file_appender = tracing_appender::rolling::daily("logs", "discovery-proxy.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,discovery_proxy=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .pretty(),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).json())
        .init();

    let cli = Cli::parse();
    let config = Config::new(
        cli.namespace,
        cli.group,
        cli.cluster,
        &cli.nodes,
        cli.listen,
        cli.retry,
    )?;
    tracing::info!(
        listen = %config.listen_addr,
        retry = config.retry_times,
        registry_nodes = config.registry.nodes.len(),
        "configuration loaded"
    );

    let registry = Arc::new(NacosRegistry::new(config.registry.clone())?);
    let catalog = Arc::new(ServiceCatalog::new(
        registry,
        config.registry.group.clone(),
        CatalogConfig::default(),
    ));
    let selector = Arc::new(Selector::new(catalog.clone()));

    let shutdown = CancellationToken::new();
    let frontend = ProxyFrontend::bind(
        &config.listen_addr,
        config.retry_times,
        selector,
        shutdown.child_token(),
    )
    .await?;

    tokio::select! {
        result = frontend.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
    }

    // Stop the refreshers and wait for them before exiting.
    shutdown.cancel();
    catalog.shutdown().await;
    Ok(())
}
