//! tcpfan
//!
//! Weighted TCP forwarding proxy.
//!
//! This binary:
//! - Loads the backend list from a JSON file (fatal on failure)
//! - Accepts TCP connections and forwards each to a weighted-random backend
//! - Reloads the backend list on signal 34, logs status on signal 35
//! - Reports traffic volume to the configured collector URL
//! - Drains in-flight connections on Ctrl-C before exiting

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tcpfan_backends::ConfigLoader;
use tcpfan_proxy::config::{Args, LogFormat};
use tcpfan_proxy::{
    ActiveConfig, ControlPlane, HttpStatsSink, ProxyServer, ServerContext, StatsAggregator,
};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into());
    match args.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    let name = args.instance_name();
    info!(
        listen = %args.listen,
        name = %name,
        config = %args.config.display(),
        "Starting tcpfan"
    );

    let loader = ConfigLoader::new(args.config.clone());
    let initial = loader.load().context("Load config failed")?;
    let active = ActiveConfig::new(initial);

    let sink = HttpStatsSink::new(active.clone())?;
    let (stats, stats_worker) = StatsAggregator::spawn(name, args.stats_config(), sink);

    let ctx = Arc::new(ServerContext::new(active, stats, args.proxy_settings()));

    let listen_addr = args.listen_addr();
    let server = ProxyServer::bind(listen_addr.as_str(), Arc::clone(&ctx))
        .await
        .with_context(|| format!("Build listener on {listen_addr} failed"))?;

    let (control_tx, control_rx) = mpsc::channel(16);
    tokio::spawn(ControlPlane::new(Arc::clone(&ctx), loader).run(control_rx));

    #[cfg(unix)]
    let _signals = tcpfan_proxy::control::spawn_signal_listener(control_tx.clone())?;

    let result = server.run(shutdown_signal()).await;

    drop(control_tx);
    let totals = stats_worker.shutdown().await;
    info!(
        upload_total = totals.upload,
        download_total = totals.download,
        "Shut down"
    );

    result.context("Accept loop failed")
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for Ctrl-C, running until listener fails");
            std::future::pending::<()>().await;
        }
    }
}
