// RELOAD node daemon: link listener, outbound links to configured peers, forwarding worker.

mod config;
mod link;
mod node;
mod transport;

use anyhow::Context;
use reload_core::NodeId;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::node::Node;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("reload-node {}", VERSION);
            return Ok(());
        }
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = config::load()?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let local = cfg
        .node_id
        .clone()
        .unwrap_or_else(|| NodeId::random(cfg.overlay.node_id_length));
    info!(
        version = VERSION,
        node = %local,
        overlay = %cfg.overlay.overlay_name,
        "starting"
    );

    let node = Node::start(
        local,
        cfg.overlay.clone(),
        cfg.link_config(),
        cfg.request_timeout(),
    );

    let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))
        .await
        .with_context(|| format!("binding link port {}", cfg.listen_port))?;
    info!(port = cfg.listen_port, "listening for links");
    tokio::spawn(transport::run_listener(listener, node.clone()));

    for addr in cfg.peers.iter().copied() {
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = transport::connect(addr, node).await {
                warn!(%addr, error = %e, "could not reach peer");
            }
        });
    }

    if let Some(interval) = cfg.ping_interval() {
        tokio::spawn(node::run_keepalive(node.clone(), interval));
    }

    shutdown_signal().await?;
    info!(neighbors = node.neighbors().len(), "shutting down");
    node.shutdown();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
