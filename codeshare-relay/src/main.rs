// Codeshare relay: issues transfer codes and relays file chunks between sender and receiver.

mod config;
mod relay;

use std::sync::Arc;

use anyhow::Context;
use codeshare_core::{MemoryTransport, SessionManager};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("codeshare-relay {}", VERSION);
            return Ok(());
        }
    }

    init_logging();
    let cfg = config::load();

    let rt = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    rt.block_on(async {
        let transport = Arc::new(MemoryTransport::new(cfg.sessions.lane_capacity));
        let manager = Arc::new(SessionManager::new(cfg.sessions.clone(), transport));
        let reaper = manager.spawn_reaper();

        let addr = cfg.listen_addr();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        tracing::info!(
            version = VERSION,
            max_sessions = cfg.sessions.max_sessions,
            max_file_size = %codeshare_core::format::format_file_size(cfg.sessions.max_file_size),
            "relay starting"
        );

        tokio::select! {
            res = relay::run_relay(listener, manager.clone()) => {
                res.context("relay stopped")?;
            }
            res = shutdown_signal() => {
                res?;
                tracing::info!("shutdown requested");
            }
        }

        reaper.abort();
        manager.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
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
