use anyhow::{Context, Result};
use std::{net::SocketAddr, time::Duration};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use vless_bridge::config::load_config;
use vless_bridge::router::{AppState, TUNNEL_PATH, build_router};

/// How long in-flight connections may drain after a termination signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = load_config()?;
    info!(
        config_file = "config.toml",
        listen_ip = %config.listen.ip,
        listen_port = config.listen.port,
        doh_url = %config.tunnel.doh_url,
        tunnel_path = TUNNEL_PATH,
        "Configuration loaded"
    );

    let state = AppState::new(&config)?;

    let addr = format!("{}:{}", config.listen.ip, config.listen.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;

    info!(
        listen_addr = %addr,
        "VLESS WebSocket bridge listening"
    );

    let app = build_router(state);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
    });

    tokio::select! {
        result = &mut server => {
            result.context("Server task panicked")?.context("Server error")?;
        }
        result = shutdown_signal() => {
            if let Err(e) = result {
                error!(error = %e, "Signal handler failed, shutting down");
            } else {
                info!("Termination signal received, draining connections");
            }
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(DRAIN_TIMEOUT, server).await {
                Ok(result) => result.context("Server task panicked")?.context("Server error")?,
                Err(_) => warn!("Drain timed out, exiting"),
            }
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Resolves when the process receives SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl+C")?,
            _ = terminate.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")
    }
}
