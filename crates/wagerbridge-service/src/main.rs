use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use wagerbridge_core::WagerBridgeConfig;
use wagerbridge_service::{build_router, state::AppState};

#[derive(Debug, Parser)]
#[command(name = "wagerbridged", version, about = "WagerBridge integration platform service")]
struct Cli {
    /// Path (without extension) to a config file layered over the defaults.
    #[arg(long, env = "WAGERBRIDGE_CONFIG_PATH")]
    config: Option<String>,
    /// Override the bind address from the resolved configuration.
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "wagerbridge_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let config = WagerBridgeConfig::load(cli.config.as_deref())?;
    let listen = match cli.listen {
        Some(addr) => addr,
        None => format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .expect("invalid server.host/server.port in resolved configuration"),
    };

    let state = Arc::new(AppState::bootstrap(config).await?);
    let app = build_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("wagerbridge-service listening on {}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, draining in-flight requests");
}
