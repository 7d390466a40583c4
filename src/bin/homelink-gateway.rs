//! homelink gateway — run the WebSocket relay server in the foreground.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use homelink::gateway::{self, AuthStore, RelayState};
use homelink::logging;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(
    name = "homelink-gateway",
    version,
    about = "homelink gateway — relay server for paired devices"
)]
struct Cli {
    /// Bind host
    #[arg(long, short = 'H', default_value = "0.0.0.0")]
    host: String,
    /// Bind port
    #[arg(long, short, default_value_t = 8765)]
    port: u16,
    /// Desktop Ed25519 public key (base64). If omitted, the gateway can be
    /// claimed by the first desktop connection.
    #[arg(long, value_name = "KEY")]
    desktop_pubkey: Option<String>,
    /// Directory used to persist gateway auth state
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,
    /// Verbose logging
    #[arg(long, short)]
    verbose: bool,
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".homelink-gateway")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let state_dir = cli.state_dir.unwrap_or_else(default_state_dir);
    let auth = AuthStore::open(
        state_dir.join("gateway_state.json"),
        cli.desktop_pubkey.as_deref(),
    )?;
    if auth.is_claimed() {
        tracing::info!("gateway trust root is configured");
    } else {
        tracing::warn!(
            "gateway trust root is not configured yet; waiting for first desktop claim"
        );
    }

    let state = Arc::new(RelayState::new(auth));
    let listener = TcpListener::bind((cli.host.as_str(), cli.port))
        .await
        .with_context(|| format!("failed to bind gateway to {}:{}", cli.host, cli.port))?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            cancel.cancel();
        });
    }

    gateway::serve(listener, state.clone(), cancel).await?;
    tracing::info!(
        "shutting down; connected devices: {:?}",
        state.connected_devices().await
    );
    Ok(())
}
