//! Entry point for the echo channel plugin.

use anyhow::Result;
use clap::Parser;
use homelink::channel::echo::EchoChannel;
use homelink::channel::transport::PluginTransport;
use homelink::logging;

#[derive(Debug, Parser)]
#[command(
    name = "homelink-channel-echo",
    version,
    about = "homelink echo channel plugin — reflects messages for testing"
)]
struct Cli {
    /// WebSocket URL of the hub plugin server
    #[arg(
        long = "hub-ws",
        env = "HOMELINK_HUB_WS",
        default_value = "ws://127.0.0.1:18081"
    )]
    hub_ws: String,
    /// Verbose logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut plugin = EchoChannel::new();
    let transport = PluginTransport::new(&cli.hub_ws);
    let stop = transport.stop_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        stop.cancel();
    });
    transport.run(&mut plugin).await
}
