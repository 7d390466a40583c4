//! homelink CLI — run the hub, manage the daemon, pairing, and devices.

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use homelink::config::Config;
use homelink::{agent, config, daemon, hub, logging, pairing};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(
    name = "homelink",
    version,
    about = "homelink — personal messaging hub"
)]
struct Cli {
    /// App state directory (default ~/.homelink)
    #[arg(long, global = true, value_name = "DIR")]
    app_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the hub server in the foreground
    Run {
        /// Verbose logging
        #[arg(long, short)]
        verbose: bool,
    },
    /// Start the hub as a background daemon
    Start,
    /// Stop the background daemon
    Stop,
    /// Show daemon status
    Status,
    /// Manage the mobile pairing session
    Pair {
        #[command(subcommand)]
        command: PairCommands,
    },
    /// Manage approved devices
    Device {
        #[command(subcommand)]
        command: DeviceCommands,
    },
}

#[derive(Debug, Subcommand)]
enum PairCommands {
    /// Create a new pairing session and print the code
    New {
        /// Session lifetime in seconds
        #[arg(long, default_value_t = pairing::DEFAULT_TTL_SECONDS)]
        ttl: i64,
        /// Number of digits in the code
        #[arg(long, default_value_t = pairing::DEFAULT_CODE_LENGTH)]
        length: usize,
    },
    /// Show the active pairing code and its remaining lifetime
    Show,
    /// Clear the active pairing session
    Clear,
}

#[derive(Debug, Subcommand)]
enum DeviceCommands {
    /// List approved devices
    List,
    /// Remove a device from the approved list
    Revoke { device_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { verbose } => run_foreground(cli.app_dir, verbose).await,
        Commands::Start => start_daemon(cli.app_dir),
        Commands::Stop => stop_daemon(cli.app_dir),
        Commands::Status => show_status(cli.app_dir),
        Commands::Pair { command } => handle_pair(cli.app_dir, command),
        Commands::Device { command } => handle_device(cli.app_dir, command),
    }
}

async fn run_foreground(app_dir: Option<PathBuf>, verbose: bool) -> Result<()> {
    logging::init(verbose);
    let config = Config::load(app_dir)?;
    daemon::PidFile::in_dir(&config.app_dir).write(std::process::id())?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            cancel.cancel();
        });
    }

    let app_dir = config.app_dir.clone();
    let result = hub::run_hub(config, cancel).await;
    daemon::PidFile::in_dir(&app_dir).clear();
    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn start_daemon(app_dir: Option<PathBuf>) -> Result<()> {
    let config = Config::load(app_dir)?;
    let api_key = std::env::var(agent::API_KEY_ENV).ok();
    let pid = daemon::start(&config.app_dir, api_key.as_deref())?;
    println!("Hub started (PID {pid}).");
    println!("Logs: {}", daemon::log_path(&config.app_dir).display());
    Ok(())
}

fn stop_daemon(app_dir: Option<PathBuf>) -> Result<()> {
    let config = Config::load(app_dir)?;
    match daemon::stop(&config.app_dir)? {
        daemon::StopResult::Stopped { pid } => println!("Hub stopped (PID {pid})."),
        daemon::StopResult::WasStale { pid } => {
            println!("Hub was not running; removed stale PID file (PID {pid}).");
        }
        daemon::StopResult::WasNotRunning => println!("Hub is not running."),
    }
    Ok(())
}

fn show_status(app_dir: Option<PathBuf>) -> Result<()> {
    let config = Config::load(app_dir)?;
    match daemon::status(&config.app_dir) {
        daemon::DaemonStatus::Running { pid } => println!("Hub is running (PID {pid})."),
        daemon::DaemonStatus::Stale { pid } => {
            println!("Hub is not running (stale PID file, PID {pid}).");
        }
        daemon::DaemonStatus::Stopped => println!("Hub is not running."),
    }

    let state = config::load_state(&config.app_dir);
    if state.ws_connected {
        println!(
            "Gateway: connected ({})",
            state.gateway_url.as_deref().unwrap_or("?")
        );
    } else {
        println!("Gateway: disconnected");
    }
    if let Some(last) = state.last_connected {
        println!("Last connected: {last}");
    }
    Ok(())
}

fn handle_pair(app_dir: Option<PathBuf>, command: PairCommands) -> Result<()> {
    let config = Config::load(app_dir)?;
    match command {
        PairCommands::New { ttl, length } => {
            let session = pairing::create_pairing_session(length, ttl)?;
            pairing::save_pairing_session(&config.app_dir, &session)?;
            println!("Pairing code: {}", session.code);
            println!("Valid for {} seconds.", session.ttl_seconds);
        }
        PairCommands::Show => match pairing::load_pairing_session(&config.app_dir) {
            Some(session) if session.is_valid(Utc::now()) => {
                println!("Pairing code: {}", session.code);
                println!(
                    "Expires in {} seconds.",
                    session.remaining_seconds(Utc::now())
                );
            }
            Some(_) => {
                pairing::clear_pairing_session(&config.app_dir);
                println!("Pairing session expired.");
            }
            None => println!("No active pairing session."),
        },
        PairCommands::Clear => {
            pairing::clear_pairing_session(&config.app_dir);
            println!("Pairing session cleared.");
        }
    }
    Ok(())
}

fn handle_device(app_dir: Option<PathBuf>, command: DeviceCommands) -> Result<()> {
    let config = Config::load(app_dir)?;
    match command {
        DeviceCommands::List => {
            let devices = pairing::load_approved_devices(&config.app_dir);
            if devices.is_empty() {
                println!("No approved devices.");
                return Ok(());
            }
            for device in devices {
                let expires = device
                    .expires_at
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}  paired {}  expires {}",
                    device.device_id,
                    device.paired_at.to_rfc3339(),
                    expires
                );
            }
        }
        DeviceCommands::Revoke { device_id } => {
            if pairing::revoke_approved_device(&config.app_dir, &device_id)? {
                println!("Device {device_id} revoked.");
            } else {
                println!("Device {device_id} not found.");
            }
        }
    }
    Ok(())
}
