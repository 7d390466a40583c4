//! Hub runtime — wires the router, supervisor, agent worker, and pairing
//! controller together and runs until shutdown.
//!
//! Construction is two-step to avoid a reference cycle: the router is
//! created first, the supervisor gets the router's inbound hook, and the
//! supervisor is handed to the router's outbound worker as a plain sink.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentWorker, HttpDriver};
use crate::config::{self, ChannelConfig, Config};
use crate::crypto;
use crate::pairing::PairingController;
use crate::router::{allow_all, MessageRouter};
use crate::supervisor::{ChannelEvent, PluginSupervisor};

/// How long shutdown waits for the supervisor's stop sequence.
const SHUTDOWN_WINDOW: Duration = Duration::from_secs(3);

/// Keep the mandatory devices channel spawnable: refresh its stored
/// config from the hub's own settings on every start.
pub fn sync_devices_channel_config(config: &Config) -> Result<()> {
    let mut cfg = config::load_channel_config(&config.app_dir, "devices")
        .unwrap_or_else(|| ChannelConfig::new("devices"));
    cfg.config
        .insert("gateway_url".to_string(), json!(config.gateway_url));
    cfg.config
        .insert("device_id".to_string(), json!(config.device_id));
    cfg.config
        .insert("ping_interval".to_string(), json!(config.ping_interval));
    cfg.config.insert(
        "master_key_path".to_string(),
        json!(config.master_key_path().to_string_lossy()),
    );
    config::save_channel_config(&config.app_dir, &cfg)
}

/// Run the hub until `cancel` fires.
pub async fn run_hub(config: Config, cancel: CancellationToken) -> Result<()> {
    let signing_key = crypto::load_or_create_master_key(&config.app_dir, &config.master_key_file)?;
    sync_devices_channel_config(&config)?;

    let listener = TcpListener::bind(("127.0.0.1", config.plugin_port))
        .await
        .with_context(|| {
            format!(
                "failed to bind plugin server to 127.0.0.1:{}",
                config.plugin_port
            )
        })?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ChannelEvent>();
    let router = Arc::new(MessageRouter::new(allow_all()));
    let supervisor = Arc::new(PluginSupervisor::new(&config, router.clone(), event_tx));

    let agent_config = config::load_agent_config(&config.app_dir);
    let system_prompt = config::load_system_prompt(&config.app_dir);
    let driver = Arc::new(HttpDriver::new(agent_config, system_prompt));
    let inbound = router
        .take_inbound()
        .await
        .context("inbound queue already taken")?;
    let worker = AgentWorker::new(driver, router.clone());

    let pairing = PairingController::new(
        signing_key,
        config.app_dir.clone(),
        config.attestation_expires_days,
    );

    tracing::info!(
        "starting hub: plugin ws {}  device_id {}",
        config.plugin_ws_url(),
        config.device_id
    );

    let supervisor_task = tokio::spawn(supervisor.clone().run(listener, cancel.child_token()));
    let outbound_task = {
        let router = router.clone();
        let sink = supervisor.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move { router.run_outbound(sink, cancel).await })
    };
    let agent_task = {
        let cancel = cancel.child_token();
        tokio::spawn(async move { worker.run(inbound, cancel).await })
    };

    // Event loop: connection state bookkeeping plus the pairing path.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                handle_event(&config, &pairing, &supervisor, event).await;
            }
        }
    }

    // Give the supervisor its stop window, then collect the workers.
    if tokio::time::timeout(SHUTDOWN_WINDOW, supervisor_task)
        .await
        .is_err()
    {
        tracing::warn!("supervisor did not stop within the shutdown window");
    }
    let _ = tokio::time::timeout(Duration::from_secs(1), outbound_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), agent_task).await;

    config::mark_disconnected(&config.app_dir);
    tracing::info!("hub exited");
    Ok(())
}

async fn handle_event(
    config: &Config,
    pairing: &PairingController,
    supervisor: &Arc<PluginSupervisor>,
    event: ChannelEvent,
) {
    match event.event.as_str() {
        "gateway_connected" => {
            let url = event
                .data
                .get("gateway_url")
                .and_then(Value::as_str)
                .unwrap_or(&config.gateway_url);
            config::mark_connected(&config.app_dir, url);
        }
        "gateway_disconnected" => config::mark_disconnected(&config.app_dir),
        "pairing_request" => {
            if let Some(response) = pairing.handle_request(&event.data) {
                supervisor
                    .send_event_to_channel("devices", "pairing_response", response)
                    .await;
            }
        }
        other => {
            tracing::debug!("unhandled channel event '{other}' from {}", event.channel);
        }
    }
}
