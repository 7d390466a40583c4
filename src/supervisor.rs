//! Plugin supervisor — the hub-side orchestrator for channel plugins.
//!
//! Runs a loopback WebSocket server, spawns a detached subprocess for each
//! enabled channel, and speaks JSON-RPC with whatever connects back:
//! `channel.receive` notifications feed the router, `channel.event` feeds
//! the hub event sink, and the outbound API pushes `channel.send` /
//! `channel.configure` / `channel.event` notifications (plus the one
//! request/response pair, `channel.status`). On shutdown every plugin gets
//! a `channel.stop`, then surviving children are terminated.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::{self, ChannelConfig, Config};
use crate::message::ChannelInfo;
use crate::router::{MessageRouter, OutboundSink};
use crate::rpc::{self, RpcFrame};

/// Timeout for the `channel.status` probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace period between `channel.stop` and child termination.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// A `channel.event` notification surfaced to the hub.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub channel: String,
    pub event: String,
    pub data: Value,
}

struct ConnectedChannel {
    info: ChannelInfo,
    conn_id: u64,
    tx: mpsc::UnboundedSender<String>,
    pending: HashMap<String, oneshot::Sender<Result<Value, String>>>,
}

pub struct PluginSupervisor {
    app_dir: PathBuf,
    ws_url: String,
    channels: Mutex<HashMap<String, ConnectedChannel>>,
    children: Mutex<Vec<Child>>,
    router: Arc<MessageRouter>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    conn_counter: AtomicU64,
}

impl PluginSupervisor {
    pub fn new(
        config: &Config,
        router: Arc<MessageRouter>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            app_dir: config.app_dir.clone(),
            ws_url: config.plugin_ws_url(),
            channels: Mutex::new(HashMap::new()),
            children: Mutex::new(Vec::new()),
            router,
            events,
            conn_counter: AtomicU64::new(1),
        }
    }

    /// Serve plugin connections until cancelled, then run the shutdown
    /// sequence (`channel.stop` → grace → terminate).
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<()> {
        tracing::info!("plugin server listening on ws://{}", listener.local_addr()?);
        self.spawn_channels().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let supervisor = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = supervisor.handle_connection(stream).await {
                            tracing::warn!("plugin connection error: {err:#}");
                        }
                    });
                }
            }
        }

        self.shutdown_channels().await;
        tracing::info!("plugin server stopped");
        Ok(())
    }

    // ── Subprocess management ───────────────────────────────────────────

    async fn spawn_channels(&self) {
        let channels = config::list_enabled_channels(&self.app_dir);
        if channels.is_empty() {
            tracing::info!("no enabled channel plugins configured");
            return;
        }
        for cfg in channels {
            self.spawn_one(&cfg).await;
        }
    }

    async fn spawn_one(&self, cfg: &ChannelConfig) {
        let mut parts = cfg.effective_command();
        parts.push("--hub-ws".to_string());
        parts.push(self.ws_url.clone());
        tracing::info!("spawning channel plugin: {} → {:?}", cfg.name, parts);

        let log_path = self
            .app_dir
            .join("logs")
            .join(format!("plugin-{}.log", cfg.name));
        let stdio = plugin_log_stdio(&log_path);

        let mut command = Command::new(&parts[0]);
        command.args(&parts[1..]);
        if !cfg.workspace_dir.is_empty() {
            command.current_dir(&cfg.workspace_dir);
        }
        match stdio {
            Some((out, err)) => {
                command.stdout(out).stderr(err);
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        crate::daemon::detach(&mut command);

        match command.spawn() {
            Ok(child) => self.children.lock().await.push(child),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::error!(
                    "channel command not found: {}. Is the '{}' plugin installed and on PATH?",
                    parts[0],
                    cfg.name
                );
            }
            Err(err) => {
                tracing::error!("failed to spawn channel '{}': {err}", cfg.name);
            }
        }
    }

    async fn shutdown_channels(&self) {
        {
            let channels = self.channels.lock().await;
            for channel in channels.values() {
                let _ = channel
                    .tx
                    .send(rpc::notification("channel.stop", json!({})));
            }
        }

        // Give plugins a moment to exit on their own, then terminate.
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        let mut children = self.children.lock().await;
        for child in children.iter_mut() {
            match child.try_wait() {
                Ok(Some(_)) => {}
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                }
            }
        }
        children.clear();
    }

    // ── Plugin connection handling ──────────────────────────────────────

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut sink, mut reader) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(Message::text(frame)).await.is_err() {
                    break;
                }
            }
        });

        let conn_id = self.conn_counter.fetch_add(1, Ordering::Relaxed);
        let mut channel_name: Option<String> = None;

        while let Some(frame) = reader.next().await {
            let msg = match frame {
                Ok(msg) => msg,
                Err(_) => break,
            };
            let raw = match msg {
                Message::Text(raw) => raw,
                Message::Close(_) => break,
                _ => continue,
            };
            self.handle_frame(&mut channel_name, conn_id, &tx, raw.as_str())
                .await;
        }

        if let Some(name) = channel_name {
            let mut channels = self.channels.lock().await;
            if channels.get(&name).is_some_and(|c| c.conn_id == conn_id) {
                if let Some(mut channel) = channels.remove(&name) {
                    for (_, waiter) in channel.pending.drain() {
                        let _ = waiter.send(Err("channel disconnected".to_string()));
                    }
                }
                tracing::info!("channel disconnected: {name}");
            }
        }
        writer_task.abort();
        Ok(())
    }

    async fn handle_frame(
        &self,
        channel_name: &mut Option<String>,
        conn_id: u64,
        tx: &mpsc::UnboundedSender<String>,
        raw: &str,
    ) {
        let frame = match rpc::parse(raw) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!("invalid JSON from plugin: {err}");
                return;
            }
        };

        let req = match frame {
            RpcFrame::Response(resp) => {
                let Some(name) = channel_name.as_deref() else { return };
                let Some(id) = resp.id else { return };
                let mut channels = self.channels.lock().await;
                if let Some(channel) = channels.get_mut(name) {
                    if let Some(waiter) = channel.pending.remove(&rpc::id_key(&id)) {
                        let outcome = match resp.error {
                            Some(err) => Err(err.message),
                            None => Ok(resp.result.unwrap_or(Value::Null)),
                        };
                        let _ = waiter.send(outcome);
                    }
                }
                return;
            }
            RpcFrame::Request(req) => req,
        };

        match req.method.as_str() {
            "channel.register" => {
                let Some(name) = req
                    .params
                    .get("name")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                else {
                    tracing::warn!("channel.register without a name — ignored");
                    return;
                };
                let info = ChannelInfo {
                    name: name.to_string(),
                    version: req
                        .params
                        .get("version")
                        .and_then(Value::as_str)
                        .unwrap_or("?")
                        .to_string(),
                    description: req
                        .params
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                };
                tracing::info!("channel registered: {} v{}", info.name, info.version);
                *channel_name = Some(name.to_string());
                self.channels.lock().await.insert(
                    name.to_string(),
                    ConnectedChannel {
                        info,
                        conn_id,
                        tx: tx.clone(),
                        pending: HashMap::new(),
                    },
                );
                self.push_stored_config(name).await;
            }
            "channel.receive" => {
                if channel_name.is_none() {
                    tracing::warn!("channel.receive before channel.register — dropped");
                    return;
                }
                self.router.receive(req.params);
            }
            "channel.event" => {
                let Some(name) = channel_name.as_deref() else {
                    tracing::warn!("channel.event before channel.register — dropped");
                    return;
                };
                let event = req
                    .params
                    .get("event")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let data = req
                    .params
                    .get("data")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                tracing::info!("[{name}] event={event}");
                let _ = self.events.send(ChannelEvent {
                    channel: name.to_string(),
                    event,
                    data,
                });
            }
            other => {
                tracing::warn!(
                    "unknown method from channel '{}': {other}",
                    channel_name.as_deref().unwrap_or("?")
                );
                if let Some(id) = req.id {
                    let _ = tx.send(rpc::error(
                        rpc::METHOD_NOT_FOUND,
                        &format!("Method not found: {other}"),
                        Some(id),
                    ));
                }
            }
        }
    }

    /// Push the stored config to a channel right after registration.
    async fn push_stored_config(&self, name: &str) {
        if let Some(cfg) = config::load_channel_config(&self.app_dir, name) {
            if !cfg.config.is_empty() {
                self.configure_channel(name, Value::Object(cfg.config)).await;
            }
        }
    }

    // ── Outbound API (hub → plugin) ─────────────────────────────────────

    /// Send a `channel.send` notification to a specific plugin, or
    /// log-drop when it is not connected.
    pub async fn send_to_channel(&self, name: &str, message: Value) {
        let channels = self.channels.lock().await;
        match channels.get(name) {
            Some(channel) => {
                let _ = channel.tx.send(rpc::notification("channel.send", message));
            }
            None => tracing::warn!("cannot send to channel '{name}': not connected"),
        }
    }

    /// Send a `channel.send` notification to every connected plugin.
    pub async fn broadcast(&self, message: Value) {
        let channels = self.channels.lock().await;
        for channel in channels.values() {
            let _ = channel
                .tx
                .send(rpc::notification("channel.send", message.clone()));
        }
    }

    /// Push settings to a plugin via `channel.configure`.
    pub async fn configure_channel(&self, name: &str, config: Value) {
        let channels = self.channels.lock().await;
        if let Some(channel) = channels.get(name) {
            let _ = channel.tx.send(rpc::notification(
                "channel.configure",
                json!({ "config": config }),
            ));
        }
    }

    /// Forward a hub event to a plugin via `channel.event`.
    pub async fn send_event_to_channel(&self, name: &str, event: &str, data: Value) {
        let channels = self.channels.lock().await;
        match channels.get(name) {
            Some(channel) => {
                let _ = channel.tx.send(rpc::notification(
                    "channel.event",
                    json!({ "event": event, "data": data }),
                ));
            }
            None => tracing::warn!("cannot send event to channel '{name}': not connected"),
        }
    }

    /// Send a `channel.status` request and await the response.
    pub async fn probe_channel(&self, name: &str) -> Option<Value> {
        let request_id = rpc::new_request_id();
        let (waiter_tx, waiter_rx) = oneshot::channel();
        {
            let mut channels = self.channels.lock().await;
            let channel = channels.get_mut(name)?;
            channel.pending.insert(request_id.clone(), waiter_tx);
            let _ = channel
                .tx
                .send(rpc::request("channel.status", json!({}), &request_id));
        }

        match timeout(PROBE_TIMEOUT, waiter_rx).await {
            Ok(Ok(Ok(result))) => Some(result),
            _ => {
                let mut channels = self.channels.lock().await;
                if let Some(channel) = channels.get_mut(name) {
                    channel.pending.remove(&request_id);
                }
                None
            }
        }
    }

    pub async fn connected_channels(&self) -> Vec<String> {
        self.channels.lock().await.keys().cloned().collect()
    }

    pub async fn channel_info(&self) -> Vec<ChannelInfo> {
        self.channels
            .lock()
            .await
            .values()
            .map(|channel| channel.info.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl OutboundSink for PluginSupervisor {
    async fn deliver(&self, channel: &str, message: Value) {
        self.send_to_channel(channel, message).await;
    }
}

// ── Child process helpers ───────────────────────────────────────────────────

fn plugin_log_stdio(log_path: &std::path::Path) -> Option<(Stdio, Stdio)> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).ok()?;
    }
    let file = std::fs::File::create(log_path).ok()?;
    let clone = file.try_clone().ok()?;
    Some((Stdio::from(file), Stdio::from(clone)))
}
