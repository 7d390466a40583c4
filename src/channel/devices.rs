//! Devices channel — owns the hub side of the hub ↔ gateway connection.
//!
//! Translates between the gateway relay envelope
//! `{target_device_id?, sender_device_id?, payload}` and [`UnifiedMessage`],
//! performs the desktop-claim handshake with the desktop master key, and
//! forwards the pairing request/response exchange between the gateway and
//! the hub's pairing controller. This is the only plugin that talks to the
//! gateway, and the hub treats it as mandatory.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::SigningKey;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{ChannelContext, ChannelPlugin};
use crate::crypto;
use crate::message::{ChannelInfo, Direction, UnifiedMessage};

pub const BACKOFF_BASE_SECS: f64 = 1.0;
pub const BACKOFF_MAX_SECS: f64 = 60.0;
/// Per-read timeout while authenticating with the gateway.
pub const GATEWAY_AUTH_TIMEOUT: Duration = Duration::from_secs(15);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

type SharedContext = Arc<StdMutex<Option<ChannelContext>>>;
type GatewaySlot = Arc<StdMutex<Option<mpsc::UnboundedSender<String>>>>;

fn slot_get<T: Clone>(slot: &Arc<StdMutex<Option<T>>>) -> Option<T> {
    slot.lock().map(|guard| guard.clone()).unwrap_or(None)
}

fn slot_set<T>(slot: &Arc<StdMutex<Option<T>>>, value: Option<T>) {
    if let Ok(mut guard) = slot.lock() {
        *guard = value;
    }
}

fn default_master_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".homelink")
        .join(crypto::MASTER_KEY_FILE)
}

pub struct DevicesChannel {
    gateway_url: String,
    device_id: String,
    ping_interval: f64,
    master_key_path: PathBuf,
    ctx: SharedContext,
    gateway_tx: GatewaySlot,
    runner: Option<(CancellationToken, tokio::task::JoinHandle<()>)>,
}

impl Default for DevicesChannel {
    fn default() -> Self {
        Self {
            gateway_url: "ws://localhost:8765".to_string(),
            device_id: String::new(),
            ping_interval: 30.0,
            master_key_path: default_master_key_path(),
            ctx: Arc::new(StdMutex::new(None)),
            gateway_tx: Arc::new(StdMutex::new(None)),
            runner: None,
        }
    }
}

impl DevicesChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn configured(&self) -> bool {
        !self.device_id.is_empty()
    }

    fn runner_alive(&self) -> bool {
        self.runner
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Load the master key and start the gateway reconnect loop.
    fn start_runner(&mut self) -> Result<()> {
        if self.runner_alive() {
            return Ok(());
        }
        let pem = std::fs::read_to_string(&self.master_key_path).with_context(|| {
            format!(
                "devices channel requires master key file: {}",
                self.master_key_path.display()
            )
        })?;
        let signing_key =
            SigningKey::from_pkcs8_pem(&pem).context("master key must be Ed25519 PKCS#8 PEM")?;

        let cancel = CancellationToken::new();
        let gateway_loop = GatewayLoop {
            url: self.gateway_url.clone(),
            device_id: self.device_id.clone(),
            ping_interval: self.ping_interval,
            signing_key,
            ctx: self.ctx.clone(),
            gateway_tx: self.gateway_tx.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(gateway_loop.run());
        self.runner = Some((cancel, handle));
        Ok(())
    }

    fn stop_runner(&mut self) {
        if let Some((cancel, handle)) = self.runner.take() {
            cancel.cancel();
            handle.abort();
        }
        slot_set(&self.gateway_tx, None);
    }
}

#[async_trait]
impl ChannelPlugin for DevicesChannel {
    fn info(&self) -> ChannelInfo {
        ChannelInfo {
            name: "devices".to_string(),
            version: "0.1.0".to_string(),
            description: "Bridges gateway-connected devices to unified messages.".to_string(),
        }
    }

    fn attach(&mut self, ctx: ChannelContext) {
        slot_set(&self.ctx, Some(ctx));
    }

    async fn on_configure(&mut self, config: Value) -> Result<()> {
        if let Some(url) = non_empty_str(config.get("gateway_url")) {
            self.gateway_url = url.to_string();
        }
        if let Some(device_id) = non_empty_str(config.get("device_id")) {
            self.device_id = device_id.to_string();
        }
        if let Some(interval) = config.get("ping_interval").and_then(Value::as_f64) {
            self.ping_interval = interval;
        }
        if let Some(path) = non_empty_str(config.get("master_key_path")) {
            self.master_key_path = PathBuf::from(path);
        }
        tracing::info!(
            "configured devices channel: gateway={} device_id={} master_key={}",
            self.gateway_url,
            self.device_id,
            self.master_key_path.display()
        );

        // The runner snapshots its settings at spawn; config that arrives
        // before the first start is picked up here.
        if self.configured() && !self.runner_alive() {
            if let Err(err) = self.start_runner() {
                tracing::warn!("devices channel cannot start gateway loop yet: {err:#}");
            }
        }
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        if !self.configured() {
            tracing::warn!("devices channel waiting for configuration (device_id unset)");
            return Ok(());
        }
        self.start_runner()
    }

    async fn on_stop(&mut self) {
        self.stop_runner();
    }

    /// UnifiedMessage → gateway envelope.
    async fn send(&mut self, message: UnifiedMessage) -> Result<()> {
        let Some(tx) = slot_get(&self.gateway_tx) else {
            tracing::warn!("gateway is not connected; dropping outbound message");
            return Ok(());
        };
        let mut out = json!({ "payload": serde_json::to_value(&message)? });
        if let Some(recipient) = &message.recipient_id {
            out["target_device_id"] = json!(recipient);
        }
        if tx.send(out.to_string()).is_err() {
            tracing::warn!("gateway connection closed; dropping outbound message");
        }
        Ok(())
    }

    async fn on_event(&mut self, event: &str, data: Value) {
        if event != "pairing_response" {
            return;
        }
        let Some(tx) = slot_get(&self.gateway_tx) else {
            tracing::warn!("gateway is not connected; cannot send pairing_response");
            return;
        };
        let Some(request_id) = non_empty_str(data.get("request_id")) else {
            tracing::warn!("pairing_response missing request_id");
            return;
        };
        let status = data.get("status").and_then(Value::as_str);
        let Some(status) = status.filter(|s| *s == "approved" || *s == "rejected") else {
            tracing::warn!("pairing_response invalid status");
            return;
        };

        let mut outbound = json!({
            "type": "pairing_response",
            "request_id": request_id,
            "status": status,
        });
        if status == "approved" {
            if let Some(attestation) = data.get("attestation").filter(|v| v.is_object()) {
                outbound["attestation"] = attestation.clone();
            }
            if let Some(device_id) = non_empty_str(data.get("device_id")) {
                outbound["device_id"] = json!(device_id);
            }
        } else {
            let reason = non_empty_str(data.get("reason")).unwrap_or("rejected");
            outbound["reason"] = json!(reason);
        }
        let _ = tx.send(outbound.to_string());
    }
}

// ── Gateway reconnect loop ──────────────────────────────────────────────────

struct GatewayLoop {
    url: String,
    device_id: String,
    ping_interval: f64,
    signing_key: SigningKey,
    ctx: SharedContext,
    gateway_tx: GatewaySlot,
    cancel: CancellationToken,
}

impl GatewayLoop {
    async fn run(self) {
        let mut backoff = BACKOFF_BASE_SECS;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.run_connection(&mut backoff).await {
                Ok(()) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    tracing::warn!("gateway disconnected; reconnecting in {backoff:.0}s");
                }
                Err(err) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    tracing::warn!("gateway error: {err:#}; reconnecting in {backoff:.0}s");
                }
            }
            slot_set(&self.gateway_tx, None);
            self.emit_event(
                "gateway_disconnected",
                json!({ "gateway_url": self.url, "device_id": self.device_id }),
            );

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs_f64(backoff)) => {}
            }
            backoff = (backoff * 2.0).min(BACKOFF_MAX_SECS);
        }
        slot_set(&self.gateway_tx, None);
    }

    async fn run_connection(&self, backoff: &mut f64) -> Result<()> {
        tracing::info!("connecting devices channel to gateway: {}", self.url);
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (mut sink, mut reader) = ws.split();

        self.authenticate(&mut sink, &mut reader).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        slot_set(&self.gateway_tx, Some(tx));
        self.emit_event(
            "gateway_connected",
            json!({ "gateway_url": self.url, "device_id": self.device_id }),
        );
        *backoff = BACKOFF_BASE_SECS;
        tracing::info!("connected to gateway");

        // tungstenite has no automatic keepalive; tick our own pings.
        let mut ping = tokio::time::interval(Duration::from_secs_f64(self.ping_interval.max(1.0)));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        return Ok(());
                    }
                }
                outbound = rx.recv() => {
                    let Some(frame) = outbound else { return Ok(()) };
                    sink.send(Message::text(frame)).await?;
                }
                incoming = reader.next() => match incoming {
                    None | Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(Message::Text(raw))) => self.handle_gateway_frame(raw.as_str()),
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    /// Perform the desktop-claim handshake (§ gateway handshake) within
    /// [`GATEWAY_AUTH_TIMEOUT`] per read.
    async fn authenticate(&self, sink: &mut WsSink, reader: &mut WsReader) -> Result<()> {
        let raw = timeout(GATEWAY_AUTH_TIMEOUT, next_text(reader))
            .await
            .context("gateway auth challenge timeout")?
            .context("gateway closed during auth")?;
        let challenge: Value =
            serde_json::from_str(&raw).context("gateway auth challenge is not JSON")?;
        if challenge.get("type").and_then(Value::as_str) != Some("auth_challenge") {
            bail!("unexpected first frame from gateway: {challenge}");
        }
        let nonce = non_empty_str(challenge.get("nonce"))
            .context("gateway challenge missing nonce")?;

        let response = json!({
            "type": "auth_response",
            "auth_mode": "desktop_claim",
            "device_id": self.device_id,
            "public_key": crypto::public_key_b64(&self.signing_key),
            "nonce_signature": crypto::sign_nonce_hex(&self.signing_key, nonce)?,
        });
        sink.send(Message::text(response.to_string())).await?;

        let ack_raw = timeout(GATEWAY_AUTH_TIMEOUT, next_text(reader))
            .await
            .context("gateway auth ack timeout")?
            .context("gateway closed during auth")?;
        let ack: Value = serde_json::from_str(&ack_raw).context("gateway auth ack is not JSON")?;
        if ack.get("type").and_then(Value::as_str) != Some("auth_ok") {
            bail!("gateway rejected auth: {ack}");
        }
        Ok(())
    }

    fn handle_gateway_frame(&self, raw: &str) {
        let Ok(msg) = serde_json::from_str::<Value>(raw) else {
            tracing::warn!("invalid JSON from gateway — ignored");
            return;
        };

        if msg.get("type").and_then(Value::as_str) == Some("pairing_request") {
            self.handle_pairing_request(&msg);
            return;
        }

        let Some(payload) = msg.get("payload").filter(|v| v.is_object()) else {
            tracing::warn!("gateway payload is not an object — ignored");
            return;
        };
        let mut unified: UnifiedMessage = match serde_json::from_value(payload.clone()) {
            Ok(unified) => unified,
            Err(err) => {
                tracing::warn!("invalid unified message payload from gateway: {err}");
                return;
            }
        };

        if let Some(sender) = non_empty_str(msg.get("sender_device_id")) {
            unified.sender_id = sender.to_string();
            unified
                .metadata
                .insert("friendly_name".to_string(), json!(sender));
            unified
                .metadata
                .insert("sender_device_id".to_string(), json!(sender));
        }
        unified.channel = "devices".to_string();
        unified.direction = Direction::Inbound;

        if let Some(ctx) = slot_get(&self.ctx) {
            ctx.emit(&unified);
        }
    }

    fn handle_pairing_request(&self, msg: &Value) {
        let Some(request_id) = non_empty_str(msg.get("request_id")) else {
            tracing::warn!("pairing_request missing request_id");
            return;
        };
        let Some(pairing_code) = non_empty_str(msg.get("pairing_code")) else {
            tracing::warn!("pairing_request missing pairing_code");
            return;
        };
        let Some(device_public_key) = non_empty_str(msg.get("device_public_key")) else {
            tracing::warn!("pairing_request missing device_public_key");
            return;
        };

        self.emit_event(
            "pairing_request",
            json!({
                "request_id": request_id,
                "pairing_code": pairing_code,
                "device_public_key": device_public_key,
            }),
        );
    }

    fn emit_event(&self, event: &str, data: Value) {
        if let Some(ctx) = slot_get(&self.ctx) {
            ctx.emit_event(event, data);
        } else {
            tracing::debug!("no hub transport attached; dropping event '{event}'");
        }
    }
}

async fn next_text(reader: &mut WsReader) -> Option<String> {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(raw)) => return Some(raw.to_string()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}
