//! Device registry and message relay.
//!
//! Every connection is authenticated with a nonce challenge before it can
//! relay anything:
//!
//! 1. gateway sends `{"type":"auth_challenge","nonce":"…"}`
//! 2. peer responds with `{"type":"auth_response", …}` (or opens the
//!    pairing bridge with `{"type":"pairing_request", …}`)
//! 3. on success the socket is registered under its authenticated device id
//!
//! Relayed frames are JSON objects with an optional `target_device_id`:
//! present → unicast, absent → broadcast to every other device. The
//! gateway stamps `sender_device_id` with the authenticated id, overwriting
//! whatever the client supplied.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::auth::{generate_nonce, AuthStore};
use super::close;

pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
pub const PAIRING_WAIT: Duration = Duration::from_secs(120);

type WsWriter = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReader = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Desktop,
    Device,
}

struct Peer {
    conn_id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

/// Process-wide relay state. Each map is guarded by its own mutex; network
/// I/O happens outside the locks (recipient lists are copied out first).
pub struct RelayState {
    auth: Mutex<AuthStore>,
    registry: Mutex<HashMap<String, Peer>>,
    desktop_id: Mutex<Option<String>>,
    pairing_pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    conn_counter: AtomicU64,
}

impl RelayState {
    pub fn new(auth: AuthStore) -> Self {
        Self {
            auth: Mutex::new(auth),
            registry: Mutex::new(HashMap::new()),
            desktop_id: Mutex::new(None),
            pairing_pending: Mutex::new(HashMap::new()),
            conn_counter: AtomicU64::new(1),
        }
    }

    pub async fn connected_devices(&self) -> Vec<String> {
        self.registry.lock().await.keys().cloned().collect()
    }
}

/// Handle a single WebSocket connection lifetime.
pub async fn handle_connection(
    state: std::sync::Arc<RelayState>,
    stream: TcpStream,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    let (mut writer, mut reader) = ws.split();

    let nonce = generate_nonce();
    let challenge = json!({ "type": "auth_challenge", "nonce": nonce });
    writer
        .send(Message::text(challenge.to_string()))
        .await
        .context("failed to send auth_challenge")?;

    let first_raw = match timeout(AUTH_TIMEOUT, next_text(&mut reader)).await {
        Err(_) => {
            tracing::warn!("connection rejected during auth: auth timeout");
            close_with(&mut writer, close::AUTH_FAILED, "auth timeout").await;
            return Ok(());
        }
        Ok(None) => return Ok(()),
        Ok(Some(raw)) => raw,
    };

    let first_msg = match serde_json::from_str::<Value>(&first_raw) {
        Ok(value) if value.is_object() => value,
        _ => {
            tracing::warn!("connection rejected during auth: first message invalid JSON");
            close_with(&mut writer, close::AUTH_FAILED, "invalid json").await;
            return Ok(());
        }
    };

    if first_msg.get("type").and_then(Value::as_str) == Some("pairing_request") {
        return run_pairing_bridge(&state, writer, reader, &first_msg).await;
    }

    let (device_id, role) = match authenticate(&state, &nonce, &first_msg).await {
        Ok(outcome) => outcome,
        Err(reason) => {
            tracing::warn!("connection rejected during auth: {reason}");
            let short: String = reason.chars().take(120).collect();
            close_with(&mut writer, close::AUTH_FAILED, &short).await;
            return Ok(());
        }
    };

    let auth_ok = json!({ "type": "auth_ok", "device_id": device_id });
    writer
        .send(Message::text(auth_ok.to_string()))
        .await
        .context("failed to send auth_ok")?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn_id = state.conn_counter.fetch_add(1, Ordering::Relaxed);
    register(&state, &device_id, Peer { conn_id, tx }).await;
    if role == Role::Desktop {
        *state.desktop_id.lock().await = Some(device_id.clone());
    }

    // Writer task: all sends to this peer are serialized through one queue,
    // preserving per-sender frame order.
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if writer.send(msg).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
    });

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

        if role == Role::Desktop {
            if let Ok(value) = serde_json::from_str::<Value>(raw.as_str()) {
                if value.get("type").and_then(Value::as_str) == Some("pairing_response") {
                    handle_pairing_response(&state, &value).await;
                    continue;
                }
            }
        }
        relay_message(&state, &device_id, raw.as_str()).await;
    }

    let removed = unregister(&state, &device_id, conn_id).await;
    if removed && role == Role::Desktop {
        let mut desktop = state.desktop_id.lock().await;
        if desktop.as_deref() == Some(device_id.as_str()) {
            *desktop = None;
        }
    }
    writer_task.abort();
    Ok(())
}

// ── Registry ────────────────────────────────────────────────────────────────

async fn register(state: &RelayState, device_id: &str, peer: Peer) {
    let mut registry = state.registry.lock().await;
    if let Some(old) = registry.insert(device_id.to_string(), peer) {
        tracing::warn!("device {device_id} reconnected — replacing old connection");
        let _ = old
            .tx
            .send(close_frame(close::REPLACED, "replaced by new connection"));
    }
    tracing::info!("device registered: {device_id} (total={})", registry.len());
}

/// Remove the registry entry only if it still belongs to this connection
/// (a displaced connection must not evict its replacement).
async fn unregister(state: &RelayState, device_id: &str, conn_id: u64) -> bool {
    let mut registry = state.registry.lock().await;
    if registry.get(device_id).is_some_and(|p| p.conn_id == conn_id) {
        registry.remove(device_id);
        tracing::info!("device unregistered: {device_id} (total={})", registry.len());
        true
    } else {
        false
    }
}

// ── Relay ───────────────────────────────────────────────────────────────────

async fn relay_message(state: &RelayState, sender_id: &str, raw: &str) {
    let Ok(mut msg) = serde_json::from_str::<Value>(raw) else {
        tracing::warn!("non-JSON message from {sender_id} — ignored");
        return;
    };
    let Some(obj) = msg.as_object_mut() else {
        tracing::warn!("non-object message from {sender_id} — ignored");
        return;
    };
    obj.insert("sender_device_id".to_string(), json!(sender_id));
    let target: Option<String> = obj
        .get("target_device_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let out = msg.to_string();

    let recipients: Vec<(String, mpsc::UnboundedSender<Message>)> = {
        let registry = state.registry.lock().await;
        match target {
            Some(target_id) => match registry.get(&target_id) {
                Some(peer) => vec![(target_id, peer.tx.clone())],
                None => {
                    tracing::warn!(
                        "target device {target_id} not connected; message from {sender_id} dropped"
                    );
                    return;
                }
            },
            None => registry
                .iter()
                .filter(|(id, _)| id.as_str() != sender_id)
                .map(|(id, peer)| (id.clone(), peer.tx.clone()))
                .collect(),
        }
    };

    for (recipient_id, tx) in recipients {
        if tx.send(Message::text(out.clone())).is_err() {
            tracing::warn!("failed to send to {recipient_id}: connection gone");
        } else {
            tracing::debug!("relayed message from {sender_id} → {recipient_id}");
        }
    }
}

// ── Handshake verification ──────────────────────────────────────────────────

async fn authenticate(
    state: &RelayState,
    nonce: &str,
    msg: &Value,
) -> Result<(String, Role), String> {
    if msg.get("type").and_then(Value::as_str) != Some("auth_response") {
        return Err("first message must be auth_response".to_string());
    }
    let Some(mode) = msg.get("auth_mode").and_then(Value::as_str) else {
        return Err("auth_mode is required".to_string());
    };
    // Legacy clients used "signature"; keep accepting it.
    let signature = non_empty_str(msg.get("nonce_signature")).or(non_empty_str(msg.get("signature")));

    match mode {
        "desktop_claim" => {
            let device_id = non_empty_str(msg.get("device_id"))
                .ok_or("desktop_claim requires device_id")?;
            let public_key = non_empty_str(msg.get("public_key"))
                .ok_or("desktop_claim requires public_key")?;
            let signature = signature.ok_or("desktop_claim requires nonce_signature")?;
            state
                .auth
                .lock()
                .await
                .verify_desktop_claim(nonce, public_key, signature)
                .map_err(|err| err.to_string())?;
            Ok((device_id.to_string(), Role::Desktop))
        }
        "desktop" => {
            let device_id =
                non_empty_str(msg.get("device_id")).ok_or("desktop auth requires device_id")?;
            let signature = signature.ok_or("desktop auth requires nonce_signature")?;
            state
                .auth
                .lock()
                .await
                .verify_desktop_auth(nonce, signature)
                .map_err(|err| err.to_string())?;
            Ok((device_id.to_string(), Role::Desktop))
        }
        "device" => {
            let Some(attestation) = msg.get("attestation").filter(|v| v.is_object()) else {
                return Err("device auth requires attestation object".to_string());
            };
            let signature = signature.ok_or("device auth requires nonce_signature")?;
            let blob = non_empty_str(attestation.get("blob")).ok_or("attestation.blob is required")?;
            let desktop_signature = non_empty_str(attestation.get("desktop_signature"))
                .ok_or("attestation.desktop_signature is required")?;
            let device_id = state
                .auth
                .lock()
                .await
                .verify_device_auth(nonce, blob, desktop_signature, signature)
                .map_err(|err| err.to_string())?;
            Ok((device_id, Role::Device))
        }
        other => Err(format!("unsupported auth_mode: {other}")),
    }
}

// ── Pairing bridge ──────────────────────────────────────────────────────────

/// Bridge an unauthenticated pairing caller to the connected desktop.
///
/// The caller's first frame was `pairing_request`; forward it to the
/// desktop under a fresh request id, acknowledge with `pairing_pending`,
/// then hold the socket until the desktop answers, the caller hangs up, or
/// the wait times out.
async fn run_pairing_bridge(
    state: &RelayState,
    mut writer: WsWriter,
    mut reader: WsReader,
    first_msg: &Value,
) -> Result<()> {
    let Some(pairing_code) = non_empty_str(first_msg.get("pairing_code")) else {
        close_with(&mut writer, close::PAIRING_MALFORMED, "pairing_code is required").await;
        return Ok(());
    };
    let Some(device_public_key) = non_empty_str(first_msg.get("device_public_key")) else {
        close_with(
            &mut writer,
            close::PAIRING_MALFORMED,
            "device_public_key is required",
        )
        .await;
        return Ok(());
    };

    let desktop_tx = {
        let desktop_id = state.desktop_id.lock().await.clone();
        match desktop_id {
            Some(id) => state.registry.lock().await.get(&id).map(|p| p.tx.clone()),
            None => None,
        }
    };
    let Some(desktop_tx) = desktop_tx else {
        close_with(&mut writer, close::DESKTOP_NOT_CONNECTED, "desktop not connected").await;
        return Ok(());
    };

    let request_id = new_pairing_request_id();
    let (done_tx, done_rx) = oneshot::channel::<Value>();
    state
        .pairing_pending
        .lock()
        .await
        .insert(request_id.clone(), done_tx);

    let forwarded = json!({
        "type": "pairing_request",
        "request_id": request_id,
        "pairing_code": pairing_code,
        "device_public_key": device_public_key,
    });
    if desktop_tx.send(Message::text(forwarded.to_string())).is_err() {
        state.pairing_pending.lock().await.remove(&request_id);
        close_with(&mut writer, close::DESKTOP_NOT_CONNECTED, "desktop not connected").await;
        return Ok(());
    }

    let pending = json!({ "type": "pairing_pending", "request_id": request_id });
    writer
        .send(Message::text(pending.to_string()))
        .await
        .context("failed to send pairing_pending")?;

    tokio::select! {
        answered = timeout(PAIRING_WAIT, done_rx) => match answered {
            Ok(Ok(frame)) => {
                let _ = writer.send(Message::text(frame.to_string())).await;
                close_with(&mut writer, close::NORMAL, "pairing complete").await;
            }
            Ok(Err(_)) => {
                // Responder dropped without answering; nothing to forward.
            }
            Err(_) => {
                state.pairing_pending.lock().await.remove(&request_id);
                close_with(&mut writer, close::PAIRING_TIMEOUT, "pairing timeout").await;
            }
        },
        _ = wait_for_close(&mut reader) => {
            state.pairing_pending.lock().await.remove(&request_id);
        }
    }
    Ok(())
}

/// Resolve a pending pairing request from a desktop `pairing_response`.
async fn handle_pairing_response(state: &RelayState, msg: &Value) {
    let Some(request_id) = non_empty_str(msg.get("request_id")) else {
        tracing::warn!("ignoring pairing_response without request_id");
        return;
    };
    let status = msg.get("status").and_then(Value::as_str);
    let Some(status) = status.filter(|s| *s == "approved" || *s == "rejected") else {
        tracing::warn!("ignoring pairing_response with invalid status");
        return;
    };

    let Some(done_tx) = state.pairing_pending.lock().await.remove(request_id) else {
        tracing::warn!("no pending pairing request found for request_id={request_id}");
        return;
    };

    let mut outbound = json!({ "type": "pairing_response", "status": status });
    if status == "approved" {
        if let Some(attestation) = msg.get("attestation").filter(|v| v.is_object()) {
            outbound["attestation"] = attestation.clone();
        }
        if let Some(device_id) = non_empty_str(msg.get("device_id")) {
            outbound["device_id"] = json!(device_id);
        }
    } else {
        let reason = non_empty_str(msg.get("reason")).unwrap_or("rejected");
        outbound["reason"] = json!(reason);
    }
    let _ = done_tx.send(outbound);
}

// ── Helpers ─────────────────────────────────────────────────────────────────

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

async fn wait_for_close(reader: &mut WsReader) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        }
    }
}

fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

async fn close_with(writer: &mut WsWriter, code: u16, reason: &str) {
    let _ = writer.send(close_frame(code, reason)).await;
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn new_pairing_request_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
