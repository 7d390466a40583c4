//! Channel plugin SDK — the contract between the hub and a channel process.
//!
//! A channel plugin implements [`ChannelPlugin`] and hands itself to a
//! [`PluginTransport`](transport::PluginTransport), which maintains the
//! RPC connection to the hub. Lifecycle, driven by the transport:
//!
//! 1. `attach(ctx)`     — receive the emit handle for this connection
//! 2. `on_configure()`  — settings pushed by the hub after registration
//! 3. `on_start()`      — begin producing inbound messages
//! 4. `on_stop()`       — called on every disconnect; must be idempotent

pub mod devices;
pub mod echo;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::message::{ChannelInfo, UnifiedMessage};
use crate::rpc;

pub(crate) type PendingMap =
    Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value, String>>>>>;

/// Handle a plugin uses to push frames to the hub.
///
/// Valid for one transport connection; the transport attaches a fresh one
/// after every reconnect. Frames emitted while disconnected are dropped
/// with a warning — the hub is best-effort, online-only.
#[derive(Clone)]
pub struct ChannelContext {
    out: mpsc::UnboundedSender<String>,
    pending: PendingMap,
}

impl ChannelContext {
    pub(crate) fn new(out: mpsc::UnboundedSender<String>, pending: PendingMap) -> Self {
        Self { out, pending }
    }

    /// Forward an inbound message to the hub (`channel.receive`).
    pub fn emit(&self, message: &UnifiedMessage) {
        match serde_json::to_value(message) {
            Ok(value) => self.send_raw(rpc::notification("channel.receive", value)),
            Err(err) => tracing::warn!("failed to serialize inbound message: {err}"),
        }
    }

    /// Send a structured event to the hub (`channel.event`).
    pub fn emit_event(&self, event: &str, data: Value) {
        self.send_raw(rpc::notification(
            "channel.event",
            json!({ "event": event, "data": data }),
        ));
    }

    /// Send a JSON-RPC request to the hub and await the response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let request_id = rpc::new_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);
        if self.out.send(rpc::request(method, params, &request_id)).is_err() {
            self.pending.lock().await.remove(&request_id);
            anyhow::bail!("hub transport not connected");
        }
        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(message)) => anyhow::bail!("hub rpc error: {message}"),
            Err(_) => anyhow::bail!("hub transport disconnected"),
        }
    }

    fn send_raw(&self, frame: String) {
        if self.out.send(frame).is_err() {
            tracing::warn!("hub transport not connected; dropping frame");
        }
    }
}

/// Contract every channel plugin implements.
#[async_trait]
pub trait ChannelPlugin: Send {
    /// Channel name, version, and description sent on registration.
    fn info(&self) -> ChannelInfo;

    /// Store the emit handle for the current transport connection.
    fn attach(&mut self, ctx: ChannelContext);

    /// Receive credentials and settings pushed by the hub.
    async fn on_configure(&mut self, config: Value) -> Result<()>;

    /// Begin polling / listening — start producing inbound messages.
    async fn on_start(&mut self) -> Result<()>;

    /// Tear down connections to the third party. Called on every
    /// disconnect from the hub, so it must tolerate repeated calls.
    async fn on_stop(&mut self);

    /// Translate an outbound [`UnifiedMessage`] into a third-party call.
    async fn send(&mut self, message: UnifiedMessage) -> Result<()>;

    /// Optional inbound event from the hub.
    async fn on_event(&mut self, _event: &str, _data: Value) {}
}
