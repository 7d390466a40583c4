//! Plugin-side RPC transport — the WebSocket bridge between a channel
//! plugin and the hub.
//!
//! The transport connects to the hub's plugin server, sends a
//! `channel.register` notification, wires the plugin's emit handle, calls
//! `on_start`, then dispatches incoming JSON-RPC frames. On disconnect it
//! calls `on_stop`, resolves outstanding request futures with
//! cancellation, and retries after [`RECONNECT_DELAY`] until stopped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{ChannelContext, ChannelPlugin, PendingMap};
use crate::message::UnifiedMessage;
use crate::rpc::{self, RpcFrame, RpcRequest};

/// Delay before retrying the connection to the hub.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Manages the bidirectional JSON-RPC connection to the hub.
pub struct PluginTransport {
    url: String,
    stop: CancellationToken,
}

impl PluginTransport {
    pub fn new(hub_ws_url: &str) -> Self {
        Self {
            url: hub_ws_url.to_string(),
            stop: CancellationToken::new(),
        }
    }

    /// Token cancelled when the transport is asked to stop; binaries hook
    /// ctrl-c to this.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Signal the transport to disconnect and stop reconnecting.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Connect to the hub, register, and run the dispatch loop.
    /// Reconnects on unexpected disconnection until [`stop`](Self::stop)
    /// is called.
    pub async fn run(&self, plugin: &mut dyn ChannelPlugin) -> Result<()> {
        while !self.stop.is_cancelled() {
            match self.connect_and_run(plugin).await {
                Ok(()) => {
                    if self.stop.is_cancelled() {
                        break;
                    }
                    tracing::warn!(
                        "disconnected from hub; reconnecting in {}s",
                        RECONNECT_DELAY.as_secs()
                    );
                }
                Err(err) => {
                    if self.stop.is_cancelled() {
                        break;
                    }
                    tracing::warn!(
                        "could not reach hub ({err:#}); reconnecting in {}s",
                        RECONNECT_DELAY.as_secs()
                    );
                }
            }

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
        Ok(())
    }

    async fn connect_and_run(&self, plugin: &mut dyn ChannelPlugin) -> Result<()> {
        let info = plugin.info();
        tracing::info!(
            "connecting to hub plugin server: {} (channel={})",
            self.url,
            info.name
        );
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::text(rpc::notification(
            "channel.register",
            json!({
                "name": info.name,
                "version": info.version,
                "description": info.description,
            }),
        )))
        .await?;
        tracing::info!("registered channel '{}'", info.name);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        plugin.attach(ChannelContext::new(out_tx, pending.clone()));
        plugin.on_start().await?;

        let result = loop {
            tokio::select! {
                _ = self.stop.cancelled() => break Ok(()),
                outbound = out_rx.recv() => {
                    let Some(frame) = outbound else { break Ok(()) };
                    if sink.send(Message::text(frame)).await.is_err() {
                        break Err(anyhow::anyhow!("hub connection lost"));
                    }
                }
                incoming = stream.next() => match incoming {
                    None | Some(Ok(Message::Close(_))) => {
                        break Err(anyhow::anyhow!("hub connection closed"));
                    }
                    Some(Err(err)) => break Err(err.into()),
                    Some(Ok(Message::Text(raw))) => {
                        self.handle_frame(plugin, &mut sink, &pending, raw.as_str()).await;
                    }
                    Some(Ok(_)) => {}
                }
            }
        };

        plugin.on_stop().await;
        for (_, waiter) in pending.lock().await.drain() {
            let _ = waiter.send(Err("transport disconnected".to_string()));
        }
        result
    }

    async fn handle_frame(
        &self,
        plugin: &mut dyn ChannelPlugin,
        sink: &mut WsSink,
        pending: &PendingMap,
        raw: &str,
    ) {
        let frame = match rpc::parse(raw) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!("invalid JSON from hub: {err} ({})", truncate(raw, 200));
                return;
            }
        };

        match frame {
            RpcFrame::Response(resp) => {
                let Some(id) = resp.id else { return };
                if let Some(waiter) = pending.lock().await.remove(&rpc::id_key(&id)) {
                    let outcome = match resp.error {
                        Some(err) => Err(err.message),
                        None => Ok(resp.result.unwrap_or(Value::Null)),
                    };
                    let _ = waiter.send(outcome);
                }
            }
            RpcFrame::Request(req) => self.dispatch(plugin, sink, req).await,
        }
    }

    async fn dispatch(&self, plugin: &mut dyn ChannelPlugin, sink: &mut WsSink, req: RpcRequest) {
        let outcome: Result<Value, (i64, String)> = match req.method.as_str() {
            "channel.send" => match serde_json::from_value::<UnifiedMessage>(req.params.clone()) {
                Ok(message) => plugin
                    .send(message)
                    .await
                    .map(|_| json!({ "ok": true }))
                    .map_err(|err| (rpc::INTERNAL_ERROR, format!("{err:#}"))),
                Err(err) => Err((rpc::INTERNAL_ERROR, format!("invalid message: {err}"))),
            },
            "channel.configure" => {
                let config = req
                    .params
                    .get("config")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                plugin
                    .on_configure(config)
                    .await
                    .map(|_| json!({ "ok": true }))
                    .map_err(|err| (rpc::INTERNAL_ERROR, format!("{err:#}")))
            }
            "channel.stop" => {
                self.stop.cancel();
                Ok(json!({ "ok": true }))
            }
            "channel.status" => {
                let info = plugin.info();
                Ok(json!({
                    "name": info.name,
                    "version": info.version,
                    "status": "running",
                }))
            }
            "channel.event" => {
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
                plugin.on_event(&event, data).await;
                Ok(json!({ "ok": true }))
            }
            other => Err((
                rpc::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        };

        if let Some(id) = req.id {
            let reply = match outcome {
                Ok(result) => rpc::success(result, Some(id)),
                Err((code, message)) => rpc::error(code, &message, Some(id)),
            };
            if sink.send(Message::text(reply)).await.is_err() {
                tracing::warn!("failed to send RPC reply for '{}'", req.method);
            }
        } else if let Err((_, message)) = outcome {
            tracing::warn!("error handling notification '{}': {message}", req.method);
        }
    }
}

fn truncate(raw: &str, limit: usize) -> &str {
    match raw.char_indices().nth(limit) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}
