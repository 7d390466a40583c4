//! Message router — the two queues between channel plugins and the agent.
//!
//! Inbound frames from every plugin funnel through [`MessageRouter::receive`]
//! into a single queue consumed by the agent worker; agent replies go onto
//! the outbound queue, drained by a single worker that fans out to the
//! owning plugin. A pure permission hook runs on both paths; the default
//! hook allows everything.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::message::UnifiedMessage;

/// Pure permission check; return `Err(reason)` to block a message.
pub type PermissionHook = Arc<dyn Fn(&UnifiedMessage) -> Result<(), String> + Send + Sync>;

/// The default permission hook: a seam with no behavior.
pub fn allow_all() -> PermissionHook {
    Arc::new(|_| Ok(()))
}

/// Where the outbound worker delivers messages. Implemented by the plugin
/// supervisor; kept as a trait so the router and supervisor can be built
/// in two steps without a reference cycle.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn deliver(&self, channel: &str, message: Value);
}

pub struct MessageRouter {
    inbound_tx: mpsc::UnboundedSender<UnifiedMessage>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<UnifiedMessage>>>,
    outbound_tx: mpsc::UnboundedSender<UnifiedMessage>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<UnifiedMessage>>>,
    permission: PermissionHook,
}

impl MessageRouter {
    pub fn new(permission: PermissionHook) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            permission,
        }
    }

    /// Accept a raw `channel.receive` params object from the supervisor.
    ///
    /// Validates it as a [`UnifiedMessage`] (drop + log on failure), runs
    /// the permission hook, then enqueues for the agent.
    pub fn receive(&self, params: Value) {
        let msg: UnifiedMessage = match serde_json::from_value(params) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!("dropping malformed inbound message: {err}");
                return;
            }
        };

        if let Err(reason) = (self.permission)(&msg) {
            tracing::warn!(
                "inbound message blocked by permission check [channel={} sender={}]: {reason}",
                msg.channel,
                msg.sender_id
            );
            return;
        }

        tracing::debug!(
            "inbound [channel={} sender={} content_type={:?}]",
            msg.channel,
            msg.sender_id,
            msg.content_type
        );
        let _ = self.inbound_tx.send(msg);
    }

    /// Queue a message to be delivered to its channel plugin.
    pub fn enqueue_outbound(&self, msg: UnifiedMessage) {
        let _ = self.outbound_tx.send(msg);
    }

    /// Hand the inbound queue to its single consumer (the agent worker).
    /// Returns `None` if already taken.
    pub async fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<UnifiedMessage>> {
        self.inbound_rx.lock().await.take()
    }

    /// Hand the outbound queue to its single consumer. Normally consumed
    /// by [`run_outbound`](Self::run_outbound); exposed for tests.
    pub async fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<UnifiedMessage>> {
        self.outbound_rx.lock().await.take()
    }

    /// Drain the outbound queue and dispatch to channel plugins, in
    /// enqueue order, until cancelled.
    pub async fn run_outbound(&self, sink: Arc<dyn OutboundSink>, cancel: CancellationToken) {
        let Some(mut outbound) = self.take_outbound().await else {
            tracing::error!("outbound worker already running");
            return;
        };
        tracing::info!("message router outbound worker started");

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = outbound.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            if let Err(reason) = (self.permission)(&msg) {
                tracing::warn!(
                    "outbound message blocked by permission check [channel={} recipient={:?}]: {reason}",
                    msg.channel,
                    msg.recipient_id
                );
                continue;
            }

            tracing::debug!(
                "outbound [channel={} recipient={:?} content_type={:?}]",
                msg.channel,
                msg.recipient_id,
                msg.content_type
            );
            match serde_json::to_value(&msg) {
                Ok(value) => sink.deliver(&msg.channel, value).await,
                Err(err) => tracing::warn!("failed to serialize outbound message: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ContentType, Direction};
    use serde_json::json;

    #[tokio::test]
    async fn receive_validates_and_enqueues() {
        let router = MessageRouter::new(allow_all());
        let mut inbound = router.take_inbound().await.unwrap();

        router.receive(json!({"not": "a message"}));
        router.receive(json!({
            "channel": "echo",
            "direction": "inbound",
            "sender_id": "user-1",
            "body": "hello"
        }));

        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg.channel, "echo");
        assert_eq!(msg.direction, Direction::Inbound);
        assert_eq!(msg.content_type, ContentType::Text);
        // The malformed frame was dropped, not queued.
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn permission_hook_blocks_inbound() {
        let deny: PermissionHook = Arc::new(|msg| {
            if msg.sender_id == "banned" {
                Err("sender is banned".to_string())
            } else {
                Ok(())
            }
        });
        let router = MessageRouter::new(deny);
        let mut inbound = router.take_inbound().await.unwrap();

        router.receive(json!({
            "channel": "echo",
            "direction": "inbound",
            "sender_id": "banned",
            "body": "hi"
        }));
        router.receive(json!({
            "channel": "echo",
            "direction": "inbound",
            "sender_id": "ok",
            "body": "hi"
        }));

        assert_eq!(inbound.recv().await.unwrap().sender_id, "ok");
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn outbound_worker_delivers_in_order() {
        struct Recorder(tokio::sync::mpsc::UnboundedSender<(String, Value)>);

        #[async_trait]
        impl OutboundSink for Recorder {
            async fn deliver(&self, channel: &str, message: Value) {
                let _ = self.0.send((channel.to_string(), message));
            }
        }

        let router = Arc::new(MessageRouter::new(allow_all()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker_router = router.clone();
        let worker_cancel = cancel.clone();
        let worker = tokio::spawn(async move {
            worker_router
                .run_outbound(Arc::new(Recorder(tx)), worker_cancel)
                .await;
        });

        router.enqueue_outbound(UnifiedMessage::outbound_text("echo", "u1", "first"));
        router.enqueue_outbound(UnifiedMessage::outbound_text("devices", "u2", "second"));

        let (ch1, m1) = rx.recv().await.unwrap();
        let (ch2, m2) = rx.recv().await.unwrap();
        assert_eq!(ch1, "echo");
        assert_eq!(m1["body"], "first");
        assert_eq!(ch2, "devices");
        assert_eq!(m2["body"], "second");

        cancel.cancel();
        worker.await.unwrap();
    }
}
