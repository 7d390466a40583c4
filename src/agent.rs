//! Agent worker — drains the inbound queue, asks the LLM driver for a
//! reply, and enqueues the response.
//!
//! The worker only handles text; anything else is drained and dropped.
//! Per-conversation memory lives inside the driver, keyed by
//! `"<channel>:<sender_id>"` — the hub itself persists nothing. Driver
//! failures never leave the user silent: a constant fallback body is
//! enqueued instead.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::message::{ContentType, UnifiedMessage};
use crate::router::MessageRouter;

/// Reply body used when the driver errors.
pub const FALLBACK_REPLY: &str =
    "Sorry, I encountered an error processing your message. Please try again.";

/// Environment variable holding the provider API key. The CLI passes it to
/// the daemon this way so the hub never needs a credentials store.
pub const API_KEY_ENV: &str = "HOMELINK_MODEL_API_KEY";

/// Turns kept per conversation before the oldest are dropped.
const HISTORY_WINDOW: usize = 20;

/// The LLM seam. Implementations own per-conversation memory.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    async fn reply(&self, conversation_id: &str, body: &str) -> Result<String>;
}

// ── Worker ──────────────────────────────────────────────────────────────────

pub struct AgentWorker {
    driver: Arc<dyn AgentDriver>,
    router: Arc<MessageRouter>,
}

impl AgentWorker {
    pub fn new(driver: Arc<dyn AgentDriver>, router: Arc<MessageRouter>) -> Self {
        Self { driver, router }
    }

    /// Drain the inbound queue until cancelled.
    pub async fn run(
        &self,
        mut inbound: mpsc::UnboundedReceiver<UnifiedMessage>,
        cancel: CancellationToken,
    ) {
        tracing::info!("agent worker started");
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = inbound.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            if msg.content_type != ContentType::Text {
                tracing::debug!(
                    "agent ignoring non-text message [content_type={:?}]",
                    msg.content_type
                );
                continue;
            }
            self.process(msg).await;
        }
        tracing::info!("agent worker stopped");
    }

    async fn process(&self, msg: UnifiedMessage) {
        let conversation_id = format!("{}:{}", msg.channel, msg.sender_id);
        let body = match self.driver.reply(&conversation_id, &msg.body).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::error!("agent error [conversation={conversation_id}]: {err:#}");
                FALLBACK_REPLY.to_string()
            }
        };

        let reply = UnifiedMessage::outbound_text(&msg.channel, &msg.sender_id, &body);
        tracing::debug!(
            "agent reply enqueued [conversation={conversation_id} length={}]",
            body.len()
        );
        self.router.enqueue_outbound(reply);
    }
}

// ── HTTP driver ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
struct ChatTurn {
    role: String,
    content: String,
}

/// Driver speaking the OpenAI-compatible `/chat/completions` endpoint.
/// Conversation history is held in memory per conversation id and
/// truncated to [`HISTORY_WINDOW`] turns.
pub struct HttpDriver {
    client: reqwest::Client,
    config: AgentConfig,
    system_prompt: String,
    api_key: Option<String>,
    histories: Mutex<HashMap<String, Vec<ChatTurn>>>,
}

impl HttpDriver {
    pub fn new(config: AgentConfig, system_prompt: String) -> Self {
        let api_key = std::env::var(API_KEY_ENV).ok().filter(|key| !key.is_empty());
        if api_key.is_none() {
            tracing::warn!(
                "no {API_KEY_ENV} set — model calls will likely fail for provider '{}'",
                config.provider
            );
        }
        Self {
            client: reqwest::Client::new(),
            config,
            system_prompt,
            api_key,
            histories: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AgentDriver for HttpDriver {
    async fn reply(&self, conversation_id: &str, body: &str) -> Result<String> {
        let mut histories = self.histories.lock().await;
        let history = histories.entry(conversation_id.to_string()).or_default();
        history.push(ChatTurn {
            role: "user".to_string(),
            content: body.to_string(),
        });
        if history.len() > HISTORY_WINDOW {
            let excess = history.len() - HISTORY_WINDOW;
            history.drain(..excess);
        }

        let mut messages = vec![ChatTurn {
            role: "system".to_string(),
            content: self.system_prompt.clone(),
        }];
        messages.extend(history.iter().cloned());

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let payload = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        let mut request = self.client.post(&url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .context("chat completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            // Keep the failed turn out of the history so a retry starts clean.
            history.pop();
            let detail = response.text().await.unwrap_or_default();
            let short: String = detail.chars().take(200).collect();
            bail!("provider returned {status}: {short}");
        }

        let value: Value = response
            .json()
            .await
            .context("provider response is not JSON")?;
        let reply = value["choices"][0]["message"]["content"]
            .as_str()
            .context("provider response missing choices[0].message.content")?
            .to_string();

        history.push(ChatTurn {
            role: "assistant".to_string(),
            content: reply.clone(),
        });
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Direction;
    use crate::router::allow_all;

    struct ScriptedDriver {
        fail: bool,
    }

    #[async_trait]
    impl AgentDriver for ScriptedDriver {
        async fn reply(&self, conversation_id: &str, body: &str) -> Result<String> {
            if self.fail {
                bail!("model unavailable");
            }
            Ok(format!("[{conversation_id}] re: {body}"))
        }
    }

    async fn run_worker(
        driver: ScriptedDriver,
        inbound: Vec<UnifiedMessage>,
    ) -> (
        Arc<MessageRouter>,
        tokio::sync::mpsc::UnboundedReceiver<UnifiedMessage>,
    ) {
        let router = Arc::new(MessageRouter::new(allow_all()));
        let rx = router.take_inbound().await.unwrap();
        for msg in inbound {
            router.receive(serde_json::to_value(msg).unwrap());
        }

        let worker = AgentWorker::new(Arc::new(driver), router.clone());
        let cancel = CancellationToken::new();
        let run_handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(rx, cancel).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        run_handle.await.unwrap();

        let outbound = router.take_outbound().await.unwrap();
        (router, outbound)
    }

    #[tokio::test]
    async fn text_message_gets_reply_with_swapped_addressing() {
        let inbound = UnifiedMessage::inbound_text("echo", "user-7", "hello");
        let inbound_id = inbound.id.clone();
        let (_router, mut outbound) = run_worker(ScriptedDriver { fail: false }, vec![inbound]).await;

        let reply = outbound.try_recv().unwrap();
        assert_eq!(reply.direction, Direction::Outbound);
        assert_eq!(reply.channel, "echo");
        assert_eq!(reply.recipient_id.as_deref(), Some("user-7"));
        assert_eq!(reply.body, "[echo:user-7] re: hello");
        assert_ne!(reply.id, inbound_id);
    }

    #[tokio::test]
    async fn non_text_messages_are_dropped() {
        let mut image = UnifiedMessage::inbound_text("devices", "cam-1", "snapshot");
        image.content_type = ContentType::Image;
        let (_router, mut outbound) = run_worker(ScriptedDriver { fail: false }, vec![image]).await;
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn driver_error_falls_back_to_constant_reply() {
        let inbound = UnifiedMessage::inbound_text("echo", "user-7", "hello");
        let (_router, mut outbound) = run_worker(ScriptedDriver { fail: true }, vec![inbound]).await;

        let reply = outbound.try_recv().unwrap();
        assert_eq!(reply.body, FALLBACK_REPLY);
        assert_eq!(reply.recipient_id.as_deref(), Some("user-7"));
    }
}
