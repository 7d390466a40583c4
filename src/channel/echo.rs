//! Echo channel — reflects every outbound message back as an inbound one,
//! prefixed with `[echo]`. Useful for development and integration testing
//! of the plugin system.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::{ChannelContext, ChannelPlugin};
use crate::message::{ChannelInfo, Direction, UnifiedMessage};

#[derive(Default)]
pub struct EchoChannel {
    ctx: Option<ChannelContext>,
}

impl EchoChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelPlugin for EchoChannel {
    fn info(&self) -> ChannelInfo {
        ChannelInfo {
            name: "echo".to_string(),
            version: "0.1.0".to_string(),
            description: "Echo channel — reflects sent messages back as received.".to_string(),
        }
    }

    fn attach(&mut self, ctx: ChannelContext) {
        self.ctx = Some(ctx);
    }

    async fn on_configure(&mut self, config: Value) -> Result<()> {
        tracing::info!("echo channel configured: {config}");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        tracing::info!("echo channel started");
        Ok(())
    }

    async fn on_stop(&mut self) {
        tracing::info!("echo channel stopped");
    }

    async fn send(&mut self, message: UnifiedMessage) -> Result<()> {
        tracing::debug!("echo channel send: {}", message.body);
        let mut echo = message.clone();
        echo.direction = Direction::Inbound;
        echo.body = format!("[echo] {}", message.body);
        echo.sender_id = format!(
            "echo:{}",
            message.recipient_id.as_deref().unwrap_or("server")
        );
        echo.recipient_id = Some(message.sender_id.clone());
        if let Some(ctx) = &self.ctx {
            ctx.emit(&echo);
        }
        Ok(())
    }
}
