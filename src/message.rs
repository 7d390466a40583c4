//! Unified message model — the lingua franca of the hub.
//!
//! Every channel plugin translates its native format to and from
//! [`UnifiedMessage`]; the router, agent worker, and gateway envelopes all
//! speak this shape. `direction` is always from the hub's perspective:
//! `inbound` arrives from a third party, `outbound` is to be delivered to
//! one.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Message flow direction, seen from the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Payload kind carried in `body`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Image,
    Audio,
    Location,
    Command,
}

/// Canonical cross-channel message format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMessage {
    /// Opaque unique id, generated when the sender does not supply one.
    #[serde(default = "new_message_id")]
    pub id: String,
    /// Channel name this message belongs to (e.g. `"devices"`, `"echo"`).
    pub channel: String,
    pub direction: Direction,
    pub sender_id: String,
    /// Absent means broadcast where the channel supports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub body: String,
    /// Schema-open extras; only the fields the core consumes are validated.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl UnifiedMessage {
    /// Build an inbound text message with fresh id and timestamp.
    pub fn inbound_text(channel: &str, sender_id: &str, body: &str) -> Self {
        Self {
            id: new_message_id(),
            channel: channel.to_string(),
            direction: Direction::Inbound,
            sender_id: sender_id.to_string(),
            recipient_id: None,
            content_type: ContentType::Text,
            body: body.to_string(),
            metadata: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Build an outbound text message addressed to `recipient_id`.
    pub fn outbound_text(channel: &str, recipient_id: &str, body: &str) -> Self {
        Self {
            id: new_message_id(),
            channel: channel.to_string(),
            direction: Direction::Outbound,
            sender_id: "agent".to_string(),
            recipient_id: Some(recipient_id.to_string()),
            content_type: ContentType::Text,
            body: body.to_string(),
            metadata: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Self-description a channel sends on registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

/// Generate an opaque 32-hex-char message id.
pub fn new_message_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
