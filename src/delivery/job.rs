//! Delivery jobs, destinations, and outcome events.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delivery::attachment::SharedAttachment;

/// Kind of outbound endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    DiscordWebhook,
    TelegramChat,
}

impl DestinationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DiscordWebhook => "discord_webhook",
            Self::TelegramChat => "telegram_chat",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discord_webhook" => Some(Self::DiscordWebhook),
            "telegram_chat" => Some(Self::TelegramChat),
            _ => None,
        }
    }
}

/// Where a destination delivers to.
#[derive(Clone, PartialEq, Eq)]
pub enum DestinationTarget {
    /// Webhook URL; the token is part of the URL and is secret.
    Webhook { url: String },
    /// Chat id, optionally a forum topic inside it.
    Chat { chat_id: i64, topic_id: Option<i64> },
}

impl std::fmt::Debug for DestinationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Webhook { url } => f
                .debug_struct("Webhook")
                .field("url", &crate::delivery::redact::redact_secrets(url))
                .finish(),
            Self::Chat { chat_id, topic_id } => f
                .debug_struct("Chat")
                .field("chat_id", chat_id)
                .field("topic_id", topic_id)
                .finish(),
        }
    }
}

/// An outbound delivery target loaded from the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub id: i64,
    pub name: String,
    pub target: DestinationTarget,
}

impl Destination {
    pub fn kind(&self) -> DestinationKind {
        match self.target {
            DestinationTarget::Webhook { .. } => DestinationKind::DiscordWebhook,
            DestinationTarget::Chat { .. } => DestinationKind::TelegramChat,
        }
    }

    /// Identity that owns a queue and worker in the dispatcher.
    ///
    /// Two destination rows pointing at the same webhook URL or the same
    /// chat topic share one queue, so their deliveries stay ordered.
    pub fn key(&self) -> DestinationKey {
        match &self.target {
            DestinationTarget::Webhook { url } => DestinationKey(format!("webhook:{url}")),
            DestinationTarget::Chat { chat_id, topic_id } => match topic_id {
                Some(topic) => DestinationKey(format!("chat:{chat_id}:{topic}")),
                None => DestinationKey(format!("chat:{chat_id}")),
            },
        }
    }
}

/// Stable per-destination identity. Deliberately not `Display`: it may embed a webhook token.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DestinationKey(String);

impl std::fmt::Debug for DestinationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DestinationKey")
            .field(&crate::delivery::redact::redact_secrets(&self.0))
            .finish()
    }
}

/// A Discord embed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedImage {
    pub url: String,
}

/// Discord `allowed_mentions` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllowedMentions {
    pub parse: Vec<String>,
    pub replied_user: bool,
}

/// Rendered webhook message.
#[derive(Debug, Clone, Default)]
pub struct WebhookMessage {
    pub content: String,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub embeds: Vec<Embed>,
    pub allowed_mentions: Option<AllowedMentions>,
    pub file_path: Option<PathBuf>,
    pub file_name: Option<String>,
}

/// Rendered chat message.
#[derive(Debug, Clone, Default)]
pub struct ChatMessage {
    pub text: String,
    pub file_path: Option<PathBuf>,
}

/// What gets sent, shaped for the destination kind.
#[derive(Debug, Clone)]
pub enum OutboundPayload {
    Webhook(WebhookMessage),
    Chat(ChatMessage),
}

impl OutboundPayload {
    pub fn file_path(&self) -> Option<&PathBuf> {
        match self {
            Self::Webhook(m) => m.file_path.as_ref(),
            Self::Chat(m) => m.file_path.as_ref(),
        }
    }
}

/// One (message, destination) delivery. Consumed exactly once by a worker.
#[derive(Debug)]
pub struct DeliveryJob {
    pub destination: Destination,
    pub payload: OutboundPayload,
    pub route_id: Option<i64>,
    pub channel_id: i64,
    pub message_id: i64,
    pub original_text: String,
    pub transformed_text: String,
    pub attachment: Option<Arc<SharedAttachment>>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryJob {
    pub fn has_media(&self) -> bool {
        self.attachment.is_some() || self.payload.file_path().is_some()
    }
}

/// Result of one endpoint call (after all retries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub success: bool,
    /// Already redacted.
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Observer event emitted once per finished delivery.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardEvent {
    pub channel_id: i64,
    pub message_id: i64,
    pub destination_name: String,
    pub destination_type: DestinationKind,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}
