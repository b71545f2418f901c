//! Endpoint sender seam used by the dispatcher.

use async_trait::async_trait;

use crate::delivery::chat::ChatSender;
use crate::delivery::job::{Destination, DestinationTarget, OutboundPayload, SendOutcome};
use crate::delivery::webhook::DiscordWebhookSender;

/// Performs one delivery, retries included.
///
/// Implementations never return errors: every failure becomes a
/// redacted [`SendOutcome`].
#[async_trait]
pub trait EndpointSender: Send + Sync {
    async fn send(&self, destination: &Destination, payload: &OutboundPayload) -> SendOutcome;
}

/// Routes each payload to the sender for its destination kind.
pub struct RelaySender {
    webhook: DiscordWebhookSender,
    chat: Option<ChatSender>,
}

impl RelaySender {
    pub fn new(webhook: DiscordWebhookSender, chat: Option<ChatSender>) -> Self {
        Self { webhook, chat }
    }
}

#[async_trait]
impl EndpointSender for RelaySender {
    async fn send(&self, destination: &Destination, payload: &OutboundPayload) -> SendOutcome {
        match (&destination.target, payload) {
            (DestinationTarget::Webhook { url }, OutboundPayload::Webhook(message)) => {
                self.webhook.send(url, message).await
            }
            (DestinationTarget::Chat { chat_id, topic_id }, OutboundPayload::Chat(message)) => {
                match &self.chat {
                    Some(chat) => chat.send(*chat_id, *topic_id, message).await,
                    None => SendOutcome::failed("Telegram client is not connected"),
                }
            }
            _ => SendOutcome::failed(format!(
                "Payload does not match destination type {}",
                destination.kind().as_str()
            )),
        }
    }
}
