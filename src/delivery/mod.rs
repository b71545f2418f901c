//! Outbound delivery: per-destination queues, endpoint senders, and attachment lifecycle.

pub mod attachment;
pub mod backoff;
pub mod chat;
pub mod dispatcher;
pub mod job;
pub mod redact;
pub mod sender;
pub mod webhook;

pub use attachment::SharedAttachment;
pub use chat::{ChatSender, ChatTransport};
pub use dispatcher::DeliveryDispatcher;
pub use job::{
    DeliveryJob, Destination, DestinationKey, DestinationKind, DestinationTarget, ForwardEvent,
    OutboundPayload, SendOutcome,
};
pub use sender::{EndpointSender, RelaySender};
pub use webhook::DiscordWebhookSender;
