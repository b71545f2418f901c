//! Source-stream abstraction and the Telegram Bot API client.

pub mod telegram;

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ChannelError;
use crate::pipeline::types::{AttachmentRef, InboundMessage};

pub use telegram::TelegramChannel;

/// Stream of inbound messages from a source.
pub type MessageStream = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

/// Where relayed messages come from.
///
/// Adapters are pure I/O: they convert native updates into
/// [`InboundMessage`]s and download attachments on request. Filtering and
/// delivery happen in the forwarder.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Source name for logging.
    fn name(&self) -> &str;

    /// Start listening. The stream ends when the source stops.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Up to `limit` recent messages of a channel, oldest first.
    async fn recent_messages(
        &self,
        channel_id: i64,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, ChannelError>;

    /// Download a source-side file into local storage. The caller owns the file.
    async fn download_attachment(&self, attachment: &AttachmentRef) -> Result<PathBuf, ChannelError>;
}
