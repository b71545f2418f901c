//! Shared types for the relay pipeline.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A source-side file that has not been downloaded yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Opaque id the source resolves on download.
    pub file_id: String,
    /// Preferred local file name.
    pub file_name: Option<String>,
}

/// A message observed on a source channel.
///
/// Source adapters convert their native updates into this struct and leave
/// media as an [`AttachmentRef`]. The forwarder downloads it into
/// `attachment` only once the message is known to fan out; from that point
/// the pipeline owns the file and is responsible for deleting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Source channel (chat) id.
    pub channel_id: i64,
    /// Message id within the source channel.
    pub message_id: i64,
    /// Display name of the author, when the source exposes one.
    pub sender_name: Option<String>,
    /// Message text or caption.
    pub text: String,
    /// Media still on the source side.
    pub attachment_ref: Option<AttachmentRef>,
    /// Local path of the downloaded attachment.
    pub attachment: Option<PathBuf>,
    /// Whether the source message carried media at all (even if the download failed).
    pub has_media: bool,
    /// When the message was posted.
    pub timestamp: DateTime<Utc>,
    /// Sent by this account; never relayed, to avoid loops.
    pub outgoing: bool,
}

impl InboundMessage {
    /// A plain text message, mostly useful in tests.
    pub fn text(channel_id: i64, message_id: i64, text: impl Into<String>) -> Self {
        Self {
            channel_id,
            message_id,
            sender_name: None,
            text: text.into(),
            attachment_ref: None,
            attachment: None,
            has_media: false,
            timestamp: Utc::now(),
            outgoing: false,
        }
    }

    /// Attach an already-downloaded file.
    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachment = Some(path.into());
        self.has_media = true;
        self
    }

    /// Reference a file the source has yet to download.
    pub fn with_attachment_ref(mut self, file_id: impl Into<String>, file_name: Option<&str>) -> Self {
        self.attachment_ref = Some(AttachmentRef {
            file_id: file_id.into(),
            file_name: file_name.map(str::to_string),
        });
        self.has_media = true;
        self
    }

    /// Set the author display name.
    pub fn with_sender(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }

    /// Media present but no meaningful text.
    pub fn is_media_only(&self) -> bool {
        self.has_media && self.text.trim().is_empty()
    }
}
