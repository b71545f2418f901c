//! Telegram channel — long-polls the Bot API for channel posts.
//!
//! Also serves as the [`ChatTransport`] for Telegram chat destinations,
//! so one bot both reads sources and posts mirrors.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use crate::channels::{MessageSource, MessageStream};
use crate::delivery::chat::ChatTransport;
use crate::delivery::redact::{redact_secrets, truncate_chars};
use crate::error::ChannelError;
use crate::pipeline::types::{AttachmentRef, InboundMessage};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Long-poll timeout passed to getUpdates, in seconds.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Maximum caption length for sendDocument.
const TELEGRAM_MAX_CAPTION_LENGTH: usize = 1024;

/// Recent messages kept per channel for backfill.
const HISTORY_LIMIT: usize = 200;

/// Inbound queue between the poller and the forwarder.
const STREAM_BUFFER: usize = 256;

const SEND_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_ERROR_DELAY: Duration = Duration::from_secs(5);

type History = Arc<Mutex<HashMap<i64, VecDeque<InboundMessage>>>>;

/// Bot API endpoint plus credentials, shared with the polling task.
struct BotApi {
    base: String,
    bot_token: SecretString,
    client: reqwest::Client,
    downloads_dir: PathBuf,
}

impl BotApi {
    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.base, self.bot_token.expose_secret())
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{}/file/bot{}/{file_path}",
            self.base,
            self.bot_token.expose_secret()
        )
    }

    /// POST a JSON body and unwrap the Bot API envelope.
    async fn call(&self, method: &str, body: &Value, timeout: Duration) -> Result<Value, ChannelError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(http_error)?;
        read_envelope(method, resp).await
    }

    async fn get_me(&self) -> Result<i64, ChannelError> {
        let me = self
            .call("getMe", &serde_json::json!({}), SEND_TIMEOUT)
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;
        me.get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: "getMe returned no bot id".into(),
            })
    }

    /// Resolve a file id and download it into the downloads directory.
    async fn download(&self, file_id: &str, preferred_name: Option<&str>) -> Result<PathBuf, ChannelError> {
        let file = self
            .call(
                "getFile",
                &serde_json::json!({ "file_id": file_id }),
                SEND_TIMEOUT,
            )
            .await
            .map_err(|e| ChannelError::Download(e.to_string()))?;
        let remote_path = file
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::Download("getFile returned no file_path".into()))?;

        let resp = self
            .client
            .get(self.file_url(remote_path))
            .timeout(SEND_TIMEOUT)
            .send()
            .await
            .map_err(|e| ChannelError::Download(redact_secrets(&e.without_url().to_string())))?;
        if !resp.status().is_success() {
            return Err(ChannelError::Download(format!(
                "file download returned {}",
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ChannelError::Download(redact_secrets(&e.without_url().to_string())))?;

        let name = preferred_name
            .or_else(|| remote_path.rsplit('/').next())
            .unwrap_or("file");
        let local = self.downloads_dir.join(format!(
            "{}_{}",
            uuid::Uuid::new_v4(),
            sanitize_file_name(name)
        ));
        tokio::fs::create_dir_all(&self.downloads_dir).await?;
        tokio::fs::write(&local, &bytes).await?;
        tracing::debug!(path = %local.display(), bytes = bytes.len(), "Downloaded attachment");
        Ok(local)
    }

    async fn send_text(
        &self,
        chat_id: i64,
        topic_id: Option<i64>,
        text: &str,
    ) -> Result<(), ChannelError> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "link_preview_options": { "is_disabled": true },
        });
        if let Some(topic) = topic_id {
            body["message_thread_id"] = Value::from(topic);
        }
        self.call("sendMessage", &body, SEND_TIMEOUT).await.map(|_| ())
    }

    async fn send_document(
        &self,
        chat_id: i64,
        topic_id: Option<i64>,
        file_path: &Path,
        caption: Option<&str>,
    ) -> Result<(), ChannelError> {
        let file_name = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file");

        let file_bytes = tokio::fs::read(file_path).await?;
        let part = Part::bytes(file_bytes).file_name(file_name.to_string());

        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("document", part);
        if let Some(topic) = topic_id {
            form = form.text("message_thread_id", topic.to_string());
        }
        if let Some(cap) = caption {
            form = form.text("caption", cap.to_string());
        }

        let resp = self
            .client
            .post(self.api_url("sendDocument"))
            .multipart(form)
            .timeout(SEND_TIMEOUT)
            .send()
            .await
            .map_err(http_error)?;
        read_envelope("sendDocument", resp).await.map(|_| ())
    }
}

/// Telegram channel — connects to the Bot API via long-polling.
pub struct TelegramChannel {
    api: Arc<BotApi>,
    history: History,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString, downloads_dir: impl Into<PathBuf>) -> Self {
        Self {
            api: Arc::new(BotApi {
                base: DEFAULT_API_BASE.to_string(),
                bot_token,
                client: reqwest::Client::new(),
                downloads_dir: downloads_dir.into(),
            }),
            history: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Point the client at a different Bot API server.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        let api = BotApi {
            base: base.into().trim_end_matches('/').to_string(),
            bot_token: self.api.bot_token.clone(),
            client: self.api.client.clone(),
            downloads_dir: self.api.downloads_dir.clone(),
        };
        self.api = Arc::new(api);
        self
    }

    #[cfg(test)]
    fn api_url(&self, method: &str) -> String {
        self.api.api_url(method)
    }
}

// ── MessageSource implementation ────────────────────────────────────

#[async_trait]
impl MessageSource for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let bot_id = self.api.get_me().await?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let api = self.api.clone();
        let history = self.history.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!(bot_id, "Telegram channel listening for posts...");

            loop {
                if tx.is_closed() {
                    tracing::info!("Telegram listener channel closed");
                    return;
                }

                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ["channel_post", "message"]
                });
                let poll_timeout = Duration::from_secs(POLL_TIMEOUT_SECS + 15);

                let updates = match api.call("getUpdates", &body, poll_timeout).await {
                    Ok(Value::Array(updates)) => updates,
                    Ok(_) => Vec::new(),
                    Err(ChannelError::FloodWait { seconds }) => {
                        tracing::warn!(seconds, "Telegram poll flood-wait");
                        tokio::time::sleep(Duration::from_secs(seconds.max(1))).await;
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(POLL_ERROR_DELAY).await;
                        continue;
                    }
                };

                for update in &updates {
                    // Advance offset past this update
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = offset.max(uid + 1);
                    }

                    let Some(message) = parse_update(update, bot_id) else {
                        continue;
                    };

                    remember(&history, &message).await;

                    if tx.send(message).await.is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn recent_messages(
        &self,
        channel_id: i64,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, ChannelError> {
        let history = self.history.lock().await;
        let Some(buffer) = history.get(&channel_id) else {
            return Ok(Vec::new());
        };
        let skip = buffer.len().saturating_sub(limit);
        Ok(buffer.iter().skip(skip).cloned().collect())
    }

    async fn download_attachment(&self, attachment: &AttachmentRef) -> Result<PathBuf, ChannelError> {
        self.api
            .download(&attachment.file_id, attachment.file_name.as_deref())
            .await
    }
}

// ── Chat destination transport ──────────────────────────────────────

#[async_trait]
impl ChatTransport for TelegramChannel {
    async fn send_message(
        &self,
        chat_id: i64,
        topic_id: Option<i64>,
        text: Option<&str>,
        file: Option<&Path>,
    ) -> Result<(), ChannelError> {
        match (text, file) {
            (text, Some(path)) => {
                let fits = text.is_none_or(|t| t.chars().count() <= TELEGRAM_MAX_CAPTION_LENGTH);
                if fits {
                    self.api.send_document(chat_id, topic_id, path, text).await
                } else {
                    // Caption too long: file first, then the full text.
                    self.api.send_document(chat_id, topic_id, path, None).await?;
                    match text {
                        Some(t) => self.api.send_text(chat_id, topic_id, t).await,
                        None => Ok(()),
                    }
                }
            }
            (Some(text), None) => self.api.send_text(chat_id, topic_id, text).await,
            (None, None) => Err(ChannelError::Api("nothing to send".into())),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

const MEDIA_KEYS: &[&str] = &[
    "photo",
    "document",
    "video",
    "audio",
    "voice",
    "animation",
    "video_note",
    "sticker",
];

/// Convert one getUpdates entry into an inbound message.
fn parse_update(update: &Value, bot_id: i64) -> Option<InboundMessage> {
    let message = update
        .get("channel_post")
        .or_else(|| update.get("message"))?;

    let channel_id = message.get("chat")?.get("id")?.as_i64()?;
    let message_id = message.get("message_id")?.as_i64()?;

    let text = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let from_id = message
        .get("from")
        .and_then(|f| f.get("id"))
        .and_then(Value::as_i64);

    let timestamp = message
        .get("date")
        .and_then(Value::as_i64)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now);

    let has_media = MEDIA_KEYS.iter().any(|k| message.get(*k).is_some());

    Some(InboundMessage {
        channel_id,
        message_id,
        sender_name: sender_name(message),
        text,
        attachment_ref: media_ref(message),
        attachment: None,
        has_media,
        timestamp,
        outgoing: from_id == Some(bot_id),
    })
}

/// Post signature, else the author's name. Channel posts usually have neither.
fn sender_name(message: &Value) -> Option<String> {
    if let Some(sig) = message.get("author_signature").and_then(Value::as_str) {
        return Some(sig.to_string());
    }
    let from = message.get("from")?;
    let first = from.get("first_name").and_then(Value::as_str).unwrap_or_default();
    let last = from.get("last_name").and_then(Value::as_str).unwrap_or_default();
    let full = format!("{first} {last}").trim().to_string();
    if !full.is_empty() {
        return Some(full);
    }
    from.get("username")
        .and_then(Value::as_str)
        .map(|u| format!("@{u}"))
}

/// Largest photo size, else the first other downloadable media.
fn media_ref(message: &Value) -> Option<AttachmentRef> {
    if let Some(largest) = message
        .get("photo")
        .and_then(Value::as_array)
        .and_then(|sizes| {
            sizes
                .iter()
                .max_by_key(|s| s.get("file_size").and_then(Value::as_i64).unwrap_or(0))
        })
    {
        return Some(AttachmentRef {
            file_id: largest.get("file_id")?.as_str()?.to_string(),
            file_name: Some("photo.jpg".into()),
        });
    }

    for (key, default_name) in [
        ("document", "file"),
        ("video", "video.mp4"),
        ("animation", "animation.mp4"),
        ("audio", "audio.mp3"),
        ("voice", "voice.ogg"),
    ] {
        if let Some(media) = message.get(key) {
            let file_id = media.get("file_id")?.as_str()?.to_string();
            let file_name = media
                .get("file_name")
                .and_then(Value::as_str)
                .unwrap_or(default_name)
                .to_string();
            return Some(AttachmentRef {
                file_id,
                file_name: Some(file_name),
            });
        }
    }
    None
}

async fn remember(history: &History, message: &InboundMessage) {
    let mut history = history.lock().await;
    let buffer = history.entry(message.channel_id).or_default();
    buffer.push_back(message.clone());
    while buffer.len() > HISTORY_LIMIT {
        buffer.pop_front();
    }
}

/// Keep a local file name to safe ASCII.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        truncate_chars(cleaned, 100)
    }
}

fn http_error(e: reqwest::Error) -> ChannelError {
    ChannelError::Http(redact_secrets(&e.without_url().to_string()))
}

/// Map a Bot API response to its `result` or a classified error.
async fn read_envelope(method: &str, resp: reqwest::Response) -> Result<Value, ChannelError> {
    let status = resp.status();
    let body: Value = resp.json().await.map_err(http_error)?;

    if body.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(body.get("result").cloned().unwrap_or(Value::Null));
    }

    let retry_after = body
        .get("parameters")
        .and_then(|p| p.get("retry_after"))
        .and_then(Value::as_u64);
    if status.as_u16() == 429 || retry_after.is_some() {
        return Err(ChannelError::FloodWait {
            seconds: retry_after.unwrap_or(1),
        });
    }

    let description = body
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("no description");
    Err(ChannelError::Api(format!(
        "{method} failed ({status}): {}",
        redact_secrets(description)
    )))
}

// ── Tests ───────────────────────────────────────────────────────────
