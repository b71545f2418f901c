//! Payload rendering — transformed text in, destination-shaped payloads out.

use std::path::Path;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::RenderConfig;
use crate::delivery::job::{
    AllowedMentions, ChatMessage, Embed, EmbedFooter, EmbedImage, WebhookMessage,
};
use crate::delivery::redact::truncate_with_ellipsis;

/// Display name and embed footer used for relayed posts.
pub const RELAY_USERNAME: &str = "TeleForward";

const MAX_EMBED_DESCRIPTION: usize = 4096;
const MAX_CHAT_TEXT: usize = 4096;
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

static EMBED_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s<>()\[\]{}]+").expect("static url regex"));

/// Source-side facts about the message being rendered.
#[derive(Debug, Clone)]
pub struct RenderContext<'a> {
    pub channel_name: &'a str,
    pub channel_username: Option<&'a str>,
    /// Falls back to the channel name when absent.
    pub sender_name: Option<&'a str>,
    pub message_id: i64,
    pub timestamp: DateTime<Utc>,
}

impl RenderContext<'_> {
    fn sender(&self) -> &str {
        self.sender_name
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(self.channel_name)
    }

    fn shows_sender(&self) -> bool {
        let sender = self.sender();
        !sender.is_empty() && sender != self.channel_name
    }
}

/// Public link to a post: `https://t.me/<username>/<id>`.
pub fn source_link(username: Option<&str>, message_id: i64) -> Option<String> {
    let username = username.map(|u| u.trim_start_matches('@')).filter(|u| !u.is_empty())?;
    (message_id > 0).then(|| format!("https://t.me/{username}/{message_id}"))
}

/// Deterministic embed colour for a channel name.
pub fn embed_color(key: &str) -> u32 {
    let seed = crc32fast::hash(key.as_bytes());
    let hue = f64::from(seed % 360) / 360.0;
    let (r, g, b) = hsv_to_rgb(hue, 0.68, 0.90);
    ((r * 255.0) as u32) << 16 | ((g * 255.0) as u32) << 8 | (b * 255.0) as u32
}

fn hsv_to_rgb(h: f64, s: f64, v: f64) -> (f64, f64, f64) {
    let sector = (h * 6.0).floor();
    let f = h * 6.0 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match (sector as i64).rem_euclid(6) {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    }
}

fn is_image(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

#[derive(Debug, Clone)]
pub struct Renderer {
    config: RenderConfig,
}

impl Renderer {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Break `@everyone` / `@here` with a zero-width space unless mass mentions are allowed.
    pub fn neutralize_mass_mentions(&self, text: &str) -> String {
        if self.config.allow_mass_mentions {
            return text.to_string();
        }
        text.replace("@everyone", "@\u{200b}everyone")
            .replace("@here", "@\u{200b}here")
    }

    /// Strip URLs, or wrap bare ones in `<...>` so Discord does not unfurl them.
    pub fn suppress_url_unfurls(&self, text: &str) -> String {
        if self.config.strip_urls {
            return EMBED_URL_RE.replace_all(text, "").trim().to_string();
        }
        if !self.config.suppress_url_embeds {
            return text.to_string();
        }

        let mut out = String::with_capacity(text.len() + 8);
        let mut last = 0;
        for m in EMBED_URL_RE.find_iter(text) {
            out.push_str(&text[last..m.start()]);
            let already_wrapped =
                text[..m.start()].ends_with('<') && text[m.end()..].starts_with('>');
            if already_wrapped {
                out.push_str(m.as_str());
            } else {
                out.push('<');
                out.push_str(m.as_str());
                out.push('>');
            }
            last = m.end();
        }
        out.push_str(&text[last..]);
        out
    }

    pub fn allowed_mentions(&self) -> AllowedMentions {
        let mut parse = vec!["users".to_string(), "roles".to_string()];
        if self.config.allow_mass_mentions {
            parse.push("everyone".to_string());
        }
        AllowedMentions {
            parse,
            replied_user: false,
        }
    }

    pub fn embed(&self, ctx: &RenderContext<'_>, text: &str, attachment_name: Option<&str>) -> Embed {
        let cleaned = self.suppress_url_unfurls(text.trim());
        let body = if !cleaned.is_empty() {
            cleaned
        } else if attachment_name.is_some() {
            "(media only)".to_string()
        } else {
            "(no text)".to_string()
        };

        let description = if ctx.shows_sender() {
            format!("**{}**\n\n{body}", ctx.sender())
        } else {
            body
        };

        let url = if self.config.include_source_link {
            source_link(ctx.channel_username, ctx.message_id)
        } else {
            None
        };

        Embed {
            title: Some(ctx.channel_name.to_string()),
            description: Some(truncate_with_ellipsis(&description, MAX_EMBED_DESCRIPTION)),
            url,
            color: Some(embed_color(ctx.channel_name)),
            timestamp: Some(ctx.timestamp.to_rfc3339()),
            footer: Some(EmbedFooter {
                text: RELAY_USERNAME.to_string(),
            }),
            image: attachment_name.filter(|n| is_image(n)).map(|n| EmbedImage {
                url: format!("attachment://{n}"),
            }),
        }
    }

    /// Webhook payload: one embed, no plain content.
    pub fn webhook_message(
        &self,
        ctx: &RenderContext<'_>,
        text: &str,
        attachment: Option<&Path>,
    ) -> WebhookMessage {
        let file_name = attachment
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned());
        WebhookMessage {
            content: String::new(),
            username: Some(RELAY_USERNAME.to_string()),
            avatar_url: None,
            embeds: vec![self.embed(ctx, text, file_name.as_deref())],
            allowed_mentions: Some(self.allowed_mentions()),
            file_path: attachment.map(Path::to_path_buf),
            file_name,
        }
    }

    /// Chat text: `[channel]`, sender, body, link, separated by blank lines.
    pub fn chat_text(&self, ctx: &RenderContext<'_>, text: &str) -> String {
        let mut parts = vec![format!("[{}]", ctx.channel_name)];
        if ctx.shows_sender() {
            parts.push(ctx.sender().to_string());
        }
        let body = text.trim();
        parts.push(if body.is_empty() { "(no text)".to_string() } else { body.to_string() });
        if self.config.include_source_link {
            if let Some(link) = source_link(ctx.channel_username, ctx.message_id) {
                parts.push(link);
            }
        }
        truncate_with_ellipsis(&parts.join("\n\n"), MAX_CHAT_TEXT)
    }

    pub fn chat_message(&self, ctx: &RenderContext<'_>, text: &str, attachment: Option<&Path>) -> ChatMessage {
        ChatMessage {
            text: self.chat_text(ctx, text),
            file_path: attachment.map(Path::to_path_buf),
        }
    }
}
