//! Discord webhook sender.
//!
//! Validates the URL against an allow-list, posts JSON or multipart
//! payloads, and retries on rate limits, 5xx responses and transport
//! failures. Every error string is redacted before it leaves this module.

use std::path::Path;
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode, Url};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::config::WebhookSenderConfig;
use crate::delivery::backoff::backoff_delay;
use crate::delivery::job::{SendOutcome, WebhookMessage};
use crate::delivery::redact::{redact_secrets, truncate_with_ellipsis};
use crate::error::DeliveryError;

/// Maximum `content` length accepted by Discord.
pub const MAX_CONTENT_CHARS: usize = 2000;
/// Maximum embed description length accepted by Discord.
pub const MAX_EMBED_DESCRIPTION_CHARS: usize = 4096;

const MAX_ERROR_BODY_CHARS: usize = 500;
const ENDPOINT: &str = "Discord";
const ALLOWED_HOSTS: &[&str] = &[
    "discord.com",
    "discordapp.com",
    "canary.discord.com",
    "ptb.discord.com",
];

/// Whether `url` looks like a Discord webhook endpoint.
pub fn is_discord_webhook_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if parsed.scheme() != "https" {
        return false;
    }
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    if !ALLOWED_HOSTS.contains(&host.as_str()) {
        return false;
    }
    parsed.path().starts_with("/api/webhooks/")
}

pub struct DiscordWebhookSender {
    client: Client,
    config: WebhookSenderConfig,
}

impl DiscordWebhookSender {
    pub fn new(config: WebhookSenderConfig) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| DeliveryError::Transport(redact_secrets(&e.to_string())))?;
        Ok(Self { client, config })
    }

    /// Validate and deliver one message.
    pub async fn send(&self, url: &str, message: &WebhookMessage) -> SendOutcome {
        if !is_discord_webhook_url(url) {
            return SendOutcome::failed(
                DeliveryError::InvalidDestination("Discord webhook URL".into()).to_string(),
            );
        }
        self.post_with_retries(url, message).await
    }

    /// Retry loop without the URL allow-list check.
    pub(crate) async fn post_with_retries(&self, url: &str, message: &WebhookMessage) -> SendOutcome {
        let payload = payload_json(message);
        let file = message
            .file_path
            .as_deref()
            .filter(|p| p.exists())
            .map(|p| (p, attachment_name(p, message.file_name.as_deref())));

        let max_retries = self.config.max_retries;
        for attempt in 0..=max_retries {
            let result = match &file {
                Some((path, name)) => self.post_multipart(url, &payload, path, name).await,
                None => self.post_json(url, &payload).await,
            };

            let result = result.and_then(|(status, headers, body)| {
                classify(status, &headers, &body, self.config.default_rate_limit_wait)
            });

            let error = match result {
                Ok(()) => return SendOutcome::ok(),
                Err(error) => error,
            };
            if !error.is_retryable() || attempt >= max_retries {
                return SendOutcome::failed(error.to_string());
            }

            let delay = match &error {
                DeliveryError::RateLimited { retry_after, .. } => *retry_after,
                _ => backoff_delay(attempt, self.config.max_backoff),
            };
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying webhook delivery"
            );
            tokio::time::sleep(delay).await;
        }

        SendOutcome::failed("Failed after retries")
    }

    async fn post_json(&self, url: &str, payload: &Value) -> Result<(StatusCode, HeaderMap, String), DeliveryError> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(transport_error)?;
        read_response(response).await
    }

    async fn post_multipart(
        &self,
        url: &str,
        payload: &Value,
        path: &Path,
        file_name: &str,
    ) -> Result<(StatusCode, HeaderMap, String), DeliveryError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| DeliveryError::Io(e.to_string()))?;

        let mut form = Form::new().part("file", Part::bytes(bytes).file_name(file_name.to_string()));
        if payload.as_object().is_some_and(|m| !m.is_empty()) {
            form = form.text("payload_json", payload.to_string());
        }

        let response = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;
        read_response(response).await
    }
}

fn attachment_name(path: &Path, explicit: Option<&str>) -> String {
    explicit
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "attachment".to_string())
}

/// Build the JSON body shared by both request variants.
fn payload_json(message: &WebhookMessage) -> Value {
    let mut payload = Map::new();
    if !message.content.is_empty() {
        payload.insert(
            "content".into(),
            Value::String(truncate_with_ellipsis(&message.content, MAX_CONTENT_CHARS)),
        );
    }
    if let Some(username) = &message.username {
        payload.insert("username".into(), Value::String(username.clone()));
    }
    if let Some(avatar) = &message.avatar_url {
        payload.insert("avatar_url".into(), Value::String(avatar.clone()));
    }
    if !message.embeds.is_empty() {
        let embeds: Vec<Value> = message
            .embeds
            .iter()
            .map(|embed| {
                let mut embed = embed.clone();
                embed.description = embed
                    .description
                    .map(|d| truncate_with_ellipsis(&d, MAX_EMBED_DESCRIPTION_CHARS));
                serde_json::to_value(embed).unwrap_or(Value::Null)
            })
            .collect();
        payload.insert("embeds".into(), Value::Array(embeds));
    }
    if let Some(mentions) = &message.allowed_mentions {
        payload.insert(
            "allowed_mentions".into(),
            json!({ "parse": mentions.parse, "replied_user": mentions.replied_user }),
        );
    }
    Value::Object(payload)
}

async fn read_response(response: reqwest::Response) -> Result<(StatusCode, HeaderMap, String), DeliveryError> {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.map_err(transport_error)?;
    Ok((status, headers, body))
}

fn transport_error(e: reqwest::Error) -> DeliveryError {
    if e.is_timeout() {
        DeliveryError::Timeout
    } else {
        DeliveryError::Transport(redact_secrets(&e.to_string()))
    }
}

/// Map a response onto a delivery error. Retrying is decided by
/// [`DeliveryError::is_retryable`].
fn classify(status: StatusCode, headers: &HeaderMap, body: &str, default_wait: Duration) -> Result<(), DeliveryError> {
    if status.is_success() {
        return Ok(());
    }

    match status.as_u16() {
        429 => {
            let wait = rate_limit_wait(body, headers).unwrap_or(default_wait);
            warn!(wait_ms = wait.as_millis() as u64, "Discord rate limit hit");
            Err(DeliveryError::RateLimited {
                endpoint: ENDPOINT.into(),
                retry_after: wait,
            })
        }
        code @ (500 | 502 | 503 | 504) => Err(DeliveryError::Transient {
            endpoint: ENDPOINT.into(),
            status: code,
        }),
        code => Err(DeliveryError::Rejected {
            endpoint: ENDPOINT.into(),
            status: code,
            body: redact_secrets(&truncate_with_ellipsis(body.trim(), MAX_ERROR_BODY_CHARS)),
        }),
    }
}

/// Wait hint from a 429: JSON `retry_after` first, then the `Retry-After` header.
fn rate_limit_wait(body: &str, headers: &HeaderMap) -> Option<Duration> {
    let from_body = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("retry_after").and_then(seconds_value));

    from_body
        .or_else(|| {
            headers
                .get(RETRY_AFTER)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.trim().parse::<f64>().ok())
        })
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn seconds_value(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
