//! Configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Delivery dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Cap on concurrent endpoint calls across all destinations.
    pub max_in_flight: usize,
    /// Bounded queue capacity per destination.
    pub queue_capacity: usize,
    /// How long `close()` waits for a worker mid-send before aborting it.
    pub shutdown_grace: Duration,
    /// Capacity of the observer event channel.
    pub observer_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 5,
            queue_capacity: 500,
            shutdown_grace: Duration::from_secs(5),
            observer_capacity: 256,
        }
    }
}

/// Discord webhook sender tuning.
#[derive(Debug, Clone)]
pub struct WebhookSenderConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Upper bound on the exponential part of the backoff.
    pub max_backoff: Duration,
    /// Wait used when a 429 carries no usable hint.
    pub default_rate_limit_wait: Duration,
}

impl Default for WebhookSenderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 6,
            max_backoff: Duration::from_secs(30),
            default_rate_limit_wait: Duration::from_millis(1500),
        }
    }
}

/// Telegram chat sender tuning.
#[derive(Debug, Clone)]
pub struct ChatSenderConfig {
    pub max_retries: u32,
    pub max_backoff: Duration,
}

impl Default for ChatSenderConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            max_backoff: Duration::from_secs(20),
        }
    }
}

/// How outbound payloads are rendered.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Let `@everyone` / `@here` ping on Discord.
    pub allow_mass_mentions: bool,
    /// Wrap URLs in `<...>` so Discord does not unfurl them.
    pub suppress_url_embeds: bool,
    /// Drop URLs entirely (takes precedence over suppression).
    pub strip_urls: bool,
    /// Link back to the source post when the channel has a public username.
    pub include_source_link: bool,
    /// Drop messages that carry an attachment but no text.
    pub skip_media_only: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            allow_mass_mentions: false,
            suppress_url_embeds: true,
            strip_urls: false,
            include_source_link: true,
            skip_media_only: true,
        }
    }
}

/// Process-wide configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub telegram_bot_token: SecretString,
    pub database_path: PathBuf,
    pub data_dir: Option<PathBuf>,
    pub log_level: String,
    pub render: RenderConfig,
    pub dispatcher: DispatcherConfig,
    pub webhook: WebhookSenderConfig,
    pub chat: ChatSenderConfig,
}

impl RelayConfig {
    /// Build the configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()))?;

        let database_path = std::env::var("DATABASE_PATH")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data/teleforward.db"));

        let data_dir = std::env::var("DATA_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let render_defaults = RenderConfig::default();
        let render = RenderConfig {
            allow_mass_mentions: env_bool(
                "DISCORD_ALLOW_MASS_MENTIONS",
                render_defaults.allow_mass_mentions,
            )?,
            suppress_url_embeds: env_bool(
                "DISCORD_SUPPRESS_URL_EMBEDS",
                render_defaults.suppress_url_embeds,
            )?,
            strip_urls: env_bool("DISCORD_STRIP_URLS", render_defaults.strip_urls)?,
            include_source_link: env_bool(
                "DISCORD_INCLUDE_TELEGRAM_LINK",
                render_defaults.include_source_link,
            )?,
            skip_media_only: env_bool("RELAY_SKIP_MEDIA_ONLY", render_defaults.skip_media_only)?,
        };

        let dispatcher_defaults = DispatcherConfig::default();
        let dispatcher = DispatcherConfig {
            max_in_flight: env_parse("RELAY_MAX_IN_FLIGHT", dispatcher_defaults.max_in_flight)?,
            queue_capacity: env_parse("RELAY_QUEUE_CAPACITY", dispatcher_defaults.queue_capacity)?,
            shutdown_grace: Duration::from_secs(env_parse(
                "RELAY_SHUTDOWN_GRACE_SECS",
                dispatcher_defaults.shutdown_grace.as_secs(),
            )?),
            observer_capacity: env_parse(
                "RELAY_OBSERVER_CAPACITY",
                dispatcher_defaults.observer_capacity,
            )?,
        };

        if dispatcher.max_in_flight == 0 || dispatcher.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_MAX_IN_FLIGHT / RELAY_QUEUE_CAPACITY".into(),
                message: "must be greater than zero".into(),
            });
        }

        Ok(Self {
            telegram_bot_token: SecretString::from(token),
            database_path,
            data_dir,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            render,
            dispatcher,
            webhook: WebhookSenderConfig::default(),
            chat: ChatSenderConfig::default(),
        })
    }

    /// Directory for downloads and log files.
    pub fn resolve_data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.clone(),
            None => self
                .database_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    /// Where attachments are downloaded to.
    pub fn downloads_dir(&self) -> PathBuf {
        self.resolve_data_dir().join("downloads")
    }

    /// Create the data and downloads directories.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(self.resolve_data_dir())?;
        std::fs::create_dir_all(self.downloads_dir())?;
        Ok(())
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected true/false, got {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
