//! Telegram chat destination sender.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::ChatSenderConfig;
use crate::delivery::backoff::backoff_delay;
use crate::delivery::job::{ChatMessage, SendOutcome};
use crate::delivery::redact::{redact_secrets, truncate_with_ellipsis};
use crate::error::ChannelError;

/// Maximum Telegram message length.
pub const MAX_CHAT_TEXT_CHARS: usize = 4096;

/// Raw chat API used by [`ChatSender`].
///
/// One call per attempt; retry policy lives in the sender.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(
        &self,
        chat_id: i64,
        topic_id: Option<i64>,
        text: Option<&str>,
        file: Option<&Path>,
    ) -> Result<(), ChannelError>;
}

pub struct ChatSender {
    transport: Arc<dyn ChatTransport>,
    config: ChatSenderConfig,
}

impl ChatSender {
    pub fn new(transport: Arc<dyn ChatTransport>, config: ChatSenderConfig) -> Self {
        Self { transport, config }
    }

    pub async fn send(&self, chat_id: i64, topic_id: Option<i64>, message: &ChatMessage) -> SendOutcome {
        let text = truncate_with_ellipsis(message.text.trim(), MAX_CHAT_TEXT_CHARS);
        let file = message.file_path.as_deref().filter(|p| p.exists());

        if text.is_empty() && file.is_none() {
            return SendOutcome::failed("Telegram destination message is empty");
        }
        let text = (!text.is_empty()).then_some(text.as_str());

        let max_retries = self.config.max_retries;
        for attempt in 0..=max_retries {
            let err = match self.transport.send_message(chat_id, topic_id, text, file).await {
                Ok(()) => return SendOutcome::ok(),
                Err(e) => e,
            };

            let delay = match &err {
                ChannelError::FloodWait { seconds } => Duration::from_secs((*seconds).max(1)),
                ChannelError::Api(_) | ChannelError::Http(_) => {
                    backoff_delay(attempt, self.config.max_backoff)
                }
                other => {
                    return SendOutcome::failed(format!(
                        "Telegram send error: {}",
                        redact_secrets(&other.to_string())
                    ));
                }
            };

            if attempt >= max_retries {
                return SendOutcome::failed(redact_secrets(&err.to_string()));
            }
            debug!(
                chat_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %redact_secrets(&err.to_string()),
                "Retrying chat delivery"
            );
            tokio::time::sleep(delay).await;
        }

        SendOutcome::failed("Failed after retries")
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Sent {
        chat_id: i64,
        topic_id: Option<i64>,
        text: Option<String>,
        file: Option<PathBuf>,
    }

    /// Fails with the scripted errors, then succeeds.
    #[derive(Default)]
    struct ScriptedTransport {
        failures: Mutex<Vec<ChannelError>>,
        sent: Mutex<Vec<Sent>>,
    }

    impl ScriptedTransport {
        fn failing_with(failures: Vec<ChannelError>) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(failures),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn send_message(
            &self,
            chat_id: i64,
            topic_id: Option<i64>,
            text: Option<&str>,
            file: Option<&Path>,
        ) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(Sent {
                chat_id,
                topic_id,
                text: text.map(str::to_string),
                file: file.map(Path::to_path_buf),
            });
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                Ok(())
            } else {
                Err(failures.remove(0))
            }
        }
    }

    fn config(max_retries: u32) -> ChatSenderConfig {
        ChatSenderConfig {
            max_retries,
            max_backoff: Duration::from_millis(1),
        }
    }

    fn message(text: &str) -> ChatMessage {
        ChatMessage {
            text: text.into(),
            file_path: None,
        }
    }

    #[tokio::test]
    async fn sends_trimmed_text_to_topic() {
        let transport = ScriptedTransport::failing_with(vec![]);
        let sender = ChatSender::new(transport.clone(), config(0));

        let outcome = sender.send(-100, Some(7), &message("  hello  ")).await;
        assert!(outcome.success);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(
            sent[0],
            Sent {
                chat_id: -100,
                topic_id: Some(7),
                text: Some("hello".into()),
                file: None,
            }
        );
    }

    #[tokio::test]
    async fn empty_message_fails_without_calling_api() {
        let transport = ScriptedTransport::failing_with(vec![]);
        let sender = ChatSender::new(transport.clone(), config(3));

        let mut msg = message("   ");
        msg.file_path = Some(PathBuf::from("/definitely/not/here.jpg"));
        let outcome = sender.send(1, None, &msg).await;

        assert_eq!(outcome.error.as_deref(), Some("Telegram destination message is empty"));
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn long_text_is_truncated() {
        let transport = ScriptedTransport::failing_with(vec![]);
        let sender = ChatSender::new(transport.clone(), config(0));

        sender.send(1, None, &message(&"x".repeat(5000))).await;
        let sent = transport.sent.lock().unwrap();
        let text = sent[0].text.as_deref().unwrap();
        assert_eq!(text.chars().count(), MAX_CHAT_TEXT_CHARS);
        assert!(text.ends_with("..."));
    }

    #[tokio::test]
    async fn api_errors_retry_then_succeed() {
        let transport = ScriptedTransport::failing_with(vec![
            ChannelError::Api("Bad Gateway".into()),
            ChannelError::Http("connection reset".into()),
        ]);
        let sender = ChatSender::new(transport.clone(), config(4));

        let outcome = sender.send(1, None, &message("hi")).await;
        assert!(outcome.success);
        assert_eq!(transport.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn flood_wait_exhaustion_reports_wait() {
        let transport = ScriptedTransport::failing_with(vec![ChannelError::FloodWait { seconds: 42 }]);
        let sender = ChatSender::new(transport, config(0));

        let outcome = sender.send(1, None, &message("hi")).await;
        assert_eq!(
            outcome.error.as_deref(),
            Some("Telegram flood-wait: retry after 42s")
        );
    }

    #[tokio::test]
    async fn unexpected_errors_are_terminal() {
        let transport = ScriptedTransport::failing_with(vec![ChannelError::Io(std::io::Error::other(
            "disk gone",
        ))]);
        let sender = ChatSender::new(transport.clone(), config(4));

        let outcome = sender.send(1, None, &message("hi")).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().starts_with("Telegram send error:"));
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn existing_file_is_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        std::fs::write(&path, b"pdf").unwrap();

        let transport = ScriptedTransport::failing_with(vec![]);
        let sender = ChatSender::new(transport.clone(), config(0));
        let outcome = sender
            .send(
                1,
                None,
                &ChatMessage {
                    text: String::new(),
                    file_path: Some(path.clone()),
                },
            )
            .await;

        assert!(outcome.success);
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].text, None);
        assert_eq!(sent[0].file.as_deref(), Some(path.as_path()));
    }
}
