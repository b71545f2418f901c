//! End-to-end relay tests.
//!
//! Each test spins up an Axum server on a random port that plays the
//! Telegram Bot API, then drives the real forwarder → dispatcher →
//! sender → transport chain against it with an in-memory store.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use teleforward::channels::{MessageSource, MessageStream, TelegramChannel};
use teleforward::config::{ChatSenderConfig, DispatcherConfig, RenderConfig, WebhookSenderConfig};
use teleforward::delivery::{
    ChatSender, DeliveryDispatcher, DiscordWebhookSender, ForwardEvent, RelaySender,
};
use teleforward::error::ChannelError;
use teleforward::pipeline::{AttachmentRef, Forwarder, InboundMessage, Renderer};
use teleforward::store::{ForwardStatus, LibSqlBackend, NewTransformRule, RelayStore};

/// Maximum time any test is allowed to wait for deliveries.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const SOURCE: i64 = -100_111;
const MIRROR: i64 = -100_222;
const FORUM: i64 = -100_333;

/// What the fake Bot API has seen.
#[derive(Default)]
struct BotLog {
    messages: Mutex<Vec<Value>>,
    documents: Mutex<Vec<usize>>,
    /// Chats that get one 429 before succeeding.
    flood_once: Mutex<Vec<i64>>,
}

async fn send_message(State(log): State<Arc<BotLog>>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let chat_id = body.get("chat_id").and_then(Value::as_i64).unwrap_or_default();
    {
        let mut flood = log.flood_once.lock().unwrap();
        if let Some(pos) = flood.iter().position(|c| *c == chat_id) {
            flood.remove(pos);
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({
                    "ok": false,
                    "error_code": 429,
                    "description": "Too Many Requests: retry after 1",
                    "parameters": { "retry_after": 1 }
                })),
            );
        }
    }
    log.messages.lock().unwrap().push(body);
    (
        StatusCode::OK,
        Json(serde_json::json!({ "ok": true, "result": { "message_id": 1 } })),
    )
}

async fn send_document(State(log): State<Arc<BotLog>>, body: Bytes) -> Json<Value> {
    log.documents.lock().unwrap().push(body.len());
    Json(serde_json::json!({ "ok": true, "result": { "message_id": 2 } }))
}

/// Start the fake Bot API, return its base URL.
async fn start_bot_api(log: Arc<BotLog>) -> String {
    let app = Router::new()
        .route("/botTEST/sendMessage", post(send_message))
        .route("/botTEST/sendDocument", post(send_document))
        .with_state(log);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Source fed from a test-held channel.
struct FeedSource {
    rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    history: Vec<InboundMessage>,
}

impl FeedSource {
    fn new(history: Vec<InboundMessage>) -> (Self, mpsc::Sender<InboundMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                rx: Mutex::new(Some(rx)),
                history,
            },
            tx,
        )
    }
}

#[async_trait]
impl MessageSource for FeedSource {
    fn name(&self) -> &str {
        "feed"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let rx = self.rx.lock().unwrap().take().ok_or_else(|| ChannelError::StartupFailed {
            name: "feed".into(),
            reason: "already started".into(),
        })?;
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        })))
    }

    async fn recent_messages(
        &self,
        _channel_id: i64,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, ChannelError> {
        Ok(self.history.iter().take(limit).cloned().collect())
    }

    async fn download_attachment(&self, _attachment: &AttachmentRef) -> Result<PathBuf, ChannelError> {
        Err(ChannelError::Unsupported {
            name: "feed".into(),
            operation: "download".into(),
        })
    }
}

struct Relay {
    forwarder: Arc<Forwarder>,
    store: Arc<LibSqlBackend>,
    events: mpsc::Receiver<ForwardEvent>,
    log: Arc<BotLog>,
    mirror_route: i64,
}

async fn start_relay(render: RenderConfig) -> Relay {
    let log = Arc::new(BotLog::default());
    let base = start_bot_api(log.clone()).await;

    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    store.add_source_channel(SOURCE, "Alpha News", Some("alphanews")).await.unwrap();
    let group = store.add_group("news").await.unwrap();
    let mirror = store.add_chat_destination("mirror", MIRROR, None).await.unwrap();
    let forum = store.add_chat_destination("forum", FORUM, Some(42)).await.unwrap();
    let bogus = store
        .add_webhook_destination("bogus", "https://example.com/not-a-webhook")
        .await
        .unwrap();
    let mirror_route = store.add_route(SOURCE, mirror, Some(group)).await.unwrap();
    store.add_route(SOURCE, forum, Some(group)).await.unwrap();
    store.add_route(SOURCE, bogus, None).await.unwrap();
    store
        .add_transform_rule(&NewTransformRule {
            group_id: Some(group),
            route_id: None,
            transform_type: "keyword_blacklist".into(),
            pattern: "giveaway".into(),
            replacement: None,
            is_regex: false,
            priority: 10,
        })
        .await
        .unwrap();

    let telegram = Arc::new(
        TelegramChannel::new(
            secrecy::SecretString::from("TEST".to_string()),
            std::env::temp_dir(),
        )
        .with_api_base(base),
    );
    let chat = ChatSender::new(
        telegram,
        ChatSenderConfig {
            max_retries: 2,
            max_backoff: Duration::from_millis(50),
        },
    );
    let sender = Arc::new(RelaySender::new(
        DiscordWebhookSender::new(WebhookSenderConfig::default()).unwrap(),
        Some(chat),
    ));

    let (dispatcher, events) = DeliveryDispatcher::with_observer(
        DispatcherConfig::default(),
        sender.clone(),
        Some(store.clone()),
    );
    let forwarder = Forwarder::new(store.clone(), sender, dispatcher, Renderer::new(render))
        .with_backfill_spacing(Duration::from_millis(5));
    forwarder.reload_routes().await.unwrap();

    Relay {
        forwarder: Arc::new(forwarder),
        store,
        events,
        log,
        mirror_route,
    }
}

async fn collect_events(rx: &mut mpsc::Receiver<ForwardEvent>, n: usize) -> Vec<ForwardEvent> {
    let mut out = Vec::new();
    while out.len() < n {
        match timeout(TEST_TIMEOUT, rx.recv()).await {
            Ok(Some(event)) => out.push(event),
            _ => panic!("timed out after {} of {n} events", out.len()),
        }
    }
    out
}

#[tokio::test]
async fn relays_post_to_every_destination() {
    let mut relay = start_relay(RenderConfig::default()).await;

    let msg = InboundMessage::text(SOURCE, 77, "Markets are up @here").with_sender("Dana");
    assert_eq!(relay.forwarder.handle_message(msg).await, 3);

    let events = collect_events(&mut relay.events, 3).await;
    let failed: Vec<_> = events.iter().filter(|e| !e.success).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].destination_name, "bogus");
    assert_eq!(failed[0].error.as_deref(), Some("Invalid Discord webhook URL"));

    let messages = relay.log.messages.lock().unwrap().clone();
    assert_eq!(messages.len(), 2);
    let forum = messages
        .iter()
        .find(|m| m["chat_id"] == FORUM)
        .expect("forum delivery");
    assert_eq!(forum["message_thread_id"], 42);
    assert_eq!(
        forum["text"],
        "[Alpha News]\n\nDana\n\nMarkets are up @\u{200b}here\n\nhttps://t.me/alphanews/77"
    );
    assert_eq!(forum["link_preview_options"]["is_disabled"], true);

    let logs = relay.store.recent_forward_logs(10).await.unwrap();
    assert_eq!(logs.len(), 3);
    assert_eq!(
        logs.iter().filter(|l| l.status == ForwardStatus::Success).count(),
        2
    );
}

#[tokio::test]
async fn group_blacklist_blocks_every_route() {
    let relay = start_relay(RenderConfig::default()).await;

    let msg = InboundMessage::text(SOURCE, 78, "Huge GIVEAWAY today");
    assert_eq!(relay.forwarder.handle_message(msg).await, 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(relay.log.messages.lock().unwrap().is_empty());
    assert!(relay.store.recent_forward_logs(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn flood_wait_is_retried() {
    let mut relay = start_relay(RenderConfig::default()).await;
    relay.log.flood_once.lock().unwrap().push(MIRROR);

    let msg = InboundMessage::text(SOURCE, 79, "slow down");
    relay.forwarder.handle_message(msg).await;

    let events = collect_events(&mut relay.events, 3).await;
    let mirror = events.iter().find(|e| e.destination_name == "mirror").unwrap();
    assert!(mirror.success, "{:?}", mirror.error);
    assert_eq!(relay.log.messages.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn attachment_uploaded_to_each_chat_then_deleted() {
    let mut relay = start_relay(RenderConfig {
        skip_media_only: false,
        ..RenderConfig::default()
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chart.png");
    std::fs::write(&path, vec![7u8; 2048]).unwrap();

    let msg = InboundMessage::text(SOURCE, 80, "chart").with_attachment(&path);
    assert_eq!(relay.forwarder.handle_message(msg).await, 3);
    collect_events(&mut relay.events, 3).await;

    let documents = relay.log.documents.lock().unwrap().clone();
    assert_eq!(documents.len(), 2);
    assert!(documents.iter().all(|len| *len > 2048));

    // The last release lands just after the last event.
    for _ in 0..100 {
        if !path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!path.exists());
}

#[tokio::test]
async fn run_relays_stream_until_shutdown() {
    let mut relay = start_relay(RenderConfig::default()).await;
    let (source, feed) = FeedSource::new(Vec::new());
    let source = Arc::new(source);

    let runner = {
        let forwarder = relay.forwarder.clone();
        let source = source.clone();
        tokio::spawn(async move { forwarder.run(source.as_ref()).await })
    };

    feed.send(InboundMessage::text(SOURCE, 1, "first")).await.unwrap();
    feed.send(InboundMessage::text(-1, 2, "unrouted")).await.unwrap();
    collect_events(&mut relay.events, 3).await;

    relay.forwarder.shutdown().await;
    timeout(TEST_TIMEOUT, runner).await.unwrap().unwrap().unwrap();
    assert_eq!(relay.log.messages.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn backfill_sends_history_through_one_route() {
    let relay = start_relay(RenderConfig::default()).await;
    let (source, _feed) = FeedSource::new(vec![
        InboundMessage::text(SOURCE, 1, "old news"),
        InboundMessage::text(SOURCE, 2, "giveaway inside"),
        InboundMessage::text(SOURCE, 3, "older news"),
    ]);

    let (ok, failed) = relay
        .forwarder
        .backfill(&source, SOURCE, relay.mirror_route, 10, None)
        .await
        .unwrap();
    // Group rules do not apply to backfill, so the giveaway goes through too.
    assert_eq!((ok, failed), (3, 0));

    let messages = relay.log.messages.lock().unwrap().clone();
    let texts: Vec<&str> = messages.iter().filter_map(|m| m["text"].as_str()).collect();
    assert_eq!(texts, vec!["old news", "giveaway inside", "older news"]);
    assert!(messages.iter().all(|m| m["chat_id"] == MIRROR));
}
