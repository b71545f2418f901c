//! Forwarder — ties routes, transforms, rendering, and the dispatcher together.
//!
//! Holds the current [`ResolvedRoutes`] snapshot behind a lock that is
//! only taken long enough to clone an `Arc`, so `reload_routes` never
//! blocks message handling and never touches queued deliveries.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, warn};

use crate::channels::MessageSource;
use crate::delivery::attachment::{SharedAttachment, delete_file};
use crate::delivery::job::{
    ChatMessage, DeliveryJob, DestinationKind, DestinationTarget, OutboundPayload, WebhookMessage,
};
use crate::delivery::{DeliveryDispatcher, EndpointSender};
use crate::error::{DatabaseError, Error};
use crate::pipeline::render::{RenderContext, Renderer};
use crate::pipeline::routes::{ResolvedRoute, ResolvedRoutes, resolve};
use crate::pipeline::transform::MessageTransformer;
use crate::pipeline::types::InboundMessage;
use crate::store::{ForwardLogEntry, ForwardStatus, RelayStore};

/// Spacing between backfilled sends.
pub const BACKFILL_SPACING: Duration = Duration::from_millis(500);

pub struct Forwarder {
    store: Arc<dyn RelayStore>,
    sender: Arc<dyn EndpointSender>,
    dispatcher: DeliveryDispatcher,
    renderer: Renderer,
    routes: RwLock<Arc<ResolvedRoutes>>,
    shutdown_tx: watch::Sender<bool>,
    backfill_spacing: Duration,
}

impl Forwarder {
    /// `sender` should be the same sender the dispatcher uses; backfill calls it directly.
    pub fn new(
        store: Arc<dyn RelayStore>,
        sender: Arc<dyn EndpointSender>,
        dispatcher: DeliveryDispatcher,
        renderer: Renderer,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            sender,
            dispatcher,
            renderer,
            routes: RwLock::new(Arc::new(ResolvedRoutes::default())),
            shutdown_tx,
            backfill_spacing: BACKFILL_SPACING,
        }
    }

    pub fn with_backfill_spacing(mut self, spacing: Duration) -> Self {
        self.backfill_spacing = spacing;
        self
    }

    /// Rebuild the routing snapshot from the store. Returns the number of valid routes.
    pub async fn reload_routes(&self) -> Result<usize, DatabaseError> {
        let table = self.store.routing_table().await?;
        let resolved = Arc::new(resolve(&table));
        let count = resolved.route_count();
        let channels = resolved.channel_ids().len();
        *self.routes.write().await = resolved;
        info!(routes = count, channels, "Routes reloaded");
        Ok(count)
    }

    async fn snapshot(&self) -> Arc<ResolvedRoutes> {
        self.routes.read().await.clone()
    }

    /// Source channels with at least one valid route.
    pub async fn monitored_channels(&self) -> Vec<i64> {
        self.snapshot().await.channel_ids()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow() || self.dispatcher.is_closed()
    }

    /// Relay one inbound message whose attachment, if any, is already local.
    /// Returns the number of jobs enqueued.
    ///
    /// The message's attachment is owned from here on: it is either handed
    /// to the queued jobs or deleted before returning.
    pub async fn handle_message(&self, msg: InboundMessage) -> usize {
        self.relay(None, msg).await
    }

    /// Relay one inbound message from `source`, downloading its attachment
    /// only when at least one route will receive it.
    pub async fn handle_from(&self, source: &dyn MessageSource, msg: InboundMessage) -> usize {
        self.relay(Some(source), msg).await
    }

    async fn relay(&self, source: Option<&dyn MessageSource>, mut msg: InboundMessage) -> usize {
        if msg.outgoing {
            debug!(channel_id = msg.channel_id, message_id = msg.message_id, "Skipping own message");
            return discard_attachment(&msg).await;
        }
        if self.is_shutting_down() {
            return discard_attachment(&msg).await;
        }

        let routes = self.snapshot().await;
        let Some(channel) = routes.get(msg.channel_id) else {
            return discard_attachment(&msg).await;
        };

        if self.renderer.config().skip_media_only && msg.is_media_only() {
            debug!(
                channel_id = msg.channel_id,
                message_id = msg.message_id,
                "Skipping media-only message"
            );
            return discard_attachment(&msg).await;
        }

        let result = channel.transformer.transform(&msg.text);
        if !result.should_forward {
            debug!(
                channel_id = msg.channel_id,
                message_id = msg.message_id,
                blocked_by = result.blocked_by.as_deref().unwrap_or_default(),
                "Message blocked"
            );
            return discard_attachment(&msg).await;
        }
        let text = self
            .renderer
            .neutralize_mass_mentions(&result.transformed_text);

        let targets: Vec<&ResolvedRoute> = channel
            .routes
            .iter()
            .filter(|route| {
                let looped = matches!(
                    route.destination.target,
                    DestinationTarget::Chat { chat_id, .. } if chat_id == msg.channel_id
                );
                if looped {
                    debug!(route_id = route.route_id, "Skipping route back into its source chat");
                }
                !looped
            })
            .collect();

        if !targets.is_empty() && msg.attachment.is_none() {
            if let (Some(source), Some(file)) = (source, &msg.attachment_ref) {
                match source.download_attachment(file).await {
                    Ok(path) => msg.attachment = Some(path),
                    Err(e) => warn!(
                        channel_id = msg.channel_id,
                        message_id = msg.message_id,
                        error = %e,
                        "Attachment download failed; relaying without it"
                    ),
                }
            }
        }

        let attachment = match (&msg.attachment, targets.len()) {
            (Some(path), 0) => {
                delete_file(path).await;
                None
            }
            (Some(path), n) => Some(Arc::new(SharedAttachment::new(path, n))),
            (None, _) => None,
        };

        let mut enqueued = 0;
        for route in targets {
            let job = self.build_job(route, &msg, &result.original_text, &text, attachment.clone());
            if self.dispatcher.enqueue(job).await {
                enqueued += 1;
            }
        }
        debug!(
            channel_id = msg.channel_id,
            message_id = msg.message_id,
            enqueued,
            "Message fanned out"
        );
        enqueued
    }

    fn build_job(
        &self,
        route: &ResolvedRoute,
        msg: &InboundMessage,
        original_text: &str,
        text: &str,
        attachment: Option<Arc<SharedAttachment>>,
    ) -> DeliveryJob {
        let fallback_name = msg.channel_id.to_string();
        let channel_name = if route.channel_name.is_empty() {
            fallback_name.as_str()
        } else {
            route.channel_name.as_str()
        };
        let ctx = RenderContext {
            channel_name,
            channel_username: route.channel_username.as_deref(),
            sender_name: msg.sender_name.as_deref(),
            message_id: msg.message_id,
            timestamp: msg.timestamp,
        };
        let file = msg.attachment.as_deref();

        let payload = match route.destination.kind() {
            DestinationKind::DiscordWebhook => {
                OutboundPayload::Webhook(self.renderer.webhook_message(&ctx, text, file))
            }
            DestinationKind::TelegramChat => {
                OutboundPayload::Chat(self.renderer.chat_message(&ctx, text, file))
            }
        };

        DeliveryJob {
            destination: route.destination.clone(),
            payload,
            route_id: Some(route.route_id),
            channel_id: msg.channel_id,
            message_id: msg.message_id,
            original_text: original_text.to_string(),
            transformed_text: text.to_string(),
            attachment,
            created_at: Utc::now(),
        }
    }

    /// Consume the source's stream until it ends or shutdown is requested.
    pub async fn run(&self, source: &dyn MessageSource) -> Result<(), Error> {
        let channels = self.monitored_channels().await;
        if channels.is_empty() {
            warn!("No active routes configured");
        }
        info!(source = source.name(), channels = channels.len(), "Starting forwarder");

        let mut stream = source.start().await?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            let msg = tokio::select! {
                biased;
                _ = shutdown_rx.wait_for(|stop| *stop) => break,
                next = stream.next() => match next {
                    Some(msg) => msg,
                    None => {
                        info!(source = source.name(), "Source stream ended");
                        break;
                    }
                },
            };
            self.handle_from(source, msg).await;
        }
        Ok(())
    }

    /// Stop accepting messages and close the dispatcher.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.dispatcher.close().await;
    }

    /// Re-send recent messages of one channel through one route.
    ///
    /// Only the route's own rules apply. Messages go out text-only,
    /// one at a time, directly through the endpoint sender. Progress
    /// `(done, total)` is reported for every message considered.
    pub async fn backfill(
        &self,
        source: &dyn MessageSource,
        channel_id: i64,
        route_id: i64,
        limit: usize,
        progress: Option<mpsc::Sender<(usize, usize)>>,
    ) -> Result<(usize, usize), Error> {
        let routes = self.snapshot().await;
        let route = match routes.route(route_id) {
            Some((route_channel, route)) if route_channel == channel_id => route.clone(),
            _ => {
                return Err(DatabaseError::NotFound {
                    entity: "active route for channel".into(),
                    id: format!("{route_id} ({channel_id})"),
                }
                .into());
            }
        };
        let transformer = MessageTransformer::new(route.route_rules.clone());

        let messages = source.recent_messages(channel_id, limit).await?;
        let total = messages.len();
        info!(channel_id, route_id, total, "Backfill started");

        let (mut succeeded, mut failed) = (0usize, 0usize);
        for (i, msg) in messages.iter().enumerate() {
            if !msg.text.trim().is_empty() {
                let result = transformer.transform(&msg.text);
                if result.should_forward {
                    let text = self
                        .renderer
                        .neutralize_mass_mentions(&result.transformed_text);
                    let payload = self.text_only_payload(route.destination.kind(), &text);
                    let outcome = self.sender.send(&route.destination, &payload).await;

                    let entry = ForwardLogEntry {
                        route_id: Some(route_id),
                        message_id: msg.message_id,
                        destination_type: route.destination.kind().as_str().to_string(),
                        destination_name: route.destination.name.clone(),
                        original_text: msg.text.clone(),
                        transformed_text: text,
                        has_media: false,
                        status: if outcome.success {
                            ForwardStatus::Success
                        } else {
                            ForwardStatus::Error
                        },
                        error_message: outcome.error.clone(),
                    };
                    if let Err(e) = self.store.append_forward_log(&entry).await {
                        warn!(error = %e, "Failed to write backfill log");
                    }

                    if outcome.success {
                        succeeded += 1;
                    } else {
                        failed += 1;
                    }
                    tokio::time::sleep(self.backfill_spacing).await;
                }
            }

            if let Some(tx) = &progress {
                let _ = tx.send((i + 1, total)).await;
            }
        }

        info!(channel_id, route_id, succeeded, failed, "Backfill finished");
        Ok((succeeded, failed))
    }

    fn text_only_payload(&self, kind: DestinationKind, text: &str) -> OutboundPayload {
        match kind {
            DestinationKind::DiscordWebhook => OutboundPayload::Webhook(WebhookMessage {
                content: text.to_string(),
                allowed_mentions: Some(self.renderer.allowed_mentions()),
                ..Default::default()
            }),
            DestinationKind::TelegramChat => OutboundPayload::Chat(ChatMessage {
                text: text.to_string(),
                file_path: None,
            }),
        }
    }
}

async fn discard_attachment(msg: &InboundMessage) -> usize {
    if let Some(path) = &msg.attachment {
        delete_file(Path::new(path)).await;
    }
    0
}
