//! Delivery dispatcher — one FIFO queue and worker per destination.
//!
//! Workers are spawned lazily the first time a destination key is seen.
//! A global semaphore caps concurrent endpoint calls across all workers.
//! Each finished job is logged to the store and emitted as a
//! [`ForwardEvent`] under one lock, then its attachment reference is released.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DispatcherConfig;
use crate::delivery::job::{DeliveryJob, DestinationKey, ForwardEvent, SendOutcome};
use crate::delivery::sender::EndpointSender;
use crate::store::{ForwardLogEntry, ForwardStatus, RelayStore};

struct WorkerHandle {
    tx: mpsc::Sender<DeliveryJob>,
    task: JoinHandle<()>,
}

/// State shared by every worker.
struct Shared {
    sender: Arc<dyn EndpointSender>,
    store: Option<Arc<dyn RelayStore>>,
    observer: Option<mpsc::Sender<ForwardEvent>>,
    permits: Semaphore,
    /// Serializes log writes with event emission.
    log_lock: Mutex<()>,
}

pub struct DeliveryDispatcher {
    config: DispatcherConfig,
    shared: Arc<Shared>,
    workers: Mutex<HashMap<DestinationKey, WorkerHandle>>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl DeliveryDispatcher {
    pub fn new(
        config: DispatcherConfig,
        sender: Arc<dyn EndpointSender>,
        store: Option<Arc<dyn RelayStore>>,
    ) -> Self {
        Self::build(config, sender, store, None)
    }

    /// Like [`new`](Self::new), plus a receiver of per-delivery events.
    pub fn with_observer(
        config: DispatcherConfig,
        sender: Arc<dyn EndpointSender>,
        store: Option<Arc<dyn RelayStore>>,
    ) -> (Self, mpsc::Receiver<ForwardEvent>) {
        let (tx, rx) = mpsc::channel(config.observer_capacity.max(1));
        (Self::build(config, sender, store, Some(tx)), rx)
    }

    fn build(
        config: DispatcherConfig,
        sender: Arc<dyn EndpointSender>,
        store: Option<Arc<dyn RelayStore>>,
        observer: Option<mpsc::Sender<ForwardEvent>>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            sender,
            store,
            observer,
            permits: Semaphore::new(config.max_in_flight.max(1)),
            log_lock: Mutex::new(()),
        });
        Self {
            config,
            shared,
            workers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of destination workers spawned so far.
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Queue a job on its destination's worker.
    ///
    /// Waits while the destination queue is full. Returns `false` (and
    /// releases the job's attachment reference) if the dispatcher is closed.
    pub async fn enqueue(&self, job: DeliveryJob) -> bool {
        let tx = {
            let mut workers = self.workers.lock().await;
            if self.is_closed() {
                drop(workers);
                discard(job).await;
                return false;
            }
            let key = job.destination.key();
            workers
                .entry(key)
                .or_insert_with(|| self.spawn_worker(&job))
                .tx
                .clone()
        };

        match tx.send(job).await {
            Ok(()) => true,
            Err(mpsc::error::SendError(job)) => {
                discard(job).await;
                false
            }
        }
    }

    fn spawn_worker(&self, first: &DeliveryJob) -> WorkerHandle {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let shared = self.shared.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        debug!(
            destination = %first.destination.name,
            kind = first.destination.kind().as_str(),
            "Spawning destination worker"
        );
        let task = tokio::spawn(worker_loop(shared, rx, shutdown_rx));
        WorkerHandle { tx, task }
    }

    /// Stop all workers.
    ///
    /// Closes the global limiter so no new send starts. Workers finish the
    /// send already in progress, bounded by one shared grace period, then
    /// any still running are aborted. Queued jobs are discarded and their
    /// attachment references released. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        self.shared.permits.close();

        let workers: Vec<WorkerHandle> = {
            let mut map = self.workers.lock().await;
            map.drain().map(|(_, handle)| handle).collect()
        };
        let count = workers.len();

        let mut tasks: Vec<JoinHandle<()>> = workers
            .into_iter()
            .map(|WorkerHandle { tx, task }| {
                drop(tx);
                task
            })
            .collect();

        let drained = tokio::time::timeout(
            self.config.shutdown_grace,
            futures::future::join_all(tasks.iter_mut()),
        )
        .await;
        if drained.is_err() {
            let pending = tasks.iter().filter(|t| !t.is_finished()).count();
            warn!(pending, "Destination workers did not stop within grace period; aborting");
            for task in &tasks {
                task.abort();
            }
        }
        info!(workers = count, "Delivery dispatcher closed");
    }
}

async fn worker_loop(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<DeliveryJob>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|closed| *closed) => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        process(&shared, job).await;
    }

    rx.close();
    let mut dropped = 0usize;
    while let Some(job) = rx.recv().await {
        discard(job).await;
        dropped += 1;
    }
    if dropped > 0 {
        debug!(dropped, "Discarded queued jobs at shutdown");
    }
}

async fn process(shared: &Shared, job: DeliveryJob) {
    let outcome = match shared.permits.acquire().await {
        Ok(_permit) => {
            match AssertUnwindSafe(shared.sender.send(&job.destination, &job.payload))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => SendOutcome::failed("Unexpected error while sending"),
            }
        }
        Err(_) => SendOutcome::failed("Dispatcher is shutting down"),
    };

    record(shared, &job, &outcome).await;

    if let Some(attachment) = &job.attachment {
        attachment.release().await;
    }
}

async fn record(shared: &Shared, job: &DeliveryJob, outcome: &SendOutcome) {
    let _guard = shared.log_lock.lock().await;

    if outcome.success {
        info!(
            channel_id = job.channel_id,
            message_id = job.message_id,
            destination = %job.destination.name,
            "Forwarded message"
        );
    } else {
        warn!(
            channel_id = job.channel_id,
            message_id = job.message_id,
            destination = %job.destination.name,
            error = outcome.error.as_deref().unwrap_or_default(),
            "Delivery failed"
        );
    }

    if let Some(store) = &shared.store {
        let entry = ForwardLogEntry {
            route_id: job.route_id,
            message_id: job.message_id,
            destination_type: job.destination.kind().as_str().to_string(),
            destination_name: job.destination.name.clone(),
            original_text: job.original_text.clone(),
            transformed_text: job.transformed_text.clone(),
            has_media: job.has_media(),
            status: if outcome.success {
                ForwardStatus::Success
            } else {
                ForwardStatus::Error
            },
            error_message: outcome.error.clone(),
        };
        if let Err(e) = store.append_forward_log(&entry).await {
            warn!(error = %e, "Failed to write forward log");
        }
    }

    if let Some(observer) = &shared.observer {
        let event = ForwardEvent {
            channel_id: job.channel_id,
            message_id: job.message_id,
            destination_name: job.destination.name.clone(),
            destination_type: job.destination.kind(),
            success: outcome.success,
            error: outcome.error.clone(),
            timestamp: Utc::now(),
        };
        match observer.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => warn!("Observer channel full; dropping forward event"),
        }
    }
}

/// Drop a job that will never be sent, releasing its attachment reference.
async fn discard(job: DeliveryJob) {
    if let Some(attachment) = &job.attachment {
        attachment.release().await;
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::delivery::attachment::SharedAttachment;
    use crate::delivery::job::{
        ChatMessage, Destination, DestinationTarget, OutboundPayload, WebhookMessage,
    };
    use crate::store::LibSqlBackend;

    /// Records calls; behaviour keyed by destination name.
    #[derive(Default)]
    struct FakeSender {
        calls: StdMutex<Vec<(String, i64)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl FakeSender {
        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Default::default()
            })
        }

        fn calls_for(&self, name: &str) -> Vec<i64> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(n, _)| n == name)
                .map(|(_, id)| *id)
                .collect()
        }
    }

    #[async_trait]
    impl EndpointSender for FakeSender {
        async fn send(&self, destination: &Destination, payload: &OutboundPayload) -> SendOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let text = match payload {
                OutboundPayload::Webhook(m) => m.content.clone(),
                OutboundPayload::Chat(m) => m.text.clone(),
            };
            let id: i64 = text.parse().unwrap_or(-1);
            self.calls.lock().unwrap().push((destination.name.clone(), id));

            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match destination.name.as_str() {
                "panics" if id == 1 => panic!("sender blew up"),
                "hangs" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    SendOutcome::ok()
                }
                "fails" => SendOutcome::failed("Discord returned status 404: Unknown Webhook"),
                _ => SendOutcome::ok(),
            }
        }
    }

    fn webhook(name: &str, n: u32) -> Destination {
        Destination {
            id: n as i64,
            name: name.into(),
            target: DestinationTarget::Webhook {
                url: format!("https://discord.com/api/webhooks/{n}/token"),
            },
        }
    }

    fn job(destination: Destination, message_id: i64, attachment: Option<Arc<SharedAttachment>>) -> DeliveryJob {
        DeliveryJob {
            destination,
            payload: OutboundPayload::Webhook(WebhookMessage {
                content: message_id.to_string(),
                ..Default::default()
            }),
            route_id: Some(1),
            channel_id: -100,
            message_id,
            original_text: message_id.to_string(),
            transformed_text: message_id.to_string(),
            attachment,
            created_at: Utc::now(),
        }
    }

    fn config(max_in_flight: usize) -> DispatcherConfig {
        DispatcherConfig {
            max_in_flight,
            queue_capacity: 4,
            shutdown_grace: Duration::from_millis(200),
            observer_capacity: 256,
        }
    }

    async fn collect_events(rx: &mut mpsc::Receiver<ForwardEvent>, n: usize) -> Vec<ForwardEvent> {
        let mut events = Vec::new();
        while events.len() < n {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Some(event)) => events.push(event),
                _ => break,
            }
        }
        events
    }

    async fn wait_until_gone(path: &std::path::Path) {
        for _ in 0..100 {
            if !path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn temp_attachment() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, b"jpeg").unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn preserves_fifo_per_destination() {
        let sender = FakeSender::with_delay(Duration::from_millis(2));
        let (dispatcher, mut events) = DeliveryDispatcher::with_observer(config(5), sender.clone(), None);

        // Queue capacity is 4, so this also exercises backpressure.
        for id in 0..20 {
            assert!(dispatcher.enqueue(job(webhook("a", 1), id, None)).await);
            assert!(dispatcher.enqueue(job(webhook("b", 2), id, None)).await);
        }
        let got = collect_events(&mut events, 40).await;
        assert_eq!(got.len(), 40);

        let expected: Vec<i64> = (0..20).collect();
        assert_eq!(sender.calls_for("a"), expected);
        assert_eq!(sender.calls_for("b"), expected);
        assert_eq!(dispatcher.worker_count().await, 2);
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn same_endpoint_shares_one_worker() {
        let sender = FakeSender::with_delay(Duration::ZERO);
        let (dispatcher, mut events) = DeliveryDispatcher::with_observer(config(5), sender, None);

        let mut renamed = webhook("a", 1);
        renamed.name = "a-again".into();
        dispatcher.enqueue(job(webhook("a", 1), 1, None)).await;
        dispatcher.enqueue(job(renamed, 2, None)).await;

        collect_events(&mut events, 2).await;
        assert_eq!(dispatcher.worker_count().await, 1);
        dispatcher.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn global_limit_caps_concurrent_sends() {
        let sender = FakeSender::with_delay(Duration::from_millis(20));
        let (dispatcher, mut events) = DeliveryDispatcher::with_observer(config(2), sender.clone(), None);

        for n in 0..8u32 {
            dispatcher.enqueue(job(webhook(&format!("d{n}"), n), 1, None)).await;
        }
        assert_eq!(collect_events(&mut events, 8).await.len(), 8);
        assert!(sender.max_in_flight.load(Ordering::SeqCst) <= 2);
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn attachment_deleted_after_every_destination_finishes() {
        let (_dir, path) = temp_attachment();
        let sender = FakeSender::with_delay(Duration::from_millis(5));
        let (dispatcher, mut events) = DeliveryDispatcher::with_observer(config(5), sender, None);

        let shared = Arc::new(SharedAttachment::new(&path, 3));
        dispatcher.enqueue(job(webhook("ok", 1), 1, Some(shared.clone()))).await;
        dispatcher.enqueue(job(webhook("fails", 2), 1, Some(shared.clone()))).await;
        dispatcher.enqueue(job(webhook("panics", 3), 1, Some(shared.clone()))).await;

        let got = collect_events(&mut events, 3).await;
        assert_eq!(got.len(), 3);
        assert_eq!(got.iter().filter(|e| e.success).count(), 1);
        // Release follows the event.
        wait_until_gone(&path).await;
        assert!(!path.exists());
        assert_eq!(shared.remaining().await, 0);
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn worker_survives_sender_panic() {
        let sender = FakeSender::with_delay(Duration::ZERO);
        let (dispatcher, mut events) = DeliveryDispatcher::with_observer(config(5), sender, None);

        dispatcher.enqueue(job(webhook("panics", 1), 1, None)).await;
        dispatcher.enqueue(job(webhook("panics", 1), 2, None)).await;

        let got = collect_events(&mut events, 2).await;
        assert_eq!(got.len(), 2);
        assert!(!got[0].success);
        assert_eq!(got[0].error.as_deref(), Some("Unexpected error while sending"));
        assert!(got[1].success);
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn enqueue_after_close_releases_attachment() {
        let (_dir, path) = temp_attachment();
        let dispatcher = DeliveryDispatcher::new(config(5), FakeSender::with_delay(Duration::ZERO), None);
        dispatcher.close().await;

        let shared = Arc::new(SharedAttachment::new(&path, 1));
        assert!(!dispatcher.enqueue(job(webhook("a", 1), 1, Some(shared))).await);
        assert!(!path.exists());
        assert_eq!(dispatcher.worker_count().await, 0);
    }

    #[tokio::test]
    async fn close_aborts_hung_worker_and_discards_queue() {
        let (_dir, path) = temp_attachment();
        let sender = FakeSender::with_delay(Duration::ZERO);
        let dispatcher = DeliveryDispatcher::new(config(5), sender.clone(), None);

        let shared = Arc::new(SharedAttachment::new(&path, 3));
        for id in 0..3 {
            dispatcher
                .enqueue(job(webhook("hangs", 1), id, Some(shared.clone())))
                .await;
        }
        // Let the worker pick up the first job.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        dispatcher.close().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(dispatcher.is_closed());
        assert_eq!(sender.calls_for("hangs"), vec![0]);

        // The aborted worker drops its queue; the last handle cleans up the file.
        drop(shared);
        wait_until_gone(&path).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn close_releases_queued_attachments() {
        let (_dir, path) = temp_attachment();
        let sender = FakeSender::with_delay(Duration::from_millis(100));
        let dispatcher = DeliveryDispatcher::new(config(5), sender.clone(), None);

        let shared = Arc::new(SharedAttachment::new(&path, 3));
        for id in 0..3 {
            dispatcher
                .enqueue(job(webhook("slow", 1), id, Some(shared.clone())))
                .await;
        }
        drop(shared);
        tokio::time::sleep(Duration::from_millis(20)).await;

        dispatcher.close().await;
        assert_eq!(sender.calls_for("slow"), vec![0]);
        wait_until_gone(&path).await;
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn close_stops_workers_waiting_for_a_permit() {
        let sender = FakeSender::with_delay(Duration::from_millis(300));
        let (dispatcher, mut events) = DeliveryDispatcher::with_observer(
            DispatcherConfig {
                shutdown_grace: Duration::from_secs(2),
                ..config(1)
            },
            sender.clone(),
            None,
        );

        for n in 0..4u32 {
            dispatcher.enqueue(job(webhook(&format!("d{n}"), n), 1, None)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        dispatcher.close().await;
        let took = started.elapsed();

        assert_eq!(sender.calls.lock().unwrap().len(), 1);
        assert!(took < Duration::from_millis(1000), "close took {took:?}");

        let got = collect_events(&mut events, 4).await;
        assert_eq!(got.iter().filter(|e| e.success).count(), 1);
        assert!(
            got.iter()
                .filter(|e| !e.success)
                .all(|e| e.error.as_deref() == Some("Dispatcher is shutting down"))
        );
    }

    #[tokio::test]
    async fn close_waits_once_for_all_hung_workers() {
        let sender = FakeSender::with_delay(Duration::ZERO);
        let dispatcher = DeliveryDispatcher::new(config(5), sender.clone(), None);

        for n in 0..4u32 {
            let mut hung = webhook("hangs", n);
            hung.name = "hangs".into();
            dispatcher.enqueue(job(hung, n as i64, None)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        dispatcher.close().await;
        // Four workers share one 200ms grace period.
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn outcomes_are_logged_to_store() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let sender = FakeSender::with_delay(Duration::ZERO);
        let (dispatcher, mut events) =
            DeliveryDispatcher::with_observer(config(5), sender, Some(store.clone()));

        dispatcher.enqueue(job(webhook("ok", 1), 7, None)).await;
        dispatcher.enqueue(job(webhook("fails", 2), 7, None)).await;
        collect_events(&mut events, 2).await;

        let logs = store.recent_forward_logs(10).await.unwrap();
        assert_eq!(logs.len(), 2);
        let failed = logs.iter().find(|l| l.destination_name == "fails").unwrap();
        assert_eq!(failed.status, ForwardStatus::Error);
        assert_eq!(
            failed.error_message.as_deref(),
            Some("Discord returned status 404: Unknown Webhook")
        );
        let ok = logs.iter().find(|l| l.destination_name == "ok").unwrap();
        assert_eq!(ok.status, ForwardStatus::Success);
        assert_eq!(ok.destination_type, "discord_webhook");
        dispatcher.close().await;
    }

    #[tokio::test]
    async fn chat_jobs_use_their_own_worker() {
        let sender = FakeSender::with_delay(Duration::ZERO);
        let (dispatcher, mut events) = DeliveryDispatcher::with_observer(config(5), sender, None);

        let chat = Destination {
            id: 9,
            name: "mirror".into(),
            target: DestinationTarget::Chat {
                chat_id: -200,
                topic_id: None,
            },
        };
        let mut chat_job = job(chat, 3, None);
        chat_job.payload = OutboundPayload::Chat(ChatMessage {
            text: "3".into(),
            file_path: None,
        });
        dispatcher.enqueue(chat_job).await;
        dispatcher.enqueue(job(webhook("a", 1), 3, None)).await;

        let got = collect_events(&mut events, 2).await;
        assert_eq!(got.len(), 2);
        assert_eq!(dispatcher.worker_count().await, 2);
        dispatcher.close().await;
    }
}
