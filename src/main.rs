use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use teleforward::channels::TelegramChannel;
use teleforward::config::RelayConfig;
use teleforward::delivery::{ChatSender, DeliveryDispatcher, DiscordWebhookSender, RelaySender};
use teleforward::pipeline::{Forwarder, Renderer};
use teleforward::store::{LibSqlBackend, RelayStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export TELEGRAM_BOT_TOKEN=123456:ABC...");
        std::process::exit(1);
    });
    config
        .ensure_directories()
        .context("Failed to create data directories")?;

    // Initialize tracing: stderr plus a daily log file under the data dir
    let log_dir = config.resolve_data_dir().join("logs");
    let file_appender = tracing_appender::rolling::daily(&log_dir, "teleforward.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    eprintln!("📡 TeleForward v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.database_path.display());
    eprintln!("   Data dir: {}", config.resolve_data_dir().display());

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn RelayStore> = Arc::new(
        LibSqlBackend::new_local(&config.database_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open database at {}",
                    config.database_path.display()
                )
            })?,
    );

    // ── Telegram ─────────────────────────────────────────────────────────
    let telegram = Arc::new(TelegramChannel::new(
        config.telegram_bot_token.clone(),
        config.downloads_dir(),
    ));

    // ── Delivery ─────────────────────────────────────────────────────────
    let webhook = DiscordWebhookSender::new(config.webhook.clone())
        .context("Failed to build webhook HTTP client")?;
    let chat = ChatSender::new(telegram.clone(), config.chat.clone());
    let sender = Arc::new(RelaySender::new(webhook, Some(chat)));

    let (dispatcher, mut events) = DeliveryDispatcher::with_observer(
        config.dispatcher.clone(),
        sender.clone(),
        Some(Arc::clone(&store)),
    );

    // Observer: summarise outcomes at debug level; failures are already logged by workers
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::debug!(
                channel_id = event.channel_id,
                message_id = event.message_id,
                destination = %event.destination_name,
                kind = event.destination_type.as_str(),
                success = event.success,
                "Forward event"
            );
        }
    });

    let forwarder = Arc::new(Forwarder::new(
        Arc::clone(&store),
        sender,
        dispatcher,
        Renderer::new(config.render.clone()),
    ));

    let routes = forwarder
        .reload_routes()
        .await
        .context("Failed to load routes")?;
    eprintln!(
        "   Routes: {} across {} channel(s)",
        routes,
        forwarder.monitored_channels().await.len()
    );

    // Reload routes on SIGHUP
    #[cfg(unix)]
    {
        let forwarder = Arc::clone(&forwarder);
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            let Ok(mut hup) = signal(SignalKind::hangup()) else {
                tracing::warn!("SIGHUP handler unavailable; route reload disabled");
                return;
            };
            while hup.recv().await.is_some() {
                if let Err(e) = forwarder.reload_routes().await {
                    tracing::error!(error = %e, "Route reload failed");
                }
            }
        });
    }

    // ── Run until Ctrl-C or the source ends ─────────────────────────────
    let mut runner = {
        let forwarder = Arc::clone(&forwarder);
        let telegram = Arc::clone(&telegram);
        tokio::spawn(async move { forwarder.run(telegram.as_ref()).await })
    };

    let finished = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
            tracing::info!("Shutdown requested");
            None
        }
        joined = &mut runner => Some(joined),
    };

    forwarder.shutdown().await;
    let joined = match finished {
        Some(joined) => joined,
        None => runner.await,
    };
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Forwarder stopped with error"),
        Err(e) => tracing::error!(error = %e, "Forwarder task failed"),
    }

    tracing::info!("TeleForward stopped");
    Ok(())
}
