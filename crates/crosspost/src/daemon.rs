//! The bot daemon: queue scheduler plus the Telegram update poller.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::FixedOffset;
use miette::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crosspost_queue::{
    CaptionOptions, Clock, ExecutorConfig, JobExecutor, JobStore, RetryPolicy, Scheduler,
    SchedulerParts, SystemClock,
};
use crosspost_telegram::{
    ChatId, TelegramChannelPublisher, TelegramClient, TelegramUserNotifier,
};
use crosspost_twitter::{TwitterClient, TwitterConfig};

use crate::handler::CommandHandler;
use crate::scratch::TempFileManager;

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub telegram_bot_token: String,
    pub telegram_channel: ChatId,
    pub twitter_bearer_token: String,
    pub twitter_proxy_url: Option<String>,
    /// Scratch directory for downloaded media.
    pub temp_dir: PathBuf,
    pub queue_db: PathBuf,
    /// Total attempts per job, the first included.
    pub max_attempts: u32,
    pub retry_increment_secs: u32,
    /// Fail posts without media instead of posting their text.
    pub require_media: bool,
    pub quote_marker: String,
    /// Offset used when telling users about times.
    pub notify_offset: FixedOffset,
    /// Long-poll timeout for `getUpdates`.
    pub poll_timeout_secs: u64,
}

/// Run until Ctrl-C, or until the job store fails.
pub async fn run(config: DaemonConfig) -> Result<()> {
    let version = std::env::var("APP_VERSION")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
    info!(version = %version, "crosspost starting");

    let scratch = TempFileManager::create(&config.temp_dir).map_err(|e| {
        miette::miette!(
            "failed to create temp dir {}: {}",
            config.temp_dir.display(),
            e
        )
    })?;

    let store = JobStore::open(&config.queue_db).map_err(|e| {
        miette::miette!(
            "failed to open job store {}: {}",
            config.queue_db.display(),
            e
        )
    })?;
    let store = Arc::new(store);

    let mut twitter_config = TwitterConfig::new(&config.twitter_bearer_token);
    twitter_config.proxy_url = config.twitter_proxy_url.clone();
    let twitter = TwitterClient::new(twitter_config)
        .map_err(|e| miette::miette!("failed to create Twitter client: {}", e))?;

    let telegram = Arc::new(
        TelegramClient::new(&config.telegram_bot_token)
            .map_err(|e| miette::miette!("failed to create Telegram client: {}", e))?,
    );
    let me = telegram
        .get_me()
        .await
        .map_err(|e| miette::miette!("Telegram getMe failed: {}", e))?;
    info!(
        bot_id = me.id,
        username = me.username.as_deref().unwrap_or(""),
        channel = %config.telegram_channel,
        "connected to Telegram"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let executor = JobExecutor::new(
        Arc::new(twitter),
        Arc::new(TelegramChannelPublisher::new(
            Arc::clone(&telegram),
            config.telegram_channel.clone(),
        )),
        Arc::new(scratch),
        ExecutorConfig {
            require_media: config.require_media,
            caption: CaptionOptions {
                quote_marker: config.quote_marker.clone(),
                ..CaptionOptions::default()
            },
        },
    );
    let scheduler = Scheduler::new(SchedulerParts {
        store,
        executor,
        notifier: Arc::new(TelegramUserNotifier::new(
            Arc::clone(&telegram),
            config.notify_offset,
        )),
        policy: RetryPolicy {
            max_attempts: config.max_attempts,
            increment: chrono::Duration::seconds(i64::from(config.retry_increment_secs)),
        },
        clock: Arc::clone(&clock),
    });
    scheduler.start();

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    let handler = CommandHandler::new(
        scheduler.clone(),
        Arc::clone(&telegram),
        clock,
        &config.quote_marker,
    );
    let poller = tokio::spawn(poll_updates(
        Arc::clone(&telegram),
        handler,
        config.poll_timeout_secs,
        shutdown_rx.clone(),
    ));

    let mut shutdown_wait = shutdown_rx;
    let outcome = tokio::select! {
        reason = scheduler.halted() => Err(reason),
        _ = shutdown_wait.wait_for(|stop| *stop) => Ok(()),
    };

    let _ = shutdown_tx.send(true);
    if let Err(e) = poller.await {
        warn!(error = %e, "update poller task failed");
    }
    scheduler.shutdown().await;

    match outcome {
        Ok(()) => {
            info!("crosspost stopped");
            Ok(())
        }
        Err(reason) => {
            error!(reason = %reason, "scheduler halted");
            Err(miette::miette!("scheduler halted: {}", reason))
        }
    }
}

/// Long-poll Telegram and dispatch every message to the handler.
async fn poll_updates(
    telegram: Arc<TelegramClient>,
    handler: CommandHandler,
    timeout_secs: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("update poller started");
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(60),
        max_elapsed_time: None, // Retry forever
        ..Default::default()
    };
    let mut offset = None;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let result = tokio::select! {
            biased;

            _ = shutdown_rx.changed() => continue,
            result = telegram.get_updates(offset, timeout_secs) => result,
        };

        match result {
            Ok(updates) => {
                backoff.reset();
                if !updates.is_empty() {
                    debug!(count = updates.len(), "received updates");
                }
                for update in updates {
                    offset = Some(update.update_id + 1);
                    if let Some(message) = update.message {
                        handler.handle(&message).await;
                    }
                }
            }
            Err(e) => {
                let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                warn!(error = %e, wait_secs = wait.as_secs(), "getUpdates failed, backing off");

                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }

    info!("update poller stopped");
}
