//! Bot runtime: wiring and supervision.
//!
//! Builds the staging area, session store, ffmpeg capability, Telegram
//! channel and router, then runs three long-lived tasks: the supervised
//! update listener, the periodic session sweep, and the event loop that
//! fans each inbound event out to its own task. Per-user ordering is the
//! dispatcher's job; the loop itself never blocks on one user's work.

use crate::channels::{Event, TelegramChannel, TelegramPresenter};
use crate::config::Config;
use crate::router::Router;
use crate::session::SessionStore;
use crate::staging::StagingArea;
use crate::transform::{Dispatcher, FfmpegTransform};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How often the eviction sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Run the bot until ctrl-c.
pub async fn run(config: Config) -> Result<()> {
    config.validate()?;

    let staging = Arc::new(
        StagingArea::new(
            config.expanded_temp_dir(),
            config.video_extensions.clone(),
            config.audio_extensions.clone(),
        )
        .await
        .context("Failed to create staging directory")?,
    );
    let store = Arc::new(SessionStore::new());
    let transform = Arc::new(FfmpegTransform::new(
        config.ffmpeg_path.clone(),
        config.ffprobe_path.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), staging.clone(), transform));

    let channel = Arc::new(TelegramChannel::new(
        config.bot_token.clone(),
        config.max_upload_bytes,
        staging.clone(),
    ));
    let presenter = Arc::new(TelegramPresenter::new(channel.clone()));

    let router = Arc::new(Router::new(
        store.clone(),
        staging.clone(),
        dispatcher,
        presenter,
        config.video_extensions.clone(),
        config.audio_extensions.clone(),
        Duration::from_millis(config.progress_throttle_ms),
    ));

    let (tx, mut rx) = mpsc::channel::<Event>(64);

    spawn_supervised_listener(channel, tx);
    spawn_session_sweep(
        store,
        staging,
        Duration::from_secs(config.session_ttl_secs),
    );

    tracing::info!("clipbot is running, press ctrl-c to stop");

    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                let Some(event) = maybe_event else {
                    tracing::warn!("Event channel closed, shutting down");
                    break;
                };
                let router = router.clone();
                tokio::spawn(async move {
                    router.handle(event).await;
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}

/// Keep the long-poll listener alive, restarting with backoff. Clean
/// exits (the receiver side closed) end supervision.
fn spawn_supervised_listener(channel: Arc<TelegramChannel>, tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        let mut backoff = Duration::from_secs(1);
        loop {
            match channel.listen(tx.clone()).await {
                Ok(()) => {
                    tracing::info!("Telegram listener stopped");
                    return;
                }
                Err(e) => {
                    tracing::error!("Telegram listener failed: {e}, restarting in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                }
            }
        }
    });
}

/// Periodically evict idle sessions and delete their orphaned files.
fn spawn_session_sweep(store: Arc<SessionStore>, staging: Arc<StagingArea>, ttl: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let orphaned = store.evict_idle(ttl);
            if !orphaned.is_empty() {
                tracing::info!(count = orphaned.len(), "Cleaning up orphaned artifacts");
            }
            for artifact in &orphaned {
                staging.delete(artifact).await;
            }
        }
    });
}
