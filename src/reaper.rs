use std::time::Duration;
use tokio::time::Instant;

use crate::cleanup::{release_session, CleanupOutcome};
use crate::notify::NotificationChannel;
use crate::session::SessionRegistry;

/// Periodic sweep that force-releases sessions older than `max_age`,
/// whatever state they are in.
///
/// Spawns a tokio task that ticks every `interval` (skipping the immediate
/// first tick) and runs [`sweep`] until shut down.
pub struct Reaper {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl Reaper {
    pub fn spawn(
        registry: SessionRegistry,
        notifier: NotificationChannel,
        interval: Duration,
        max_age: Duration,
        grace: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(reap_loop(
            registry,
            notifier,
            interval,
            max_age,
            grace,
            shutdown_rx,
        ));
        Self { shutdown_tx, task }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the sweep task to finish. Consumes the handle.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn reap_loop(
    registry: SessionRegistry,
    notifier: NotificationChannel,
    interval: Duration,
    max_age: Duration,
    grace: Duration,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // Skip the first immediate tick.

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reaped = sweep(&registry, &notifier, Instant::now(), max_age, grace).await;
                if !reaped.is_empty() {
                    tracing::info!(count = reaped.len(), "reaped stale sessions");
                }
            }
            _ = shutdown_rx.changed() => return,
        }
    }
}

/// Release every session whose age at `now` strictly exceeds `max_age`.
/// Returns the ids this sweep released; sessions whose cleanup was already
/// underway elsewhere are skipped.
pub async fn sweep(
    registry: &SessionRegistry,
    notifier: &NotificationChannel,
    now: Instant,
    max_age: Duration,
    grace: Duration,
) -> Vec<String> {
    let mut stale = Vec::new();
    registry.for_each(|record| {
        if now.saturating_duration_since(record.created_at) > max_age {
            stale.push(record.id.clone());
        }
    });

    // Every release claims its record before the first await, so all stale
    // sessions are closed up front and their grace periods overlap.
    let releases = stale.into_iter().map(|id| async move {
        tracing::warn!(session_id = %id, ?max_age, "session exceeded max age");
        let outcome = release_session(registry, notifier, &id, grace).await;
        (id, outcome)
    });
    futures::future::join_all(releases)
        .await
        .into_iter()
        .filter(|(_, outcome)| *outcome == CleanupOutcome::Released)
        .map(|(id, _)| id)
        .collect()
}
