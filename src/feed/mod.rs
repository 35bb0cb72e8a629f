//! Market data feeds. The engine only ever sees `MarketSnapshot`s arriving
//! on its event channel; where they come from is the feed's business. The
//! synthetic feed makes the whole stack runnable with zero live
//! dependencies.

pub mod synthetic;

use crate::domain::MarketSnapshot;
use crate::errors::EngineResult;
use crate::state::{AppState, EngineEvent};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A snapshot source. `next_snapshot` must be prompt: anything that blocks
/// on the outside world belongs behind its own timeout inside the impl.
pub trait MarketFeed: Send {
    fn name(&self) -> &'static str;
    fn next_snapshot(&mut self, version: u64) -> EngineResult<MarketSnapshot>;
}

/// Feed pump task: one snapshot per cycle into the engine channel, with
/// capped exponential backoff when the source misbehaves.
pub async fn run_feed<F: MarketFeed>(
    mut feed: F,
    interval_secs: u64,
    state: Arc<AppState>,
    engine_tx: mpsc::Sender<EngineEvent>,
) {
    tracing::info!(feed = feed.name(), interval_secs, "market feed started");

    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut version: u64 = 0;
    let mut consecutive_errors: u32 = 0;

    loop {
        interval.tick().await;

        match feed.next_snapshot(version + 1) {
            Ok(snapshot) => {
                version += 1;
                consecutive_errors = 0;
                state.health.feed_beat();
                state.counters.snapshots_received.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::debug!(
                    version,
                    spot = snapshot.spot,
                    quotes = snapshot.quotes.len(),
                    "snapshot published"
                );
                if engine_tx
                    .send(EngineEvent::Snapshot(Arc::new(snapshot)))
                    .await
                    .is_err()
                {
                    tracing::error!("engine channel closed, feed shutting down");
                    return;
                }
            }
            Err(e) => {
                consecutive_errors += 1;
                tracing::warn!(error = %e, consecutive_errors, "feed error");
                // Backoff on repeated failures, capped at 30s.
                let delay = (2_u64.pow(consecutive_errors.min(5))).min(30);
                tokio::time::sleep(tokio::time::Duration::from_secs(delay)).await;
            }
        }
    }
}
