//! Idle countdown sweeping shared by the observable and channel tables.
//!
//! Entries that lose their last reference get a deadline instead of a timer.
//! One sweeper task per table destroys everything past its deadline, then
//! sleeps for half of the shortest remaining countdown, clamped to the
//! configured bounds. Starting a countdown wakes the sweeper so a long sleep
//! never delays a short countdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::domain::config::SweepConfig;

/// A table with idle entries to destroy.
pub trait Sweep: Send + Sync + 'static {
    /// Destroy entries whose deadline is at or before `now`. Returns the
    /// shortest remaining countdown among entries still counting down.
    fn sweep(&self, now: Instant) -> Option<Duration>;

    fn waker(&self) -> &Notify;

    fn label(&self) -> &'static str;
}

/// Interval until the next sweep.
pub fn next_interval(bounds: &SweepConfig, shortest_remaining: Option<Duration>) -> Duration {
    match shortest_remaining {
        Some(remaining) => (remaining / 2)
            .max(bounds.min_interval)
            .min(bounds.max_interval),
        None => bounds.max_interval,
    }
}

/// Fold one entry's deadline into the running minimum.
pub fn shortest(current: Option<Duration>, deadline: Instant, now: Instant) -> Option<Duration> {
    let remaining = deadline.saturating_duration_since(now);
    Some(current.map_or(remaining, |c| c.min(remaining)))
}

/// Run the sweeper until shutdown.
pub async fn sweeper_task<T: Sweep>(
    table: Arc<T>,
    bounds: SweepConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = bounds.max_interval;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = table.waker().notified() => {}
            _ = shutdown.recv() => {
                debug!(table = table.label(), "sweeper stopped");
                return;
            }
        }
        let remaining = table.sweep(Instant::now());
        interval = next_interval(&bounds, remaining);
    }
}
