//! Background read caches.
//!
//! Each cache owns one `watch` channel. A single refresher task builds a
//! complete snapshot and publishes it whole; any number of cloned handles
//! read the last published value without waiting on the network.

pub mod balances;
pub mod rates;
pub mod spreads;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// The writer side of a cache: fetches and publishes one snapshot per call.
#[async_trait]
pub trait Refresh: Send {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    /// Fetch fresh data and publish it. An error leaves the previous
    /// snapshot in place.
    async fn refresh(&mut self) -> Result<()>;
}

/// Drive `refresher` every `every` until `shutdown` flips to `true`.
pub async fn run_poller<R: Refresh>(
    mut refresher: R,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = refresher.name();
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(cache = name, interval_ms = every.as_millis() as u64, "Poller started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match refresher.refresh().await {
                    Ok(()) => debug!(cache = name, "Snapshot refreshed"),
                    Err(e) => warn!(cache = name, error = %e, "Refresh failed, keeping previous snapshot"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!(cache = name, "Poller stopped");
}
