//! Periodic purge of expired rate-limit counters and CSRF tokens.
//!
//! Runs on its own task so storage growth stays bounded regardless of request
//! traffic. Expired rows are already ignored by readers; the sweep only
//! reclaims space.

use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error};

use crate::store::{PurgeReport, StoreError, TokenStore, with_timeout};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Run one purge now.
///
/// # Errors
/// Returns `StoreError` if the purge fails or times out.
pub async fn sweep_once(
    store: &dyn TokenStore,
    timeout: Duration,
) -> Result<PurgeReport, StoreError> {
    with_timeout(timeout, store.purge_expired(Utc::now())).await
}

/// Spawn the sweep loop. The first purge runs one `interval` after start.
#[must_use]
pub fn spawn_sweeper(
    store: Arc<dyn TokenStore>,
    interval: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match sweep_once(store.as_ref(), timeout).await {
                Ok(report) => debug!(
                    tokens = report.tokens,
                    counters = report.counters,
                    "Purged expired gate records"
                ),
                Err(err) => error!("Failed to purge expired gate records: {err}"),
            }
        }
    })
}
