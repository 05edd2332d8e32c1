use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::store::LogStore;

/// Background task that re-reads the transaction log when it grows.
pub async fn run_reloader(store: Arc<LogStore>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match store.reload_if_changed().await {
            Ok(true) => debug!("transaction log reloaded"),
            Ok(false) => {}
            Err(e) => {
                // Keep serving the previous snapshot
                warn!("reload of {} failed: {e}", store.path().display());
            }
        }
    }
}
