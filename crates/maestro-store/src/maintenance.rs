use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::store::Store;

/// Periodic store maintenance: GC stale sessions, then compact the WAL when
/// anything was actually deleted.
///
/// Runs until the process exits; errors are logged and the loop continues.
pub async fn run_loop(store: Arc<Store>, ttl_days: u32, interval_hours: u32) {
    let period = Duration::from_secs(interval_hours as u64 * 3600);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; cleanup on startup is intentional.
    loop {
        interval.tick().await;
        match store.delete_stale_sessions(ttl_days) {
            Ok(0) => {}
            Ok(n) => {
                info!(deleted = n, ttl_days, "stale sessions removed");
                if let Err(e) = store.checkpoint_truncate() {
                    error!("wal checkpoint failed: {e}");
                }
            }
            Err(e) => error!("session gc failed: {e}"),
        }
    }
}
