use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use chunkferry_core::Ledger;

/// Background task that prunes abandoned staging areas.
///
/// Runs on an interval and deletes every staging area whose directory has
/// not changed for `ttl`.
pub async fn run_cleanup_loop(ledger: Arc<Ledger>, ttl: Duration, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match ledger.prune_idle(ttl).await {
            Ok(count) => {
                if count > 0 {
                    info!("Cleanup: pruned {} idle staging areas", count);
                }
            }
            Err(e) => {
                warn!("Cleanup error: {}", e);
            }
        }
    }
}
