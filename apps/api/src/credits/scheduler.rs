use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use crate::credits::reconciliation::reconcile_all;
use crate::credits::store::CreditStore;

/// Spawns the periodic bulk reconciliation job.
/// A failed tick is logged; the loop keeps running.
pub fn spawn(store: Arc<dyn CreditStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match reconcile_all(store.as_ref(), Utc::now()).await {
                Ok(report) if !report.failed.is_empty() => warn!(
                    updated = report.updated_count,
                    failed = report.failed.len(),
                    "scheduled reconciliation finished with failures"
                ),
                Ok(report) => info!(
                    updated = report.updated_count,
                    "scheduled reconciliation finished"
                ),
                Err(err) => warn!(?err, "scheduled reconciliation tick failed"),
            }
        }
    })
}
