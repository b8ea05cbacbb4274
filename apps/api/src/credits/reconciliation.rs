//! Per-user and bulk reconciliation: run `ledger::reconcile`, persist only
//! when something changed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::credits::ledger::{self, ReconcileOutcome};
use crate::credits::models::Subscription;
use crate::credits::store::{CreditStore, StoreError};

/// Reload-and-retry budget when a concurrent grant or plan change wins the revision race.
const MAX_RECONCILE_ATTEMPTS: u32 = 3;

/// Loads the user's subscription, zeroes expired credits and saves if needed.
/// Returns the reconciled record as persisted.
pub async fn reconcile_user(
    store: &dyn CreditStore,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(Subscription, ReconcileOutcome), StoreError> {
    let mut attempt = 0;
    loop {
        attempt += 1;

        let mut subscription = store
            .load(user_id)
            .await?
            .ok_or(StoreError::NotFound(user_id))?;

        let outcome = ledger::reconcile(&mut subscription, now);
        if !outcome.changed {
            return Ok((subscription, outcome));
        }

        match store
            .save_reconciled(&subscription, &outcome.zeroed_features())
            .await
        {
            Ok(()) => {
                info!(
                    %user_id,
                    reasons = ?outcome.reason_strings(),
                    "expired credits reconciled"
                );
                subscription.revision += 1;
                return Ok((subscription, outcome));
            }
            Err(StoreError::Conflict(_)) if attempt < MAX_RECONCILE_ATTEMPTS => {
                warn!(%user_id, attempt, "subscription changed during reconciliation, reloading");
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedReconciliation {
    pub user_id: Uuid,
    pub error: String,
}

/// Aggregate result of a bulk pass, surfaced to the admin trigger.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    /// Successful writes only.
    pub updated_count: usize,
    pub per_user_reasons: BTreeMap<Uuid, Vec<String>>,
    pub failed: Vec<FailedReconciliation>,
}

/// Reconciles every subscription in the store.
///
/// A failed write for one user is logged and recorded in the report; the
/// pass carries on with the remaining users. Only listing the subscriptions
/// can fail the whole call.
pub async fn reconcile_all(
    store: &dyn CreditStore,
    now: DateTime<Utc>,
) -> Result<ReconcileReport, StoreError> {
    let subscriptions = store.list_subscriptions().await?;
    let mut report = ReconcileReport {
        scanned: subscriptions.len(),
        ..Default::default()
    };

    for mut subscription in subscriptions {
        let user_id = subscription.user_id;
        let outcome = ledger::reconcile(&mut subscription, now);
        if !outcome.changed {
            continue;
        }

        let saved = match store
            .save_reconciled(&subscription, &outcome.zeroed_features())
            .await
        {
            Ok(()) => Ok(outcome),
            // Someone wrote the record after we listed it; redo this user from a fresh load.
            Err(StoreError::Conflict(_)) => reconcile_user(store, user_id, now)
                .await
                .map(|(_, outcome)| outcome),
            Err(err) => Err(err),
        };

        match saved {
            Ok(outcome) if outcome.changed => {
                report.updated_count += 1;
                report
                    .per_user_reasons
                    .insert(user_id, outcome.reason_strings());
            }
            Ok(_) => {}
            Err(err) => {
                error!(%user_id, ?err, "failed to persist reconciled credits, continuing");
                report.failed.push(FailedReconciliation {
                    user_id,
                    error: err.to_string(),
                });
            }
        }
    }

    info!(
        scanned = report.scanned,
        updated = report.updated_count,
        failed = report.failed.len(),
        "bulk credit reconciliation finished"
    );

    Ok(report)
}
