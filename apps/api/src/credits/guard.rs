//! Metered feature execution: reconcile → check → work → debit.
//!
//! The debit only happens after the work succeeds, and it goes through the
//! store's atomic decrement, so two concurrent requests can never spend the
//! same credit twice.

use std::future::Future;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::credits::ledger::{self, ReconcileOutcome};
use crate::credits::models::{BucketState, Feature, Subscription};
use crate::credits::reconciliation::reconcile_user;
use crate::credits::store::CreditStore;
use crate::errors::AppError;

/// Output of a metered feature plus the balance left after paying for it.
#[derive(Debug)]
pub struct Charged<T> {
    pub output: T,
    pub remaining: u32,
}

/// Runs `work` on behalf of `user_id`, charging one `feature` credit if and
/// only if it succeeds.
pub async fn run_metered<T, F, Fut>(
    store: &dyn CreditStore,
    user_id: Uuid,
    feature: Feature,
    now: DateTime<Utc>,
    work: F,
) -> Result<Charged<T>, AppError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let (subscription, outcome) = reconcile_user(store, user_id, now).await?;

    ledger::ensure_available(&subscription, feature).map_err(|_| AppError::InsufficientCredit {
        feature,
        expired: credits_expired(&subscription, &outcome, feature, now),
    })?;

    let output = work().await?;

    match store.try_debit(user_id, feature).await? {
        Some(remaining) => {
            info!(%user_id, %feature, remaining, "credit debited");
            Ok(Charged { output, remaining })
        }
        None => {
            // Another request spent the last credit between our check and now.
            warn!(%user_id, %feature, "credit exhausted by a concurrent request");
            Err(AppError::InsufficientCredit {
                feature,
                expired: false,
            })
        }
    }
}

fn credits_expired(
    subscription: &Subscription,
    outcome: &ReconcileOutcome,
    feature: Feature,
    now: DateTime<Utc>,
) -> bool {
    outcome.zeroed(feature)
        || ledger::plan_expired(subscription, now)
        || subscription
            .bucket(feature)
            .map(|b| b.state(now) == BucketState::Expired)
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::models::PlanTier;
    use crate::credits::plans::{new_subscription, PlanChange, PlanSettings};
    use crate::credits::store::memory::MemoryStore;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store_with(tier: PlanTier, now: DateTime<Utc>) -> (MemoryStore, Subscription) {
        let sub = new_subscription(
            Uuid::new_v4(),
            &PlanChange {
                plan_tier: tier,
                coupon_expiry: None,
            },
            &PlanSettings::default(),
            now,
        );
        (MemoryStore::with([sub.clone()]), sub)
    }

    #[tokio::test]
    async fn test_successful_work_debits_one_credit() {
        let now = Utc::now();
        let (store, sub) = store_with(PlanTier::Free, now);

        let charged = run_metered(&store, sub.user_id, Feature::CvScan, now, || async {
            Ok::<_, AppError>("scanned")
        })
        .await
        .unwrap();

        assert_eq!(charged.output, "scanned");
        assert_eq!(charged.remaining, 0);
        assert_eq!(store.get(sub.user_id).unwrap().balance(Feature::CvScan), 0);
    }

    #[tokio::test]
    async fn test_failed_work_does_not_debit() {
        let now = Utc::now();
        let (store, sub) = store_with(PlanTier::Basic, now);

        let result = run_metered(&store, sub.user_id, Feature::Optimizer, now, || async {
            Err::<(), _>(AppError::Validation("bad input".to_string()))
        })
        .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(store.get(sub.user_id).unwrap().balance(Feature::Optimizer), 10);
    }

    #[tokio::test]
    async fn test_no_credit_blocks_work() {
        let now = Utc::now();
        let (store, sub) = store_with(PlanTier::Free, now);
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result = run_metered(&store, sub.user_id, Feature::CareerCounselling, now, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, AppError>(())
        })
        .await;

        assert!(matches!(
            result,
            Err(AppError::InsufficientCredit {
                feature: Feature::CareerCounselling,
                expired: false
            })
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_credit_is_reported_as_expired() {
        let now = Utc::now();
        let (store, sub) = store_with(PlanTier::Trial, now - Duration::days(8));

        let result = run_metered(&store, sub.user_id, Feature::Analyser, now, || async {
            Ok::<_, AppError>(())
        })
        .await;

        assert!(matches!(
            result,
            Err(AppError::InsufficientCredit {
                feature: Feature::Analyser,
                expired: true
            })
        ));
        // The trial cascade was persisted even though the request was refused.
        assert!(!store.get(sub.user_id).unwrap().has_funded_bucket());
    }

    #[tokio::test]
    async fn test_expired_trial_stays_expired_on_later_requests() {
        let now = Utc::now();
        let (store, sub) = store_with(PlanTier::Trial, now - Duration::days(8));

        for _ in 0..2 {
            let result = run_metered(&store, sub.user_id, Feature::JobCv, now, || async {
                Ok::<_, AppError>(())
            })
            .await;
            assert!(matches!(
                result,
                Err(AppError::InsufficientCredit {
                    feature: Feature::JobCv,
                    expired: true
                })
            ));
        }
        // Only the first request had anything to zero.
        assert_eq!(store.reconcile_writes(), vec![sub.user_id]);
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let store = MemoryStore::default();
        let result = run_metered(&store, Uuid::new_v4(), Feature::JobCv, Utc::now(), || async {
            Ok::<_, AppError>(())
        })
        .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_credit_spent_during_work_is_not_double_spent() {
        let now = Utc::now();
        let (store, sub) = store_with(PlanTier::Free, now);
        let user_id = sub.user_id;
        let racer = &store;

        // A concurrent request consumes the only credit while our work runs.
        let result = run_metered(&store, user_id, Feature::DownloadCv, now, move || async move {
            racer.try_debit(user_id, Feature::DownloadCv).await?;
            Ok::<_, AppError>(())
        })
        .await;

        assert!(matches!(result, Err(AppError::InsufficientCredit { .. })));
        assert_eq!(store.get(user_id).unwrap().balance(Feature::DownloadCv), 0);
    }
}
