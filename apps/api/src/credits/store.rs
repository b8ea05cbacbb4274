//! Persistence for subscriptions and their credit buckets.
//!
//! `CreditStore` is the seam between the ledger and the database. The
//! Postgres implementation never decrements via load-mutate-save: debits and
//! grants are single conditional statements, and whole-record writes are
//! guarded by the subscription `revision`.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::credits::ledger::{self, LedgerError};
use crate::credits::models::{CreditBucket, Feature, PlanTier, Subscription};
use crate::models::subscription::{CreditBucketRow, SubscriptionRow};

pub mod memory;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No subscription for user {0}")]
    NotFound(Uuid),

    #[error("Subscription for user {0} was modified concurrently")]
    Conflict(Uuid),

    #[error("Corrupt credit record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait CreditStore: Send + Sync {
    async fn load(&self, user_id: Uuid) -> Result<Option<Subscription>, StoreError>;

    /// Every user that has a subscription record.
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;

    /// Persists a reconciliation pass: zeroes `zeroed` and bumps the revision.
    /// Fails with `Conflict` if the stored revision moved since `subscription` was loaded.
    async fn save_reconciled(
        &self,
        subscription: &Subscription,
        zeroed: &[Feature],
    ) -> Result<(), StoreError>;

    /// Atomic decrement-if-positive. `None` means nothing was left to consume.
    async fn try_debit(&self, user_id: Uuid, feature: Feature) -> Result<Option<u32>, StoreError>;

    async fn grant(
        &self,
        user_id: Uuid,
        feature: Feature,
        amount: u32,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<CreditBucket, StoreError>;

    /// Inserts a new subscription or overwrites plan fields and every bucket
    /// of an existing one, subject to the same revision check.
    async fn save_plan(&self, subscription: &Subscription) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct PgCreditStore {
    pool: PgPool,
}

impl PgCreditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CreditStore for PgCreditStore {
    async fn load(&self, user_id: Uuid) -> Result<Option<Subscription>, StoreError> {
        // Subscription row first: a grant landing between the two reads leaves
        // us holding an old revision, so the next save conflicts instead of
        // overwriting it.
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let buckets = sqlx::query_as::<_, CreditBucketRow>(
            "SELECT * FROM credit_buckets WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(into_subscription(row, buckets)?))
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let bucket_rows = sqlx::query_as::<_, CreditBucketRow>("SELECT * FROM credit_buckets")
            .fetch_all(&self.pool)
            .await?;

        let mut buckets_by_user: HashMap<Uuid, Vec<CreditBucketRow>> = HashMap::new();
        for bucket in bucket_rows {
            buckets_by_user.entry(bucket.user_id).or_default().push(bucket);
        }

        rows.into_iter()
            .map(|row| {
                let buckets = buckets_by_user.remove(&row.user_id).unwrap_or_default();
                into_subscription(row, buckets)
            })
            .collect()
    }

    async fn save_reconciled(
        &self,
        subscription: &Subscription,
        zeroed: &[Feature],
    ) -> Result<(), StoreError> {
        let user_id = subscription.user_id;
        let mut tx = self.pool.begin().await?;

        let bumped = sqlx::query(
            "UPDATE subscriptions SET revision = revision + 1, updated_at = now() \
             WHERE user_id = $1 AND revision = $2",
        )
        .bind(user_id)
        .bind(subscription.revision)
        .execute(&mut *tx)
        .await?;

        if bumped.rows_affected() == 0 {
            return Err(StoreError::Conflict(user_id));
        }

        // `balance > 0` keeps this commutative with a concurrent atomic debit.
        let features: Vec<String> = zeroed.iter().map(|f| f.as_str().to_string()).collect();
        let cleared = sqlx::query(
            "UPDATE credit_buckets SET balance = 0 \
             WHERE user_id = $1 AND feature = ANY($2) AND balance > 0",
        )
        .bind(user_id)
        .bind(features)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            %user_id,
            buckets = cleared.rows_affected(),
            "reconciled buckets persisted"
        );
        Ok(())
    }

    async fn try_debit(&self, user_id: Uuid, feature: Feature) -> Result<Option<u32>, StoreError> {
        let remaining: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE credit_buckets
            SET balance = balance - 1
            WHERE user_id = $1 AND feature = $2 AND balance > 0
            RETURNING balance
            "#,
        )
        .bind(user_id)
        .bind(feature.as_str())
        .fetch_optional(&self.pool)
        .await?;

        remaining
            .map(|balance| to_balance(user_id, feature, balance))
            .transpose()
    }

    async fn grant(
        &self,
        user_id: Uuid,
        feature: Feature,
        amount: u32,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<CreditBucket, StoreError> {
        let amount = i32::try_from(amount)
            .map_err(|_| StoreError::Corrupt(format!("grant amount {amount} out of range")))?;
        let expires_at = ledger::expiry_after(now, ttl)?;

        let mut tx = self.pool.begin().await?;

        let bumped = sqlx::query(
            "UPDATE subscriptions SET revision = revision + 1, updated_at = now() WHERE user_id = $1",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        if bumped.rows_affected() == 0 {
            return Err(StoreError::NotFound(user_id));
        }

        let (balance, expires_at): (i32, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO credit_buckets (user_id, feature, balance, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, feature) DO UPDATE
            SET balance = credit_buckets.balance + EXCLUDED.balance,
                expires_at = EXCLUDED.expires_at
            RETURNING balance, expires_at
            "#,
        )
        .bind(user_id)
        .bind(feature.as_str())
        .bind(amount)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CreditBucket::new(to_balance(user_id, feature, balance)?, expires_at))
    }

    async fn save_plan(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let user_id = subscription.user_id;
        let mut tx = self.pool.begin().await?;

        let written = sqlx::query(
            r#"
            INSERT INTO subscriptions
                (user_id, plan_tier, period_start, period_end, trial_expiry, coupon_expiry)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE
            SET plan_tier = EXCLUDED.plan_tier,
                period_start = EXCLUDED.period_start,
                period_end = EXCLUDED.period_end,
                trial_expiry = EXCLUDED.trial_expiry,
                coupon_expiry = EXCLUDED.coupon_expiry,
                revision = subscriptions.revision + 1,
                updated_at = now()
            WHERE subscriptions.revision = $7
            "#,
        )
        .bind(user_id)
        .bind(subscription.plan_tier.as_str())
        .bind(subscription.period_start)
        .bind(subscription.period_end)
        .bind(subscription.trial_expiry)
        .bind(subscription.coupon_expiry)
        .bind(subscription.revision)
        .execute(&mut *tx)
        .await?;

        if written.rows_affected() == 0 {
            return Err(StoreError::Conflict(user_id));
        }

        for (feature, bucket) in &subscription.credit_buckets {
            let balance = i32::try_from(bucket.balance).map_err(|_| {
                StoreError::Corrupt(format!("{feature} balance {} out of range", bucket.balance))
            })?;
            sqlx::query(
                r#"
                INSERT INTO credit_buckets (user_id, feature, balance, expires_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (user_id, feature) DO UPDATE
                SET balance = EXCLUDED.balance,
                    expires_at = EXCLUDED.expires_at
                "#,
            )
            .bind(user_id)
            .bind(feature.as_str())
            .bind(balance)
            .bind(bucket.expires_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn to_balance(user_id: Uuid, feature: Feature, balance: i32) -> Result<u32, StoreError> {
    u32::try_from(balance).map_err(|_| {
        StoreError::Corrupt(format!("user {user_id}: negative {feature} balance {balance}"))
    })
}

fn into_subscription(
    row: SubscriptionRow,
    buckets: Vec<CreditBucketRow>,
) -> Result<Subscription, StoreError> {
    let user_id = row.user_id;
    let plan_tier = row
        .plan_tier
        .parse::<PlanTier>()
        .map_err(|e| StoreError::Corrupt(format!("user {user_id}: {e}")))?;

    let mut credit_buckets = BTreeMap::new();
    for bucket in buckets {
        let feature = bucket
            .feature
            .parse::<Feature>()
            .map_err(|e| StoreError::Corrupt(format!("user {user_id}: {e}")))?;
        let balance = to_balance(user_id, feature, bucket.balance)?;
        credit_buckets.insert(feature, CreditBucket::new(balance, bucket.expires_at));
    }

    Ok(Subscription {
        user_id,
        plan_tier,
        period_start: row.period_start,
        period_end: row.period_end,
        trial_expiry: row.trial_expiry,
        coupon_expiry: row.coupon_expiry,
        credit_buckets,
        revision: row.revision,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn row(plan_tier: &str) -> SubscriptionRow {
        let now = Utc::now();
        SubscriptionRow {
            user_id: Uuid::new_v4(),
            plan_tier: plan_tier.to_string(),
            period_start: now,
            period_end: now + Duration::days(30),
            trial_expiry: None,
            coupon_expiry: None,
            revision: 4,
            created_at: now,
            updated_at: now,
        }
    }

    fn bucket_row(user_id: Uuid, feature: &str, balance: i32) -> CreditBucketRow {
        CreditBucketRow {
            user_id,
            feature: feature.to_string(),
            balance,
            expires_at: Utc::now() + Duration::days(30),
        }
    }

    #[test]
    fn test_rows_convert_into_subscription() {
        let row = row("premium");
        let user_id = row.user_id;
        let sub = into_subscription(
            row,
            vec![bucket_row(user_id, "cvScan", 3), bucket_row(user_id, "jobCV", 0)],
        )
        .unwrap();

        assert_eq!(sub.plan_tier, PlanTier::Premium);
        assert_eq!(sub.revision, 4);
        assert_eq!(sub.balance(Feature::CvScan), 3);
        assert_eq!(sub.balance(Feature::JobCv), 0);
        assert_eq!(sub.credit_buckets.len(), 2);
    }

    #[test]
    fn test_unknown_feature_row_is_corrupt() {
        let row = row("basic");
        let user_id = row.user_id;
        let err = into_subscription(row, vec![bucket_row(user_id, "coverLetter", 1)]).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(msg) if msg.contains("coverLetter")));
    }

    #[test]
    fn test_unknown_tier_row_is_corrupt() {
        let err = into_subscription(row("enterprise"), vec![]).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn test_negative_balance_row_is_corrupt() {
        let row = row("basic");
        let user_id = row.user_id;
        let err = into_subscription(row, vec![bucket_row(user_id, "analyser", -1)]).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(msg) if msg.contains("negative analyser")));
    }
}
