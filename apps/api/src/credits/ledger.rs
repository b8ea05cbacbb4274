//! Entitlement ledger: the grant / debit / reconcile rules for credit buckets.
//!
//! Everything here is pure: functions take the current time explicitly and
//! mutate an in-memory `Subscription`. Persisting the result is the caller's
//! job (see `credits::store` and `credits::reconciliation`).

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::credits::models::{CreditBucket, Feature, PlanTier, Subscription};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("No {0} credits remaining")]
    InsufficientCredit(Feature),

    #[error("Unknown feature: {0}")]
    InvalidFeature(String),

    #[error("Unknown plan tier: {0}")]
    InvalidPlanTier(String),

    #[error("Credit expiry is out of range")]
    ExpiryOutOfRange,
}

/// Which plan-level deadline cascaded to every bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanExpiry {
    Trial,
    Coupon,
    DiscountedPeriod,
}

/// A single mutation performed by `reconcile`, kept structured until it is
/// rendered for a log line or a response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum ReconcileReason {
    /// Plan-level expiry; `zeroed` lists the buckets that still held credits.
    PlanExpired { plan: PlanExpiry, zeroed: Vec<Feature> },
    BucketExpired { feature: Feature },
}

impl ReconcileReason {
    pub fn zeroed_features(&self) -> &[Feature] {
        match self {
            ReconcileReason::PlanExpired { zeroed, .. } => zeroed,
            ReconcileReason::BucketExpired { feature } => std::slice::from_ref(feature),
        }
    }
}

impl fmt::Display for ReconcileReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileReason::PlanExpired { plan, .. } => match plan {
                PlanExpiry::Trial => f.write_str("trial expired"),
                PlanExpiry::Coupon => f.write_str("coupon expired"),
                PlanExpiry::DiscountedPeriod => f.write_str("discounted plan expired"),
            },
            ReconcileReason::BucketExpired { feature } => write!(f, "{feature} tokens expired"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub changed: bool,
    pub reasons: Vec<ReconcileReason>,
}

impl ReconcileOutcome {
    /// Every bucket this pass forced to zero, deduplicated and ordered.
    pub fn zeroed_features(&self) -> Vec<Feature> {
        let mut features: Vec<Feature> = self
            .reasons
            .iter()
            .flat_map(|r| r.zeroed_features().iter().copied())
            .collect();
        features.sort();
        features.dedup();
        features
    }

    pub fn zeroed(&self, feature: Feature) -> bool {
        self.reasons
            .iter()
            .any(|r| r.zeroed_features().contains(&feature))
    }

    pub fn reason_strings(&self) -> Vec<String> {
        self.reasons.iter().map(ToString::to_string).collect()
    }
}

/// Zeroes expired credits.
///
/// Plan-level expiry (trial, coupon, discounted period) clears every bucket
/// and records one reason; afterwards each bucket is checked against its own
/// `expires_at`. Both checks always run. A second call with no intervening
/// grant or debit reports `changed == false`.
pub fn reconcile(subscription: &mut Subscription, now: DateTime<Utc>) -> ReconcileOutcome {
    let mut reasons = Vec::new();

    if let Some(plan) = expired_plan(subscription, now) {
        if subscription.has_funded_bucket() {
            let zeroed = zero_funded_buckets(subscription);
            reasons.push(ReconcileReason::PlanExpired { plan, zeroed });
        }
    }

    for (feature, bucket) in subscription.credit_buckets.iter_mut() {
        if bucket.is_expired(now) && bucket.balance > 0 {
            bucket.balance = 0;
            reasons.push(ReconcileReason::BucketExpired { feature: *feature });
        }
    }

    ReconcileOutcome {
        changed: !reasons.is_empty(),
        reasons,
    }
}

fn expired_plan(subscription: &Subscription, now: DateTime<Utc>) -> Option<PlanExpiry> {
    let (plan, deadline) = match subscription.plan_tier {
        PlanTier::Trial => (PlanExpiry::Trial, subscription.trial_expiry?),
        PlanTier::Coupon => (PlanExpiry::Coupon, subscription.coupon_expiry?),
        PlanTier::Discounted => (PlanExpiry::DiscountedPeriod, subscription.period_end),
        PlanTier::Free | PlanTier::Basic | PlanTier::Premium => return None,
    };
    (deadline < now).then_some(plan)
}

fn zero_funded_buckets(subscription: &mut Subscription) -> Vec<Feature> {
    subscription
        .credit_buckets
        .iter_mut()
        .filter(|(_, bucket)| bucket.balance > 0)
        .map(|(feature, bucket)| {
            bucket.balance = 0;
            *feature
        })
        .collect()
}

/// Balance check without mutation. Callers reconcile first.
pub fn ensure_available(subscription: &Subscription, feature: Feature) -> Result<(), LedgerError> {
    if subscription.balance(feature) > 0 {
        Ok(())
    } else {
        Err(LedgerError::InsufficientCredit(feature))
    }
}

/// Consumes one unit of `feature`, returning the remaining balance.
/// An empty (or missing) bucket is rejected and left untouched.
pub fn debit(subscription: &mut Subscription, feature: Feature) -> Result<u32, LedgerError> {
    match subscription.credit_buckets.get_mut(&feature) {
        Some(bucket) if bucket.balance > 0 => {
            bucket.balance -= 1;
            Ok(bucket.balance)
        }
        _ => Err(LedgerError::InsufficientCredit(feature)),
    }
}

/// `now + ttl`, or `ExpiryOutOfRange` when the result is not representable.
pub fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, LedgerError> {
    now.checked_add_signed(ttl)
        .ok_or(LedgerError::ExpiryOutOfRange)
}

/// Adds `amount` to the bucket and moves its expiry to `now + ttl`,
/// regardless of where the previous expiry was. Leaves the subscription
/// untouched when the expiry overflows.
pub fn grant(
    subscription: &mut Subscription,
    feature: Feature,
    amount: u32,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<CreditBucket, LedgerError> {
    let expires_at = expiry_after(now, ttl)?;
    let bucket = subscription
        .credit_buckets
        .entry(feature)
        .or_insert_with(|| CreditBucket::new(0, now));
    bucket.balance = bucket.balance.saturating_add(amount);
    bucket.expires_at = expires_at;
    Ok(bucket.clone())
}

/// Whether the tier's own deadline has passed.
pub fn plan_expired(subscription: &Subscription, now: DateTime<Utc>) -> bool {
    expired_plan(subscription, now).is_some()
}
