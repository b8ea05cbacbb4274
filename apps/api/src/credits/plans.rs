//! Plan catalog: default credit allowances per tier, and the rules for
//! creating a subscription or moving it to another tier.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::credits::models::{CreditBucket, Feature, PlanTier, Subscription};

/// Lengths applied when a plan starts. Loaded from config at startup.
#[derive(Debug, Clone, Copy)]
pub struct PlanSettings {
    pub credit_ttl: Duration,
    pub trial_length: Duration,
    pub billing_period: Duration,
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            credit_ttl: Duration::days(30),
            trial_length: Duration::days(7),
            billing_period: Duration::days(30),
        }
    }
}

/// A request to start (or switch to) a plan.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanChange {
    pub plan_tier: PlanTier,
    /// Only read for `coupon`; defaults to the end of the billing period.
    #[serde(default)]
    pub coupon_expiry: Option<DateTime<Utc>>,
}

/// Uses granted per feature when a tier starts.
pub fn default_balance(tier: PlanTier, feature: Feature) -> u32 {
    let (standard, counselling) = match tier {
        PlanTier::Free => (1, 0),
        PlanTier::Trial => (3, 1),
        PlanTier::Basic | PlanTier::Coupon => (10, 2),
        PlanTier::Premium | PlanTier::Discounted => (50, 10),
    };
    match feature {
        Feature::CareerCounselling => counselling,
        _ => standard,
    }
}

/// Builds a fresh subscription for a user who has none yet.
pub fn new_subscription(
    user_id: Uuid,
    change: &PlanChange,
    settings: &PlanSettings,
    now: DateTime<Utc>,
) -> Subscription {
    let mut subscription = Subscription {
        user_id,
        plan_tier: change.plan_tier,
        period_start: now,
        period_end: now,
        trial_expiry: None,
        coupon_expiry: None,
        credit_buckets: BTreeMap::new(),
        revision: 0,
    };
    apply_plan(&mut subscription, change, settings, now);
    subscription
}

/// Moves `subscription` onto `change.plan_tier`.
///
/// Starts a new billing period and resets every bucket to the tier's default
/// balance with a fresh expiry. Remaining credits from the old tier are not
/// carried over. The revision is left for the store to bump on save.
pub fn apply_plan(
    subscription: &mut Subscription,
    change: &PlanChange,
    settings: &PlanSettings,
    now: DateTime<Utc>,
) {
    let tier = change.plan_tier;
    subscription.plan_tier = tier;
    subscription.period_start = now;
    subscription.period_end = now + settings.billing_period;

    subscription.trial_expiry = match tier {
        PlanTier::Trial => Some(now + settings.trial_length),
        _ => None,
    };
    subscription.coupon_expiry = match tier {
        PlanTier::Coupon => Some(change.coupon_expiry.unwrap_or(subscription.period_end)),
        _ => None,
    };

    let expires_at = now + settings.credit_ttl;
    subscription.credit_buckets = Feature::ALL
        .into_iter()
        .map(|feature| (feature, CreditBucket::new(default_balance(tier, feature), expires_at)))
        .collect();
}
