use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::credits::ledger::LedgerError;

/// A metered feature. Each one owns exactly one credit bucket.
///
/// The set is closed: a new feature means a new variant here and a new
/// allowed value in the `credit_buckets.feature` check constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Feature {
    #[serde(rename = "analyser")]
    Analyser,
    #[serde(rename = "optimizer")]
    Optimizer,
    #[serde(rename = "jobCV")]
    JobCv,
    #[serde(rename = "careerCounselling")]
    CareerCounselling,
    #[serde(rename = "downloadCV")]
    DownloadCv,
    #[serde(rename = "cvScan")]
    CvScan,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::Analyser,
        Feature::Optimizer,
        Feature::JobCv,
        Feature::CareerCounselling,
        Feature::DownloadCv,
        Feature::CvScan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Analyser => "analyser",
            Feature::Optimizer => "optimizer",
            Feature::JobCv => "jobCV",
            Feature::CareerCounselling => "careerCounselling",
            Feature::DownloadCv => "downloadCV",
            Feature::CvScan => "cvScan",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|feature| feature.as_str() == s)
            .ok_or_else(|| LedgerError::InvalidFeature(s.to_string()))
    }
}

/// Subscription category. Decides which plan-level expiry rule, if any,
/// cascades to every bucket at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Basic,
    Premium,
    Trial,
    Coupon,
    Discounted,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Basic => "basic",
            PlanTier::Premium => "premium",
            PlanTier::Trial => "trial",
            PlanTier::Coupon => "coupon",
            PlanTier::Discounted => "discounted",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(PlanTier::Free),
            "basic" => Ok(PlanTier::Basic),
            "premium" => Ok(PlanTier::Premium),
            "trial" => Ok(PlanTier::Trial),
            "coupon" => Ok(PlanTier::Coupon),
            "discounted" => Ok(PlanTier::Discounted),
            other => Err(LedgerError::InvalidPlanTier(other.to_string())),
        }
    }
}

/// Observable state of a single bucket.
///
/// `Expired` and `Exhausted` persist identically (balance 0) once reconciled;
/// the distinction only matters for telling the user *why* they are blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketState {
    Funded,
    Exhausted,
    Expired,
}

/// A named, time-boxed counter of remaining uses for one feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBucket {
    pub balance: u32,
    pub expires_at: DateTime<Utc>,
}

impl CreditBucket {
    pub fn new(balance: u32, expires_at: DateTime<Utc>) -> Self {
        Self {
            balance,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn state(&self, now: DateTime<Utc>) -> BucketState {
        if self.is_expired(now) {
            BucketState::Expired
        } else if self.balance == 0 {
            BucketState::Exhausted
        } else {
            BucketState::Funded
        }
    }
}

/// The subscription sub-document of a user, with its credit buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: Uuid,
    pub plan_tier: PlanTier,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub trial_expiry: Option<DateTime<Utc>>,
    pub coupon_expiry: Option<DateTime<Utc>>,
    pub credit_buckets: BTreeMap<Feature, CreditBucket>,
    /// Bumped on every whole-record write; guards against stale saves.
    pub revision: i64,
}

impl Subscription {
    pub fn bucket(&self, feature: Feature) -> Option<&CreditBucket> {
        self.credit_buckets.get(&feature)
    }

    /// Remaining uses for `feature`. A missing bucket reads as empty.
    pub fn balance(&self, feature: Feature) -> u32 {
        self.bucket(feature).map(|b| b.balance).unwrap_or(0)
    }

    pub fn has_funded_bucket(&self) -> bool {
        self.credit_buckets.values().any(|b| b.balance > 0)
    }
}
