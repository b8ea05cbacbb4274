//! Axum route handlers for subscriptions and credits.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::credits::guard::run_metered;
use crate::credits::ledger::ReconcileOutcome;
use crate::credits::models::{BucketState, Feature, PlanTier, Subscription};
use crate::credits::plans::{apply_plan, new_subscription, PlanChange};
use crate::credits::reconciliation::{reconcile_all, reconcile_user, ReconcileReport};
use crate::errors::AppError;
use crate::state::AppState;

const ADMIN_KEY_HEADER: &str = "x-admin-key";
const MAX_GRANT_AMOUNT: u32 = 10_000;
const MAX_GRANT_TTL_DAYS: i64 = 3650;

// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct BucketView {
    pub feature: Feature,
    pub balance: u32,
    pub expires_at: DateTime<Utc>,
    pub state: BucketState,
}

#[derive(Debug, Serialize)]
pub struct CreditSummary {
    pub user_id: Uuid,
    pub plan_tier: PlanTier,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub trial_expiry: Option<DateTime<Utc>>,
    pub coupon_expiry: Option<DateTime<Utc>>,
    pub buckets: Vec<BucketView>,
    /// Reasons for anything zeroed while serving this request.
    pub reconciled: Vec<String>,
}

impl CreditSummary {
    fn new(subscription: &Subscription, outcome: &ReconcileOutcome, now: DateTime<Utc>) -> Self {
        Self {
            user_id: subscription.user_id,
            plan_tier: subscription.plan_tier,
            period_start: subscription.period_start,
            period_end: subscription.period_end,
            trial_expiry: subscription.trial_expiry,
            coupon_expiry: subscription.coupon_expiry,
            buckets: subscription
                .credit_buckets
                .iter()
                .map(|(feature, bucket)| BucketView {
                    feature: *feature,
                    balance: bucket.balance,
                    expires_at: bucket.expires_at,
                    state: bucket.state(now),
                })
                .collect(),
            reconciled: outcome.reason_strings(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DebitResponse {
    pub feature: Feature,
    pub remaining: u32,
}

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub amount: u32,
    /// Defaults to the configured credit TTL.
    pub ttl_days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct GrantResponse {
    pub feature: Feature,
    pub balance: u32,
    pub expires_at: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// GET /api/v1/users/:user_id/credits
///
/// Reconciles first, so the balances returned are the ones a feature request
/// would see right now.
pub async fn handle_get_credits(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<CreditSummary>, AppError> {
    let now = Utc::now();
    let (subscription, outcome) = reconcile_user(state.store.as_ref(), user_id, now).await?;
    Ok(Json(CreditSummary::new(&subscription, &outcome, now)))
}

/// PUT /api/v1/users/:user_id/subscription
///
/// Creates the subscription or moves it to another tier. Every bucket is reset
/// to the tier's default allowance.
pub async fn handle_change_plan(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(change): Json<PlanChange>,
) -> Result<Json<CreditSummary>, AppError> {
    let now = Utc::now();
    let settings = state.config.plan_settings();

    if let Some(expiry) = change.coupon_expiry {
        if change.plan_tier == PlanTier::Coupon && expiry <= now {
            return Err(AppError::Validation(
                "coupon_expiry must be in the future".to_string(),
            ));
        }
    }

    let subscription = match state.store.load(user_id).await? {
        Some(mut existing) => {
            let previous = existing.plan_tier;
            apply_plan(&mut existing, &change, &settings, now);
            info!(%user_id, from = %previous, to = %change.plan_tier, "plan changed");
            existing
        }
        None => {
            info!(%user_id, tier = %change.plan_tier, "subscription created");
            new_subscription(user_id, &change, &settings, now)
        }
    };

    state.store.save_plan(&subscription).await?;

    Ok(Json(CreditSummary::new(
        &subscription,
        &ReconcileOutcome::default(),
        now,
    )))
}

/// POST /api/v1/users/:user_id/credits/:feature/debit
///
/// Records one use of a feature whose work completed outside this service.
pub async fn handle_debit(
    State(state): State<AppState>,
    Path((user_id, feature)): Path<(Uuid, String)>,
) -> Result<Json<DebitResponse>, AppError> {
    let feature: Feature = feature.parse()?;

    let charged = run_metered(state.store.as_ref(), user_id, feature, Utc::now(), || async {
        Ok(())
    })
    .await?;

    Ok(Json(DebitResponse {
        feature,
        remaining: charged.remaining,
    }))
}

/// POST /api/v1/admin/users/:user_id/credits/:feature/grant
pub async fn handle_grant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((user_id, feature)): Path<(Uuid, String)>,
    Json(request): Json<GrantRequest>,
) -> Result<Json<GrantResponse>, AppError> {
    require_admin(&headers, &state.config)?;
    let feature: Feature = feature.parse()?;

    if request.amount == 0 || request.amount > MAX_GRANT_AMOUNT {
        return Err(AppError::Validation(format!(
            "amount must be between 1 and {MAX_GRANT_AMOUNT}"
        )));
    }
    let ttl = match request.ttl_days {
        Some(days) => grant_ttl(days)?,
        None => state.config.plan_settings().credit_ttl,
    };

    let bucket = state
        .store
        .grant(user_id, feature, request.amount, ttl, Utc::now())
        .await?;

    info!(
        %user_id,
        %feature,
        amount = request.amount,
        balance = bucket.balance,
        "credits granted"
    );

    Ok(Json(GrantResponse {
        feature,
        balance: bucket.balance,
        expires_at: bucket.expires_at,
    }))
}

/// POST /api/v1/admin/credits/reconcile
///
/// Runs the bulk reconciliation pass on demand and returns its report.
pub async fn handle_reconcile_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ReconcileReport>, AppError> {
    require_admin(&headers, &state.config)?;
    let report = reconcile_all(state.store.as_ref(), Utc::now()).await?;
    Ok(Json(report))
}

fn grant_ttl(days: i64) -> Result<Duration, AppError> {
    if !(1..=MAX_GRANT_TTL_DAYS).contains(&days) {
        return Err(AppError::Validation(format!(
            "ttl_days must be between 1 and {MAX_GRANT_TTL_DAYS}"
        )));
    }
    Duration::try_days(days)
        .ok_or_else(|| AppError::Validation("ttl_days is out of range".to_string()))
}

fn require_admin(headers: &HeaderMap, config: &Config) -> Result<(), AppError> {
    let supplied = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthorized)?;

    if supplied != config.admin_api_key {
        return Err(AppError::Unauthorized);
    }
    Ok(())
}
