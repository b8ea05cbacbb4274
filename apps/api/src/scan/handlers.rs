//! Axum route handler for the CV scan feature.

use axum::{extract::State, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::credits::guard::run_metered;
use crate::credits::models::Feature;
use crate::errors::AppError;
use crate::scan::scorer::{ResumeScorer, ScanReport};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CvScanRequest {
    pub user_id: Uuid,
    pub resume_text: String,
    /// Keywords from the target job description.
    pub keywords: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CvScanResponse {
    pub report: ScanReport,
    pub remaining_credits: u32,
}

/// POST /api/v1/features/cv-scan
///
/// Scores a resume against job keywords. Costs one cvScan credit, charged only
/// when the scan succeeds.
pub async fn handle_cv_scan(
    State(state): State<AppState>,
    Json(request): Json<CvScanRequest>,
) -> Result<Json<CvScanResponse>, AppError> {
    if request.keywords.iter().all(|k| k.trim().is_empty()) {
        return Err(AppError::Validation("keywords cannot be empty".to_string()));
    }

    let user_id = request.user_id;
    let scorer = state.scorer.clone();
    let charged = run_metered(
        state.store.as_ref(),
        user_id,
        Feature::CvScan,
        Utc::now(),
        move || async move { scorer.score(&request.resume_text, &request.keywords).await },
    )
    .await?;

    Ok(Json(CvScanResponse {
        report: charged.output,
        remaining_credits: charged.remaining,
    }))
}
