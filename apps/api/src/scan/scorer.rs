//! Resume scoring: a pluggable scorer that measures a resume's
//! coverage of the keywords a job description asks for.
//!
//! Default: `KeywordResumeScorer`, deterministic and local.
//! `AppState` holds an `Arc<dyn ResumeScorer>`, so a semantic backend can be
//! swapped in without touching the handler or the credit flow.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

// ────────────────────────────────────────────────────────────────────────────
// Output data models
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordMatch {
    pub keyword: String,
    pub occurrences: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub overall_score: u32, // 0 – 100
    pub matched: Vec<KeywordMatch>,
    pub missing: Vec<String>,
    pub recommendation: String,
    pub scorer_backend: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Trait definition
// ────────────────────────────────────────────────────────────────────────────

/// Carried in `AppState` as `Arc<dyn ResumeScorer>`.
#[async_trait]
pub trait ResumeScorer: Send + Sync {
    async fn score(&self, resume_text: &str, keywords: &[String]) -> Result<ScanReport, AppError>;
}

/// Case-insensitive substring matching of each distinct keyword.
///
/// overall_score = matched keywords / distinct keywords × 100, rounded.
pub struct KeywordResumeScorer;

#[async_trait]
impl ResumeScorer for KeywordResumeScorer {
    async fn score(&self, resume_text: &str, keywords: &[String]) -> Result<ScanReport, AppError> {
        compute_keyword_scan(resume_text, keywords)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Core keyword algorithm
// ────────────────────────────────────────────────────────────────────────────

fn compute_keyword_scan(resume_text: &str, keywords: &[String]) -> Result<ScanReport, AppError> {
    if resume_text.trim().is_empty() {
        return Err(AppError::Validation("resume_text cannot be empty".to_string()));
    }

    let text_lower = resume_text.to_lowercase();
    let distinct = distinct_keywords(keywords);

    if distinct.is_empty() {
        return Err(AppError::Validation("keywords cannot be empty".to_string()));
    }

    let mut matched = Vec::new();
    let mut missing = Vec::new();

    for keyword in &distinct {
        let occurrences = text_lower.matches(&keyword.to_lowercase()).count() as u32;
        if occurrences > 0 {
            matched.push(KeywordMatch {
                keyword: keyword.clone(),
                occurrences,
            });
        } else {
            missing.push(keyword.clone());
        }
    }

    let overall_score =
        ((matched.len() as f32 / distinct.len() as f32) * 100.0).round() as u32;
    let recommendation = build_recommendation(overall_score, &missing);

    Ok(ScanReport {
        overall_score,
        matched,
        missing,
        recommendation,
        scorer_backend: "keyword".to_string(),
    })
}

/// Trimmed, non-empty keywords with case-insensitive duplicates removed.
/// Keeps the first spelling seen.
fn distinct_keywords(keywords: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .filter(|k| seen.insert(k.to_lowercase()))
        .map(str::to_string)
        .collect()
}

fn build_recommendation(score: u32, missing: &[String]) -> String {
    let top_missing: Vec<&str> = missing.iter().take(3).map(String::as_str).collect();

    if score >= 80 {
        "Strong match. Your resume covers the key requirements of this role.".to_string()
    } else if score >= 60 {
        format!(
            "Moderate match ({score}/100). Consider mentioning: {}.",
            top_missing.join(", ")
        )
    } else {
        format!(
            "Low match ({score}/100). Missing: {}. Tailor your resume before applying.",
            top_missing.join(", ")
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
