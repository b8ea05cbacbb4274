use std::sync::Arc;

use crate::config::Config;
use crate::credits::store::CreditStore;
use crate::scan::scorer::ResumeScorer;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// Subscription and credit persistence. `PgCreditStore` in production.
    pub store: Arc<dyn CreditStore>,
    /// Pluggable resume scorer behind the cvScan feature. Default: KeywordResumeScorer.
    pub scorer: Arc<dyn ResumeScorer>,
    pub config: Config,
}
