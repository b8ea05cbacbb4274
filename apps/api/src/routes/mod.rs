pub mod health;

use axum::{
    routing::{get, post, put},
    Router,
};

use crate::credits::handlers;
use crate::scan::handlers as scan_handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Subscriptions & credits
        .route(
            "/api/v1/users/:user_id/credits",
            get(handlers::handle_get_credits),
        )
        .route(
            "/api/v1/users/:user_id/subscription",
            put(handlers::handle_change_plan),
        )
        .route(
            "/api/v1/users/:user_id/credits/:feature/debit",
            post(handlers::handle_debit),
        )
        // Metered features
        .route(
            "/api/v1/features/cv-scan",
            post(scan_handlers::handle_cv_scan),
        )
        // Admin
        .route(
            "/api/v1/admin/users/:user_id/credits/:feature/grant",
            post(handlers::handle_grant),
        )
        .route(
            "/api/v1/admin/credits/reconcile",
            post(handlers::handle_reconcile_all),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::config::Config;
    use crate::credits::models::Feature;
    use crate::credits::store::memory::MemoryStore;
    use crate::scan::scorer::KeywordResumeScorer;

    fn test_app() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let state = AppState {
            store: store.clone(),
            scorer: Arc::new(KeywordResumeScorer),
            config: Config::for_tests(),
        };
        (build_router(state), store)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
        admin: bool,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if admin {
            builder = builder.header("x-admin-key", "test-admin-key");
        }
        let body = body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty);

        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn subscribe(app: &Router, user_id: Uuid, tier: &str) {
        let (status, _) = send(
            app,
            "PUT",
            &format!("/api/v1/users/{user_id}/subscription"),
            Some(json!({ "plan_tier": tier })),
            false,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    fn scan_body(user_id: Uuid, resume_text: &str) -> Value {
        json!({
            "user_id": user_id,
            "resume_text": resume_text,
            "keywords": ["rust", "postgres"]
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = test_app();
        let (status, body) = send(&app, "GET", "/health", None, false).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_admin_routes_require_key() {
        let (app, _) = test_app();
        let (status, body) = send(&app, "POST", "/api/v1/admin/credits/reconcile", None, false).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");

        let (status, body) = send(&app, "POST", "/api/v1/admin/credits/reconcile", None, true).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["updated_count"], 0);
    }

    #[tokio::test]
    async fn test_unknown_feature_is_bad_request() {
        let (app, _) = test_app();
        let user_id = Uuid::new_v4();
        subscribe(&app, user_id, "basic").await;

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/v1/users/{user_id}/credits/coverLetter/debit"),
            None,
            false,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_FEATURE");
    }

    #[tokio::test]
    async fn test_subscription_creates_all_buckets() {
        let (app, _) = test_app();
        let user_id = Uuid::new_v4();
        subscribe(&app, user_id, "premium").await;

        let (status, body) = send(
            &app,
            "GET",
            &format!("/api/v1/users/{user_id}/credits"),
            None,
            false,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["plan_tier"], "premium");
        let buckets = body["buckets"].as_array().unwrap();
        assert_eq!(buckets.len(), Feature::ALL.len());
        assert!(buckets.iter().all(|b| b["state"] == "funded"));
    }

    #[tokio::test]
    async fn test_credits_for_unknown_user_is_not_found() {
        let (app, _) = test_app();
        let (status, _) = send(
            &app,
            "GET",
            &format!("/api/v1/users/{}/credits", Uuid::new_v4()),
            None,
            false,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cv_scan_spends_credit_then_requires_purchase() {
        let (app, store) = test_app();
        let user_id = Uuid::new_v4();
        subscribe(&app, user_id, "free").await;

        let resume = "Rust backend engineer, five years of Postgres tuning.";
        let (status, body) = send(&app, "POST", "/api/v1/features/cv-scan", Some(scan_body(user_id, resume)), false).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["report"]["overall_score"], 100);
        assert_eq!(body["remaining_credits"], 0);

        let (status, body) = send(&app, "POST", "/api/v1/features/cv-scan", Some(scan_body(user_id, resume)), false).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["error"]["code"], "INSUFFICIENT_CREDITS");
        assert_eq!(store.get(user_id).unwrap().balance(Feature::CvScan), 0);
    }

    #[tokio::test]
    async fn test_failed_scan_is_not_charged() {
        let (app, store) = test_app();
        let user_id = Uuid::new_v4();
        subscribe(&app, user_id, "free").await;

        let (status, _) = send(&app, "POST", "/api/v1/features/cv-scan", Some(scan_body(user_id, "   ")), false).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(store.get(user_id).unwrap().balance(Feature::CvScan), 1);
    }

    #[tokio::test]
    async fn test_admin_grant_restores_access() {
        let (app, store) = test_app();
        let user_id = Uuid::new_v4();
        subscribe(&app, user_id, "free").await;

        let (status, _) = send(
            &app,
            "POST",
            &format!("/api/v1/users/{user_id}/credits/careerCounselling/debit"),
            None,
            false,
        )
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/v1/admin/users/{user_id}/credits/careerCounselling/grant"),
            Some(json!({ "amount": 2 })),
            true,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], 2);

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/v1/users/{user_id}/credits/careerCounselling/debit"),
            None,
            false,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["remaining"], 1);
        assert_eq!(store.get(user_id).unwrap().balance(Feature::CareerCounselling), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_grant_ttl_is_rejected_and_store_keeps_serving() {
        let (app, store) = test_app();
        let user_id = Uuid::new_v4();
        subscribe(&app, user_id, "basic").await;

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/v1/admin/users/{user_id}/credits/cvScan/grant"),
            Some(json!({ "amount": 1, "ttl_days": 1_000_000_000i64 })),
            true,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(store.get(user_id).unwrap().balance(Feature::CvScan), 10);

        let (status, _) = send(
            &app,
            "GET",
            &format!("/api/v1/users/{user_id}/credits"),
            None,
            false,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        subscribe(&app, Uuid::new_v4(), "free").await;
    }

    #[tokio::test]
    async fn test_grant_rejects_zero_amount() {
        let (app, _) = test_app();
        let user_id = Uuid::new_v4();
        subscribe(&app, user_id, "basic").await;

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/v1/admin/users/{user_id}/credits/cvScan/grant"),
            Some(json!({ "amount": 0 })),
            true,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }
}
