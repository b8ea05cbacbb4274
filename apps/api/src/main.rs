mod config;
mod credits;
mod db;
mod errors;
mod models;
mod routes;
mod scan;
mod state;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, StoreBackend};
use crate::credits::scheduler;
use crate::credits::store::memory::MemoryStore;
use crate::credits::store::{CreditStore, PgCreditStore};
use crate::db::create_pool;
use crate::routes::build_router;
use crate::scan::scorer::KeywordResumeScorer;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting CareerHub API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize the credit store (PostgreSQL runs migrations on connect)
    let store: Arc<dyn CreditStore> = match &config.store_backend {
        StoreBackend::Postgres { database_url } => {
            Arc::new(PgCreditStore::new(create_pool(database_url).await?))
        }
        StoreBackend::Memory => {
            warn!("CREDIT_STORE=memory: credits are kept in-process and lost on restart");
            Arc::new(MemoryStore::default())
        }
    };

    // Background bulk reconciliation
    match config.reconcile_interval() {
        Some(every) => {
            scheduler::spawn(store.clone(), every);
            info!("Scheduled credit reconciliation every {}s", every.as_secs());
        }
        None => info!("Scheduled credit reconciliation disabled"),
    }

    let state = AppState {
        store,
        scorer: Arc::new(KeywordResumeScorer),
        config: config.clone(),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict origins once the web client's domain is fixed

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
