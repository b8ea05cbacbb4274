use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Duration;

use crate::credits::plans::PlanSettings;

/// Upper bound for every configured length in days.
const MAX_DAYS: i64 = 3650;

/// Where subscriptions and credit buckets live. Selected by `CREDIT_STORE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres { database_url: String },
    /// Process-local and lost on restart; for local development only.
    Memory,
}

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_backend: StoreBackend,
    /// Shared secret expected in the `x-admin-key` header on admin routes.
    pub admin_api_key: String,
    pub port: u16,
    pub rust_log: String,
    /// 0 disables the background reconciliation job.
    pub reconcile_interval_secs: u64,
    pub credit_ttl_days: i64,
    pub trial_days: i64,
    pub billing_period_days: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            store_backend: store_backend_from_env()?,
            admin_api_key: require_env("ADMIN_API_KEY")?,
            port: env_or("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            reconcile_interval_secs: env_or("RECONCILE_INTERVAL_SECS", 3600)?,
            credit_ttl_days: env_days("CREDIT_TTL_DAYS", 30)?,
            trial_days: env_days("TRIAL_DAYS", 7)?,
            billing_period_days: env_days("BILLING_PERIOD_DAYS", 30)?,
        })
    }

    pub fn plan_settings(&self) -> PlanSettings {
        PlanSettings {
            credit_ttl: Duration::days(self.credit_ttl_days),
            trial_length: Duration::days(self.trial_days),
            billing_period: Duration::days(self.billing_period_days),
        }
    }

    pub fn reconcile_interval(&self) -> Option<std::time::Duration> {
        (self.reconcile_interval_secs > 0)
            .then(|| std::time::Duration::from_secs(self.reconcile_interval_secs))
    }
}

fn store_backend_from_env() -> Result<StoreBackend> {
    match std::env::var("CREDIT_STORE").as_deref() {
        Err(_) | Ok("postgres") => Ok(StoreBackend::Postgres {
            database_url: require_env("DATABASE_URL")?,
        }),
        Ok("memory") => Ok(StoreBackend::Memory),
        Ok(other) => anyhow::bail!("CREDIT_STORE must be 'postgres' or 'memory', got '{other}'"),
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn env_days(key: &str, default: i64) -> Result<i64> {
    check_days(key, env_or(key, default)?)
}

fn check_days(key: &str, days: i64) -> Result<i64> {
    if !(1..=MAX_DAYS).contains(&days) {
        anyhow::bail!("{key} must be between 1 and {MAX_DAYS} days, got {days}");
    }
    Ok(days)
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{key} must be a valid number, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Self {
        Config {
            store_backend: StoreBackend::Memory,
            admin_api_key: "test-admin-key".to_string(),
            port: 0,
            rust_log: "debug".to_string(),
            reconcile_interval_secs: 0,
            credit_ttl_days: 30,
            trial_days: 7,
            billing_period_days: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_settings_follow_config() {
        let mut config = Config::for_tests();
        config.credit_ttl_days = 14;
        let settings = config.plan_settings();
        assert_eq!(settings.credit_ttl, Duration::days(14));
        assert_eq!(settings.trial_length, Duration::days(7));
    }

    #[test]
    fn test_zero_interval_disables_scheduler() {
        let mut config = Config::for_tests();
        assert!(config.reconcile_interval().is_none());
        config.reconcile_interval_secs = 60;
        assert_eq!(
            config.reconcile_interval(),
            Some(std::time::Duration::from_secs(60))
        );
    }

    #[test]
    fn test_day_lengths_are_bounded() {
        assert_eq!(check_days("TRIAL_DAYS", 7).unwrap(), 7);
        assert_eq!(check_days("TRIAL_DAYS", MAX_DAYS).unwrap(), MAX_DAYS);
        for days in [0, -1, MAX_DAYS + 1, 1_000_000_000] {
            let err = check_days("CREDIT_TTL_DAYS", days).unwrap_err();
            assert!(err.to_string().contains("CREDIT_TTL_DAYS"));
        }
    }

    #[test]
    fn test_env_or_falls_back_when_unset() {
        let value: u64 = env_or("CAREERHUB_TEST_SURELY_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }
}
