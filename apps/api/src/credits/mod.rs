// Entitlement ledger: per-feature credit buckets attached to a user's subscription.
// `ledger` holds the pure grant/debit/reconcile rules; everything that touches
// Postgres goes through `store::CreditStore`.

pub mod guard;
pub mod handlers;
pub mod ledger;
pub mod models;
pub mod plans;
pub mod reconciliation;
pub mod scheduler;
pub mod store;
