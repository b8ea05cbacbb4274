//! Process-local `CreditStore`. Backs `CREDIT_STORE=memory` and the test suite.
//!
//! A single mutex around the records gives the same guarantees the Postgres
//! store gets from conditional updates: debits never go negative and stale
//! whole-record writes are rejected by revision.

use std::collections::BTreeMap;
#[cfg(test)]
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::credits::ledger;
use crate::credits::models::{CreditBucket, Feature, Subscription};
use crate::credits::store::{CreditStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<Uuid, Subscription>>,
    #[cfg(test)]
    faults: Mutex<Faults>,
}

/// Injected failures and a log of reconciliation writes.
#[cfg(test)]
#[derive(Default)]
struct Faults {
    failing_writes: HashSet<Uuid>,
    pending_conflicts: HashMap<Uuid, u32>,
    reconcile_writes: Vec<Uuid>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Corrupt("memory store lock poisoned".to_string()))
}

#[async_trait]
impl CreditStore for MemoryStore {
    async fn load(&self, user_id: Uuid) -> Result<Option<Subscription>, StoreError> {
        Ok(lock(&self.records)?.get(&user_id).cloned())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        Ok(lock(&self.records)?.values().cloned().collect())
    }

    async fn save_reconciled(
        &self,
        subscription: &Subscription,
        zeroed: &[Feature],
    ) -> Result<(), StoreError> {
        let user_id = subscription.user_id;
        let mut records = lock(&self.records)?;
        let stored = records
            .get_mut(&user_id)
            .ok_or(StoreError::NotFound(user_id))?;

        #[cfg(test)]
        self.inject_reconcile_fault(stored)?;

        if stored.revision != subscription.revision {
            return Err(StoreError::Conflict(user_id));
        }

        for feature in zeroed {
            if let Some(bucket) = stored.credit_buckets.get_mut(feature) {
                bucket.balance = 0;
            }
        }
        stored.revision += 1;
        Ok(())
    }

    async fn try_debit(&self, user_id: Uuid, feature: Feature) -> Result<Option<u32>, StoreError> {
        let mut records = lock(&self.records)?;
        Ok(records
            .get_mut(&user_id)
            .and_then(|sub| ledger::debit(sub, feature).ok()))
    }

    async fn grant(
        &self,
        user_id: Uuid,
        feature: Feature,
        amount: u32,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<CreditBucket, StoreError> {
        let mut records = lock(&self.records)?;
        let stored = records
            .get_mut(&user_id)
            .ok_or(StoreError::NotFound(user_id))?;
        let bucket = ledger::grant(stored, feature, amount, ttl, now)?;
        stored.revision += 1;
        Ok(bucket)
    }

    async fn save_plan(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let mut records = lock(&self.records)?;
        let revision = match records.get(&subscription.user_id) {
            Some(existing) if existing.revision != subscription.revision => {
                return Err(StoreError::Conflict(subscription.user_id));
            }
            Some(existing) => existing.revision + 1,
            None => subscription.revision,
        };
        let mut saved = subscription.clone();
        saved.revision = revision;
        records.insert(saved.user_id, saved);
        Ok(())
    }
}

#[cfg(test)]
impl MemoryStore {
    pub fn with(subscriptions: impl IntoIterator<Item = Subscription>) -> Self {
        let store = Self::default();
        {
            let mut records = store.records.lock().unwrap();
            for sub in subscriptions {
                records.insert(sub.user_id, sub);
            }
        }
        store
    }

    pub fn get(&self, user_id: Uuid) -> Option<Subscription> {
        self.records.lock().unwrap().get(&user_id).cloned()
    }

    /// Every reconciliation write for `user_id` fails with a database error.
    pub fn fail_writes_for(&self, user_id: Uuid) {
        self.faults.lock().unwrap().failing_writes.insert(user_id);
    }

    /// The next `times` reconciliation writes lose a race with another writer.
    pub fn conflict_next_saves(&self, user_id: Uuid, times: u32) {
        self.faults.lock().unwrap().pending_conflicts.insert(user_id, times);
    }

    /// User ids whose reconciliation writes were attempted, in order.
    pub fn reconcile_writes(&self) -> Vec<Uuid> {
        self.faults.lock().unwrap().reconcile_writes.clone()
    }

    fn inject_reconcile_fault(&self, stored: &mut Subscription) -> Result<(), StoreError> {
        let mut faults = lock(&self.faults)?;
        let user_id = stored.user_id;
        faults.reconcile_writes.push(user_id);

        if faults.failing_writes.contains(&user_id) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        if let Some(remaining) = faults.pending_conflicts.get_mut(&user_id) {
            if *remaining > 0 {
                // Simulated concurrent writer.
                *remaining -= 1;
                stored.revision += 1;
                return Err(StoreError::Conflict(user_id));
            }
        }
        Ok(())
    }
}
