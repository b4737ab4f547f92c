//! In-process transactional store
//!
//! Single-process realization of `TransactionalStore`: a per-customer
//! mutex table serializes compare-and-apply, standing in for the
//! server-side scripting a shared cache deployment would use.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::balance_cache::guard::GuardTable;
use crate::balance_cache::store::TransactionalStore;
use crate::models::{CustomerAggregate, CustomerId, EngineError, GrantUpdate};

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<FxHashMap<CustomerId, CustomerAggregate>>,
    locks: Mutex<FxHashMap<CustomerId, Arc<tokio::sync::Mutex<()>>>>,
    guards: GuardTable,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn customer_lock(&self, customer_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(customer_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    async fn get(&self, customer_id: &str) -> Result<Option<CustomerAggregate>> {
        Ok(self.entries.lock().unwrap().get(customer_id).cloned())
    }

    async fn put(&self, aggregate: CustomerAggregate) -> Result<()> {
        if self.guards.active(&aggregate.customer_id) {
            // A guarded entry must not be resurrected before the TTL runs
            // out; the caller still gets its uncached aggregate.
            log::debug!("put skipped for guarded customer {}", aggregate.customer_id);
            return Ok(());
        }
        self.entries
            .lock()
            .unwrap()
            .insert(aggregate.customer_id.clone(), aggregate);
        Ok(())
    }

    async fn compare_and_apply(
        &self,
        customer_id: &str,
        updates: &[GrantUpdate],
    ) -> Result<(), EngineError> {
        let lock = self.customer_lock(customer_id);
        let _serialized = lock.lock().await;

        if self.guards.active(customer_id) {
            return Err(EngineError::GuardActive(customer_id.to_string()));
        }

        let current = self
            .entries
            .lock()
            .unwrap()
            .get(customer_id)
            .cloned()
            .ok_or_else(|| EngineError::StaleWrite(customer_id.to_string()))?;

        // Validate every precondition before touching anything: the batch
        // applies in full or not at all.
        for update in updates {
            let grant = current
                .find_grant(&update.grant_id)
                .ok_or_else(|| EngineError::StaleWrite(customer_id.to_string()))?;
            if grant.next_reset_at != update.expected_next_reset_at {
                log::info!(
                    "stale write for {} grant {}: cached reset {:?}, expected {:?}",
                    customer_id,
                    update.grant_id,
                    grant.next_reset_at,
                    update.expected_next_reset_at
                );
                return Err(EngineError::StaleWrite(customer_id.to_string()));
            }
            if grant.balance != update.expected_balance
                || grant.additional_balance != update.expected_additional_balance
            {
                log::info!(
                    "stale write for {} grant {}: a racing mutation landed first",
                    customer_id,
                    update.grant_id
                );
                return Err(EngineError::StaleWrite(customer_id.to_string()));
            }
        }

        let next = current.applying(updates);
        self.entries
            .lock()
            .unwrap()
            .insert(customer_id.to_string(), next);
        Ok(())
    }

    async fn remove_guarded(&self, customer_id: &str, guard_ttl: Duration) -> Result<()> {
        // Guard first, then remove: an apply racing the delete sees the
        // guard no matter which side of the removal it lands on.
        self.guards.set(customer_id, guard_ttl);
        self.entries.lock().unwrap().remove(customer_id);
        Ok(())
    }

    async fn guard_active(&self, customer_id: &str) -> bool {
        self.guards.active(customer_id)
    }
}
