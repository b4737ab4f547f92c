//! Balance store
//!
//! Cache-aside holder of the full customer aggregate. Reads hit the cache
//! and fall back to the ledger; writes go through one atomic
//! compare-and-apply. Interval resets are applied lazily on load.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::adapters::traits::LedgerStore;
use crate::balance_cache::guard::group_by_org;
use crate::models::{CustomerAggregate, CustomerId, EngineError, GrantUpdate, OrgId};

/// Atomic multi-field cache mutation, realizable via a scripting engine, a
/// database transaction, or an in-process per-customer mutex table.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn get(&self, customer_id: &str) -> Result<Option<CustomerAggregate>>;

    /// Write-through; must not resurrect a delete-guarded entry.
    async fn put(&self, aggregate: CustomerAggregate) -> Result<()>;

    /// Apply the batch atomically iff every update's preconditions hold
    /// against the cached entry. All-or-nothing.
    async fn compare_and_apply(
        &self,
        customer_id: &str,
        updates: &[GrantUpdate],
    ) -> Result<(), EngineError>;

    /// Set a short-lived guard, then remove the entry.
    async fn remove_guarded(&self, customer_id: &str, guard_ttl: Duration) -> Result<()>;

    async fn guard_active(&self, customer_id: &str) -> bool;
}

pub struct BalanceStore {
    cache: Arc<dyn TransactionalStore>,
    ledger: Arc<dyn LedgerStore>,
    guard_ttl: Duration,
}

impl BalanceStore {
    pub fn new(
        cache: Arc<dyn TransactionalStore>,
        ledger: Arc<dyn LedgerStore>,
        guard_ttl: Duration,
    ) -> Self {
        Self { cache, ledger, guard_ttl }
    }

    /// Cache-aside load. On hit, due lazy resets are applied and written
    /// back; on miss, the aggregate comes from the ledger and is written
    /// through.
    pub async fn load(&self, customer_id: &str) -> Result<Option<CustomerAggregate>, EngineError> {
        if let Some(aggregate) = self.cache.get(customer_id).await? {
            let (aggregate, changed) = aggregate.apply_due_resets(Utc::now());
            if changed {
                log::info!("lazy reset applied for cached customer {}", customer_id);
                self.cache.put(aggregate.clone()).await?;
            }
            return Ok(Some(aggregate));
        }

        let Some(aggregate) = self.ledger.load_aggregate(customer_id).await? else {
            return Ok(None);
        };
        let (aggregate, changed) = aggregate.apply_due_resets(Utc::now());
        if changed {
            log::info!("lazy reset applied for customer {} on ledger load", customer_id);
        }
        self.cache.put(aggregate.clone()).await?;
        Ok(Some(aggregate))
    }

    /// One indivisible compare-and-apply against the cache.
    pub async fn atomic_apply(
        &self,
        customer_id: &str,
        updates: &[GrantUpdate],
    ) -> Result<(), EngineError> {
        if updates.is_empty() {
            return Ok(());
        }
        self.cache.compare_and_apply(customer_id, updates).await
    }

    /// Invalidate one customer with a resurrection guard.
    pub async fn invalidate(&self, customer_id: &str) -> Result<(), EngineError> {
        log::info!("invalidating cache for customer {}", customer_id);
        self.cache.remove_guarded(customer_id, self.guard_ttl).await?;
        Ok(())
    }

    /// Invalidate many customers, grouped per org so each group's keys
    /// land in one partition and the delete stays atomic per partition.
    pub async fn invalidate_batch(
        &self,
        pairs: &[(OrgId, CustomerId)],
    ) -> Result<(), EngineError> {
        for (org_id, customers) in group_by_org(pairs) {
            log::info!("invalidating {} customers for org {}", customers.len(), org_id);
            for customer_id in customers {
                self.cache.remove_guarded(&customer_id, self.guard_ttl).await?;
            }
        }
        Ok(())
    }

    pub async fn guard_active(&self, customer_id: &str) -> bool {
        self.cache.guard_active(customer_id).await
    }
}
