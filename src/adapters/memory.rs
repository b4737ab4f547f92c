//! In-memory collaborator implementations
//!
//! Used by tests and by single-process deployments that keep the source
//! of truth in local state.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::adapters::traits::{Catalog, JobQueue, LedgerStore};
use crate::models::{CustomerAggregate, Feature, FeatureId, GrantUpdate, SyncBatch};

/// Ledger backed by a process-local map.
#[derive(Default)]
pub struct MemoryLedger {
    aggregates: Mutex<HashMap<String, CustomerAggregate>>,
    commit_count: Mutex<u64>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, aggregate: CustomerAggregate) {
        self.aggregates
            .lock()
            .unwrap()
            .insert(aggregate.customer_id.clone(), aggregate);
    }

    pub fn commit_count(&self) -> u64 {
        *self.commit_count.lock().unwrap()
    }

    pub fn get(&self, customer_id: &str) -> Option<CustomerAggregate> {
        self.aggregates.lock().unwrap().get(customer_id).cloned()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn load_aggregate(&self, customer_id: &str) -> Result<Option<CustomerAggregate>> {
        Ok(self.aggregates.lock().unwrap().get(customer_id).cloned())
    }

    async fn commit_updates(&self, updates: &[GrantUpdate]) -> Result<()> {
        let mut aggregates = self.aggregates.lock().unwrap();
        // Transactional per call: validate the whole batch before applying
        // anything.
        for update in updates {
            if !aggregates.contains_key(&update.customer_id) {
                anyhow::bail!("unknown customer: {}", update.customer_id);
            }
        }
        for update in updates {
            if let Some(aggregate) = aggregates.get_mut(&update.customer_id) {
                let next = aggregate.applying(std::slice::from_ref(update));
                *aggregate = next;
            }
        }
        *self.commit_count.lock().unwrap() += 1;
        Ok(())
    }
}

/// Catalog backed by a static feature list.
#[derive(Default)]
pub struct MemoryCatalog {
    features: Mutex<Vec<Feature>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_features(features: Vec<Feature>) -> Self {
        Self { features: Mutex::new(features) }
    }

    pub fn add(&self, feature: Feature) {
        self.features.lock().unwrap().push(feature);
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn resolve_feature(&self, id_or_event: &str) -> Result<Option<Feature>> {
        let features = self.features.lock().unwrap();
        let by_id = features.iter().find(|f| f.id == id_or_event);
        let resolved = by_id.or_else(|| features.iter().find(|f| f.matches_event(id_or_event)));
        Ok(resolved.cloned())
    }

    async fn credit_systems_for(&self, feature_id: &FeatureId) -> Result<Vec<Feature>> {
        let features = self.features.lock().unwrap();
        Ok(features.iter().filter(|f| f.covers(feature_id)).cloned().collect())
    }
}

/// Queue that hands batches to an in-process consumer (the sync worker in
/// production wiring, assertions in tests).
#[derive(Default)]
pub struct MemoryJobQueue {
    batches: Mutex<VecDeque<SyncBatch>>,
    submitted: Mutex<u64>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_pop(&self) -> Option<SyncBatch> {
        self.batches.lock().unwrap().pop_front()
    }

    pub fn pending(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub fn submitted_count(&self) -> u64 {
        *self.submitted.lock().unwrap()
    }

    /// Re-enqueue a batch whose commit failed; the queue owns retry.
    pub fn requeue(&self, batch: SyncBatch) {
        self.batches.lock().unwrap().push_back(batch);
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn submit(&self, batch: SyncBatch) -> Result<()> {
        log::debug!("queue: submitted batch {} ({} pairs)", batch.batch_id, batch.pairs.len());
        self.batches.lock().unwrap().push_back(batch);
        *self.submitted.lock().unwrap() += 1;
        Ok(())
    }
}
