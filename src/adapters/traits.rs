//! Collaborator interfaces
//!
//! The engine's external collaborators: the durable ledger (source of
//! truth for grants), the feature catalog, and the job queue consuming
//! sync batches. Each is injected as `Arc<dyn Trait>`.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{CustomerAggregate, Feature, FeatureId, GrantUpdate, SyncBatch};

/// Durable relational store of grants - the source of truth. Read on cache
/// miss, written by batched sync and by the degraded ledger-direct path.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load_aggregate(&self, customer_id: &str) -> Result<Option<CustomerAggregate>>;

    /// Apply a batch of updates transactionally. MUST be idempotent:
    /// updates carry absolute target values, and the queue delivers
    /// at-least-once, so the same update can arrive more than once.
    async fn commit_updates(&self, updates: &[GrantUpdate]) -> Result<()>;
}

/// Read-only product catalog, including credit-system conversion tables.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Resolve by feature id or usage-event name.
    async fn resolve_feature(&self, id_or_event: &str) -> Result<Option<Feature>>;

    /// Credit-system features whose schema covers `feature_id`.
    async fn credit_systems_for(&self, feature_id: &FeatureId) -> Result<Vec<Feature>>;
}

/// External job system consuming flushed sync batches. Delivery is
/// at-least-once; retry/backoff of failed batches is the queue's concern.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn submit(&self, batch: SyncBatch) -> Result<()>;
}
