//! Sync worker
//!
//! Consumes flushed batches and applies the cached grant state to the
//! durable ledger. A failed commit is logged and the batch goes back to
//! the queue for its own retry; the original request path never waits on
//! or hears about any of this.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;

use crate::adapters::memory::MemoryJobQueue;
use crate::adapters::traits::LedgerStore;
use crate::balance_cache::store::TransactionalStore;
use crate::models::{GrantUpdate, SyncBatch};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Poll interval between queue scans (ms).
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 1000 }
    }
}

pub struct SyncWorker {
    queue: Arc<MemoryJobQueue>,
    cache: Arc<dyn TransactionalStore>,
    ledger: Arc<dyn LedgerStore>,
    config: WorkerConfig,
    shutdown: AtomicBool,
}

impl SyncWorker {
    pub fn new(
        queue: Arc<MemoryJobQueue>,
        cache: Arc<dyn TransactionalStore>,
        ledger: Arc<dyn LedgerStore>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            cache,
            ledger,
            config,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Commit one batch: the cache holds the authoritative in-request
    /// result, so each dirty grant's current cached state is written to
    /// the ledger as absolute targets. Re-delivery is harmless.
    pub async fn apply_batch(&self, batch: &SyncBatch) -> Result<usize> {
        let mut committed = 0;
        for pair in &batch.pairs {
            let Some(aggregate) = self.cache.get(&pair.customer_id).await? else {
                // Entry invalidated since the flush; the ledger was the
                // writer in that case and there is nothing to sync.
                log::warn!(
                    "sync skipped for {}: cache entry gone",
                    pair.customer_id
                );
                continue;
            };
            let updates: Vec<GrantUpdate> = aggregate
                .grants
                .iter()
                .filter(|g| pair.grant_ids.contains(&g.id))
                .map(|g| GrantUpdate::from_grant(&pair.customer_id, g))
                .collect();
            if updates.is_empty() {
                continue;
            }
            self.ledger.commit_updates(&updates).await?;
            committed += updates.len();
        }
        Ok(committed)
    }

    /// Process everything currently queued. Failed batches are requeued
    /// and not retried within the same pass.
    pub async fn drain(&self) -> usize {
        let mut applied = 0;
        let rounds = self.queue.pending();
        for _ in 0..rounds {
            let Some(batch) = self.queue.try_pop() else { break };
            match self.apply_batch(&batch).await {
                Ok(count) => {
                    log::debug!(
                        "synced batch {} ({} grant updates)",
                        batch.batch_id,
                        count
                    );
                    applied += count;
                }
                Err(e) => {
                    log::error!(
                        "sync batch {} failed, requeued for retry: {:#}",
                        batch.batch_id,
                        e
                    );
                    self.queue.requeue(batch);
                }
            }
        }
        applied
    }

    pub async fn run(&self) {
        log::info!(
            "sync worker started (poll_interval={}ms)",
            self.config.poll_interval_ms
        );
        loop {
            self.drain().await;
            if self.shutdown.load(Ordering::SeqCst) {
                // Final drain already ran above.
                log::info!("sync worker stopped");
                return;
            }
            sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
