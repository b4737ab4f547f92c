//! Sync batcher
//!
//! Accumulates dirty (customer, grants) pairs produced by deductions and
//! flushes them, deduplicated, as one batch to the external job queue.
//! A flush fires when the soft timer window elapses or the pending count
//! reaches the hard cap, whichever comes first.
//!
//! The batcher is an explicit, constructor-injected service with a
//! start/stop lifecycle; tests instantiate independent instances. The only
//! mutating operation performed while holding the internal lock is the
//! swap-and-hand-off of the pending map, so the timer path and the
//! cap-trigger path can race without double-submitting or losing pairs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::adapters::traits::JobQueue;
use crate::models::{DirtyPair, GrantId, SyncBatch};

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Soft flush window (ms) started by the first enqueue after an empty
    /// period.
    pub flush_interval_ms: u64,
    /// Hard cap on pending pairs; reaching it flushes immediately.
    pub max_pending: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self { flush_interval_ms: 100, max_pending: 10_000 }
    }
}

pub struct SyncBatcher {
    queue: Arc<dyn JobQueue>,
    config: BatcherConfig,
    pending: Mutex<FxHashMap<String, DirtyPair>>,
    timer_scheduled: AtomicBool,
    running: AtomicBool,
}

impl SyncBatcher {
    pub fn new(queue: Arc<dyn JobQueue>, config: BatcherConfig) -> Arc<Self> {
        Arc::new(Self {
            queue,
            config,
            pending: Mutex::new(FxHashMap::default()),
            timer_scheduled: AtomicBool::new(false),
            running: AtomicBool::new(false),
        })
    }

    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        log::info!(
            "sync batcher started (window={}ms, cap={})",
            self.config.flush_interval_ms,
            self.config.max_pending
        );
        // Anything enqueued while stopped goes out now.
        if self.pending_count() > 0 {
            let batcher = self.clone();
            tokio::spawn(async move { batcher.flush().await });
        }
    }

    /// Graceful shutdown: stop scheduling timers and flush what is left so
    /// no pending pair is lost.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.flush().await;
        log::info!("sync batcher stopped");
    }

    /// Record a dirty pair. Idempotent before the next flush: re-enqueuing
    /// the same customer merges grant ids into the one pending record.
    pub fn enqueue(
        self: &Arc<Self>,
        customer_id: &str,
        org_id: &str,
        env: &str,
        grant_ids: Vec<GrantId>,
    ) {
        let pair = DirtyPair {
            customer_id: customer_id.to_string(),
            org_id: org_id.to_string(),
            env: env.to_string(),
            grant_ids,
        };
        let key = pair.key();

        let (was_empty, over_cap) = {
            let mut pending = self.pending.lock().unwrap();
            let was_empty = pending.is_empty();
            match pending.get_mut(&key) {
                Some(existing) => {
                    for grant_id in pair.grant_ids {
                        if !existing.grant_ids.contains(&grant_id) {
                            existing.grant_ids.push(grant_id);
                        }
                    }
                }
                None => {
                    pending.insert(key, pair);
                }
            }
            (was_empty, pending.len() >= self.config.max_pending)
        };

        if over_cap {
            let batcher = self.clone();
            tokio::spawn(async move { batcher.flush().await });
        } else if was_empty && self.running.load(Ordering::SeqCst) {
            self.schedule_timer();
        }
    }

    fn schedule_timer(self: &Arc<Self>) {
        if self
            .timer_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let batcher = self.clone();
        let window = Duration::from_millis(self.config.flush_interval_ms);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // Clear before taking the map: an enqueue landing after the
            // swap sees an empty map and schedules the next window.
            batcher.timer_scheduled.store(false, Ordering::SeqCst);
            batcher.flush().await;
        });
    }

    /// Swap the pending map for a fresh one and hand the snapshot to the
    /// queue as one batch. Safe to invoke concurrently from the timer, the
    /// cap trigger, and shutdown.
    pub async fn flush(&self) {
        let pairs: Vec<DirtyPair> = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return;
            }
            std::mem::take(&mut *pending).into_values().collect()
        };

        let batch = SyncBatch { batch_id: Uuid::new_v4(), pairs };
        let count = batch.pairs.len();
        if let Err(e) = self.queue.submit(batch).await {
            // Isolated from the request path; the queue owns retry.
            log::error!("sync batch submit failed ({} pairs): {:#}", count, e);
        } else {
            log::debug!("flushed sync batch ({} pairs)", count);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
