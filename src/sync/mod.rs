//! Asynchronous reconciliation of cache mutations back to the ledger.

pub mod batcher;
pub mod worker;

pub use batcher::{BatcherConfig, SyncBatcher};
pub use worker::{SyncWorker, WorkerConfig};
