//! Cache layer: customer aggregates with atomic multi-field mutation and
//! delete guards.

pub mod guard;
pub mod memory;
pub mod store;

pub use guard::GuardTable;
pub use memory::MemoryStore;
pub use store::{BalanceStore, TransactionalStore};
