use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
    /// Soft flush window for the sync batcher (ms).
    pub flush_interval_ms: u64,
    /// Hard cap on pending sync pairs.
    pub flush_max_pending: usize,
    /// Delete-guard lifetime (ms).
    pub guard_ttl_ms: u64,
    /// Sync worker poll interval (ms).
    pub sync_poll_interval_ms: u64,
    /// Deduction ordering: exhaust reset-bound balances before perpetual
    /// ones. Orgs wanting the opposite set this to false.
    pub reset_bound_first: bool,
}

pub fn load_config() -> Result<AppConfig, ConfigError> {
    let s = Config::builder()
        // Set defaults
        .set_default("log_level", "info")?
        .set_default("log_to_file", false)?
        .set_default("log_file", "log/usage_ledger.log")?
        .set_default("flush_interval_ms", 100)?
        .set_default("flush_max_pending", 10_000_i64)?
        .set_default("guard_ttl_ms", 2_000)?
        .set_default("sync_poll_interval_ms", 1_000)?
        .set_default("reset_bound_first", true)?
        // Add configuration from a file
        .add_source(File::with_name("config/usage_ledger").required(false))
        // Add configuration from environment variables
        .add_source(config::Environment::with_prefix("USAGE_LEDGER"))
        .build()?;

    s.try_deserialize()
}
