// Error types for the usage-entitlement engine
use std::fmt;

use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub enum EngineError {
    // Request errors
    FeatureNotFound(String),
    InvalidAmount(String),
    InvalidPrecision { value: String, expected: u32 },

    // Balance errors
    InsufficientBalance { available: Decimal, required: Decimal, feature: String },

    // Cache concurrency errors
    StaleWrite(String),
    GuardActive(String),

    // Durable store errors
    LedgerUnavailable(String),
    SyncFailure(String),

    // Unknown
    Unknown(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FeatureNotFound(feature) => {
                write!(f, "No grant matches feature: {}", feature)
            }
            Self::InvalidAmount(msg) => write!(f, "Invalid amount: {}", msg),
            Self::InvalidPrecision { value, expected } => {
                write!(f, "Amount {} exceeds max precision {}", value, expected)
            }
            Self::InsufficientBalance { available, required, feature } => {
                write!(
                    f,
                    "Insufficient balance for {}: have {}, need {}",
                    feature, available, required
                )
            }
            Self::StaleWrite(customer) => {
                write!(f, "Stale write rejected for customer {}", customer)
            }
            Self::GuardActive(customer) => {
                write!(f, "Cache entry for customer {} is delete-guarded", customer)
            }
            Self::LedgerUnavailable(msg) => write!(f, "Ledger unavailable: {}", msg),
            Self::SyncFailure(msg) => write!(f, "Sync batch failed: {}", msg),
            Self::Unknown(msg) => write!(f, "Unknown error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Unknown(err.to_string())
    }
}

// Error code mapping for API responses
impl EngineError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::FeatureNotFound(_) => "FEATURE_NOT_FOUND",
            Self::InvalidAmount(_) => "INVALID_AMOUNT",
            Self::InvalidPrecision { .. } => "INVALID_PRECISION",
            Self::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Self::StaleWrite(_) => "STALE_WRITE",
            Self::GuardActive(_) => "GUARD_ACTIVE",
            Self::LedgerUnavailable(_) => "LEDGER_UNAVAILABLE",
            Self::SyncFailure(_) => "SYNC_FAILURE",
            Self::Unknown(_) => "UNKNOWN_ERROR",
        }
    }

    /// Retryable errors resolve on reload or by falling back to the
    /// ledger-direct path; they are never surfaced as-is to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StaleWrite(_)
                | Self::GuardActive(_)
                | Self::LedgerUnavailable(_)
                | Self::SyncFailure(_)
        )
    }

    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::FeatureNotFound(_)
                | Self::InvalidAmount(_)
                | Self::InvalidPrecision { .. }
                | Self::InsufficientBalance { .. }
        )
    }
}
