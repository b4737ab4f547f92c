//! Request/response types for the usage engine boundary
//!
//! These are the operation signatures consumed by the surrounding billing
//! API; no byte-level wire format is implied.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::feature::{Feature, FeatureId};
use crate::models::grant::{CustomerId, EntityId, GrantId, OrgId};

/// What to do when a deduction exceeds the available strict balance.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OverageBehaviour {
    /// Absorb the remainder (default): the balance floors at the true
    /// deficit instead of the call failing.
    #[default]
    Cap,
    /// Abort with InsufficientBalance; no grant is mutated.
    Reject,
}

/// Either a delta to deduct or an absolute usage target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageValue {
    /// Deduct this amount from the customer's balance.
    Amount(Decimal),
    /// Set total recorded usage to this value; supports corrections that
    /// decrease previously-reported usage.
    SetUsage(Decimal),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackUsageRequest {
    pub customer_id: CustomerId,
    pub entity_id: Option<EntityId>,
    /// Feature id or usage-event name.
    pub feature: String,
    pub value: UsageValue,
    #[serde(default)]
    pub overage_behaviour: OverageBehaviour,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityUsage {
    pub entity_id: EntityId,
    pub balance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageResponse {
    pub feature_id: FeatureId,
    /// Total included usage across the relevant grants.
    pub granted: Decimal,
    /// Remaining balance after the operation; negative when overage was
    /// absorbed.
    pub current: Decimal,
    /// granted - current.
    pub usage: Decimal,
    pub unlimited: bool,
    pub entity_breakdown: Option<Vec<EntityUsage>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceCheck {
    pub allowed: bool,
    pub balance: Decimal,
    pub required: Decimal,
}

/// One planned per-feature deduction. `per_unit` converts primary-feature
/// units into this feature's units (1 for the primary feature itself, the
/// credit multiplier for a credit system).
#[derive(Debug, Clone)]
pub struct Deduction {
    pub feature: Feature,
    pub amount: Decimal,
    pub per_unit: Decimal,
}

/// A dirty (customer, grants) pair awaiting sync to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirtyPair {
    pub customer_id: CustomerId,
    pub org_id: OrgId,
    pub env: String,
    pub grant_ids: Vec<GrantId>,
}

impl DirtyPair {
    /// Dedup key: one pending record per customer per environment.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.org_id, self.env, self.customer_id)
    }
}

/// One flushed batch handed to the external job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncBatch {
    pub batch_id: Uuid,
    pub pairs: Vec<DirtyPair>,
}
