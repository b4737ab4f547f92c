//! Grant and customer aggregate types
//!
//! A grant is one balance-bearing allocation of a feature to a customer,
//! originating from one attached product. The customer aggregate is the
//! cached unit: the customer plus every grant across its active products.
//!
//! Aggregates are immutable values: every mutation produces a new value
//! from the old one plus a `GrantUpdate`, and references are swapped
//! atomically at the cache layer. No shared grant object is ever mutated
//! in place.

use chrono::{DateTime, Duration, Months, Utc};
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::models::feature::{FeatureId, FeatureKind};

pub type CustomerId = String;
pub type GrantId = String;
pub type EntityId = String;
pub type OrgId = String;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResetInterval {
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl ResetInterval {
    /// Approximate seconds, used only to order intervals by magnitude.
    pub fn magnitude_secs(&self) -> i64 {
        match self {
            Self::Hour => 3_600,
            Self::Day => 86_400,
            Self::Week => 7 * 86_400,
            Self::Month => 30 * 86_400,
            Self::Quarter => 91 * 86_400,
            Self::Year => 365 * 86_400,
        }
    }

    /// Advance `from` by `count` intervals. Month-based intervals use
    /// calendar arithmetic, not a fixed duration.
    pub fn advance(&self, from: DateTime<Utc>, count: u32) -> DateTime<Utc> {
        match self {
            Self::Hour => from + Duration::hours(count as i64),
            Self::Day => from + Duration::days(count as i64),
            Self::Week => from + Duration::weeks(count as i64),
            Self::Month => from + Months::new(count),
            Self::Quarter => from + Months::new(3 * count),
            Self::Year => from + Months::new(12 * count),
        }
    }
}

/// Unused balance carried from a prior interval, with its expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloverEntry {
    pub amount: Decimal,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloverPolicy {
    /// Max amount carried per reset; None = carry all unused.
    pub cap: Option<Decimal>,
    /// Carried balance expires after this many reset intervals.
    pub expiry_interval_count: u32,
}

/// Per-entity sub-balance of an entity-scoped grant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityBalance {
    pub balance: Decimal,
    pub additional_balance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub id: GrantId,
    pub feature_id: FeatureId,
    /// Feature kind at attach time; drives deduction precedence.
    pub kind: FeatureKind,
    pub product_id: String,
    pub is_add_on: bool,
    /// Included units per reset period.
    pub allowance: Decimal,
    /// Currently usable amount.
    pub balance: Decimal,
    /// Overage already absorbed; zero or negative.
    pub additional_balance: Decimal,
    /// Administrative top-up on top of the allowance.
    pub additional_granted_balance: Decimal,
    /// Signed correction applied by administrative balance-set operations.
    pub adjustment: Decimal,
    pub rollover_policy: Option<RolloverPolicy>,
    #[serde(default)]
    pub rollovers: Vec<RolloverEntry>,
    /// None = perpetual, never resets.
    pub next_reset_at: Option<DateTime<Utc>>,
    pub interval: ResetInterval,
    pub interval_count: u32,
    pub unlimited: bool,
    /// Whether overage beyond the grant's allowance is permitted.
    pub usage_allowed: bool,
    /// Per-entity sub-balances; present only for entity-scoped grants.
    pub entities: Option<FxHashMap<EntityId, EntityBalance>>,
    pub created_at: DateTime<Utc>,
}

impl Grant {
    pub fn is_entity_scoped(&self) -> bool {
        self.entities.is_some()
    }

    /// Usable balance seen by the request: the entity sub-balance when an
    /// entity is addressed, otherwise the customer-level balance (which,
    /// for entity-scoped grants, is the sum of all entity sub-balances).
    pub fn balance_for(&self, entity_id: Option<&str>) -> Decimal {
        match (&self.entities, entity_id) {
            (Some(entities), Some(id)) => {
                entities.get(id).map(|e| e.balance).unwrap_or(Decimal::ZERO)
            }
            _ => self.balance,
        }
    }

    pub fn additional_balance_for(&self, entity_id: Option<&str>) -> Decimal {
        match (&self.entities, entity_id) {
            (Some(entities), Some(id)) => entities
                .get(id)
                .map(|e| e.additional_balance)
                .unwrap_or(Decimal::ZERO),
            _ => self.additional_balance,
        }
    }

    pub fn live_rollover(&self, now: DateTime<Utc>) -> Decimal {
        self.rollovers
            .iter()
            .filter(|r| r.expires_at > now)
            .map(|r| r.amount)
            .sum()
    }

    /// Included usage: allowance + live rollover + administrative top-up.
    /// Entity-scoped grants include per entity.
    pub fn included_usage(&self, now: DateTime<Utc>) -> Decimal {
        self.allowance + self.live_rollover(now) + self.additional_granted_balance
    }

    pub fn reset_due(&self, now: DateTime<Utc>) -> bool {
        self.next_reset_at.is_some_and(|at| at <= now)
    }

    /// Apply every due interval reset, returning the post-reset grant.
    /// Called lazily on cache load rather than by a scheduler, so a grant
    /// untouched for several periods catches up in one pass.
    pub fn apply_due_resets(&self, now: DateTime<Utc>) -> Grant {
        let mut grant = self.clone();
        while let Some(reset_at) = grant.next_reset_at {
            if reset_at > now {
                break;
            }
            grant = grant.reset_once(reset_at);
            // A zero-length cadence cannot advance; bail instead of spinning.
            if grant.next_reset_at == Some(reset_at) {
                log::warn!("grant {} has a zero-length reset cadence", grant.id);
                break;
            }
        }
        grant
    }

    fn reset_once(&self, reset_at: DateTime<Utc>) -> Grant {
        let mut grant = self.clone();

        // Drop carried balance that died during the period.
        grant.rollovers.retain(|r| r.expires_at > reset_at);

        if let Some(policy) = &grant.rollover_policy {
            let unused = grant.balance.max(Decimal::ZERO);
            let carry = match policy.cap {
                Some(cap) => unused.min(cap),
                None => unused,
            };
            if carry > Decimal::ZERO {
                let expires_at = grant
                    .interval
                    .advance(reset_at, grant.interval_count * policy.expiry_interval_count);
                grant.rollovers.push(RolloverEntry { amount: carry, expires_at });
            }
        } else {
            grant.rollovers.clear();
        }

        let rollover_total: Decimal = grant.rollovers.iter().map(|r| r.amount).sum();
        grant.balance = grant.allowance + rollover_total + grant.additional_granted_balance;
        grant.additional_balance = Decimal::ZERO;

        if let Some(entities) = &mut grant.entities {
            let per_entity = grant.allowance + grant.additional_granted_balance;
            for entity in entities.values_mut() {
                entity.balance = per_entity;
                entity.additional_balance = Decimal::ZERO;
            }
            grant.balance = entities.values().map(|e| e.balance).sum();
        }

        grant.next_reset_at =
            Some(grant.interval.advance(reset_at, grant.interval_count));
        grant
    }

    /// Produce the grant resulting from one idempotent update. Absolute
    /// targets only; applying the same update twice is a no-op.
    pub fn applying(&self, update: &GrantUpdate) -> Grant {
        let mut grant = self.clone();
        grant.balance = update.balance;
        grant.additional_balance = update.additional_balance;
        grant.additional_granted_balance = update.additional_granted_balance;
        grant.adjustment = update.adjustment;
        grant.rollovers = update.rollovers.clone();
        grant.entities = update.entities.clone();
        grant.next_reset_at = update.next_reset_at;
        grant
    }
}

/// Idempotent description of a mutation to one grant. Every target field
/// is an absolute value, so at-least-once delivery to the ledger is safe.
///
/// The `expected_*` fields are the optimistic-concurrency preconditions
/// the cache checks before applying: `expected_next_reset_at` catches a
/// reset-driven rewrite, and the expected balances catch a racing
/// deduction within the same period (the reset token alone cannot order
/// those). The ledger ignores the preconditions entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantUpdate {
    pub customer_id: CustomerId,
    pub grant_id: GrantId,
    pub balance: Decimal,
    pub additional_balance: Decimal,
    pub additional_granted_balance: Decimal,
    pub adjustment: Decimal,
    pub rollovers: Vec<RolloverEntry>,
    pub entities: Option<FxHashMap<EntityId, EntityBalance>>,
    pub next_reset_at: Option<DateTime<Utc>>,
    pub expected_next_reset_at: Option<DateTime<Utc>>,
    pub expected_balance: Decimal,
    pub expected_additional_balance: Decimal,
}

impl GrantUpdate {
    /// Snapshot the grant's current state as an update. The executor and
    /// the administrative path start from this and overwrite the fields
    /// they change; the `expected_*` preconditions keep the values read
    /// here.
    pub fn from_grant(customer_id: &str, grant: &Grant) -> Self {
        Self {
            customer_id: customer_id.to_string(),
            grant_id: grant.id.clone(),
            balance: grant.balance,
            additional_balance: grant.additional_balance,
            additional_granted_balance: grant.additional_granted_balance,
            adjustment: grant.adjustment,
            rollovers: grant.rollovers.clone(),
            entities: grant.entities.clone(),
            next_reset_at: grant.next_reset_at,
            expected_next_reset_at: grant.next_reset_at,
            expected_balance: grant.balance,
            expected_additional_balance: grant.additional_balance,
        }
    }
}

/// The cached unit: customer identity plus all grants across all active
/// customer-products.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerAggregate {
    pub customer_id: CustomerId,
    pub org_id: OrgId,
    pub env: String,
    pub grants: Vec<Grant>,
}

impl CustomerAggregate {
    pub fn find_grant(&self, grant_id: &str) -> Option<&Grant> {
        self.grants.iter().find(|g| g.id == grant_id)
    }

    pub fn grants_for_feature(&self, feature_id: &str) -> Vec<&Grant> {
        self.grants.iter().filter(|g| g.feature_id == feature_id).collect()
    }

    /// Apply due lazy resets across all grants. Returns the new aggregate
    /// and whether any grant actually reset.
    pub fn apply_due_resets(&self, now: DateTime<Utc>) -> (CustomerAggregate, bool) {
        let mut changed = false;
        let grants = self
            .grants
            .iter()
            .map(|g| {
                if g.reset_due(now) {
                    changed = true;
                    g.apply_due_resets(now)
                } else {
                    g.clone()
                }
            })
            .collect();
        (
            CustomerAggregate {
                customer_id: self.customer_id.clone(),
                org_id: self.org_id.clone(),
                env: self.env.clone(),
                grants,
            },
            changed,
        )
    }

    /// Produce the aggregate resulting from a batch of updates. Updates
    /// referencing unknown grants are ignored here; the cache layer has
    /// already validated them against its preconditions.
    pub fn applying(&self, updates: &[GrantUpdate]) -> CustomerAggregate {
        let by_grant: FxHashMap<&str, &GrantUpdate> =
            updates.iter().map(|u| (u.grant_id.as_str(), u)).collect();
        let grants = self
            .grants
            .iter()
            .map(|g| match by_grant.get(g.id.as_str()) {
                Some(update) => g.applying(update),
                None => g.clone(),
            })
            .collect();
        CustomerAggregate {
            customer_id: self.customer_id.clone(),
            org_id: self.org_id.clone(),
            env: self.env.clone(),
            grants,
        }
    }
}
