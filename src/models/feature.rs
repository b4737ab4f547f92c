//! Feature catalog types
//!
//! A feature is the unit of entitlement. Credit-system features carry a
//! conversion schema mapping constituent features into credit units.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type FeatureId = String;

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
pub enum FeatureKind {
    /// Presence/absence only, never a numeric balance.
    Boolean,
    /// A plain consumable balance.
    Metered,
    /// A virtual balance consumed by converting constituent-feature usage.
    CreditSystem,
}

/// One row of a credit-system conversion table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditCost {
    /// Constituent feature whose usage is converted.
    pub feature_id: FeatureId,
    /// Credits charged per unit of the constituent feature.
    pub credits_per_unit: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub kind: FeatureKind,
    /// Conversion table; only populated for `CreditSystem` features.
    #[serde(default)]
    pub credit_schema: Vec<CreditCost>,
    /// Usage-event names that resolve to this feature.
    #[serde(default)]
    pub event_names: Vec<String>,
    /// Max decimal places accepted on reported amounts for this feature.
    pub max_precision: u32,
}

impl Feature {
    pub fn metered(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: FeatureKind::Metered,
            credit_schema: Vec::new(),
            event_names: Vec::new(),
            max_precision: 2,
        }
    }

    pub fn boolean(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: FeatureKind::Boolean,
            credit_schema: Vec::new(),
            event_names: Vec::new(),
            max_precision: 0,
        }
    }

    pub fn credit_system(id: &str, schema: Vec<CreditCost>) -> Self {
        Self {
            id: id.to_string(),
            kind: FeatureKind::CreditSystem,
            credit_schema: schema,
            event_names: Vec::new(),
            max_precision: 2,
        }
    }

    /// Credits charged per unit of `constituent`, if this credit system
    /// covers it.
    pub fn credits_per_unit(&self, constituent: &str) -> Option<Decimal> {
        self.credit_schema
            .iter()
            .find(|c| c.feature_id == constituent)
            .map(|c| c.credits_per_unit)
    }

    pub fn covers(&self, constituent: &str) -> bool {
        self.credits_per_unit(constituent).is_some()
    }

    pub fn matches_event(&self, event_name: &str) -> bool {
        self.event_names.iter().any(|e| e == event_name)
    }
}
