//! Deduction planner
//!
//! Translates a usage event (feature or event name, delta amount or
//! absolute usage target) into an ordered list of per-feature deductions:
//! the primary feature first, then every credit system covering it, with
//! amounts converted into credit units.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::credit_manager::CreditManager;
use crate::models::{
    CustomerAggregate, Deduction, EngineError, Feature, FeatureKind, Grant, UsageValue,
};

/// Plan the deductions for one usage event. `credit_features` are the
/// credit systems whose schema covers the primary feature (resolved from
/// the catalog by the caller). Returns an empty plan for no-ops.
pub fn plan(
    aggregate: &CustomerAggregate,
    primary: &Feature,
    credit_features: &[Feature],
    value: UsageValue,
    entity_id: Option<&str>,
    credit_manager: &CreditManager,
    now: DateTime<Utc>,
) -> Result<Vec<Deduction>, EngineError> {
    let direct_grants = aggregate.grants_for_feature(&primary.id);
    let covering: Vec<&Feature> = credit_features
        .iter()
        .filter(|f| !aggregate.grants_for_feature(&f.id).is_empty())
        .collect();

    if direct_grants.is_empty() && covering.is_empty() {
        return Err(EngineError::FeatureNotFound(primary.id.clone()));
    }

    // Boolean features are presence checks; nothing to deduct.
    if primary.kind == FeatureKind::Boolean {
        return Ok(Vec::new());
    }

    let amount = match value {
        UsageValue::Amount(amount) => {
            credit_manager.validate_amount(primary, amount)?;
            amount
        }
        UsageValue::SetUsage(target_usage) => {
            credit_manager.validate_amount(primary, target_usage)?;
            if target_usage < Decimal::ZERO {
                return Err(EngineError::InvalidAmount(format!(
                    "usage target cannot be negative: {}",
                    target_usage
                )));
            }
            set_usage_delta(&direct_grants, target_usage, entity_id, now)
        }
    };

    if amount.is_zero() {
        log::debug!(
            "no-op deduction for {} on feature {}",
            aggregate.customer_id,
            primary.id
        );
        return Ok(Vec::new());
    }

    let mut deductions = vec![Deduction {
        feature: primary.clone(),
        amount,
        per_unit: Decimal::ONE,
    }];
    for credit in covering {
        if let Some(per_unit) = credit.credits_per_unit(&primary.id) {
            deductions.push(Deduction {
                feature: credit.clone(),
                amount: amount * per_unit,
                per_unit,
            });
        }
    }
    Ok(deductions)
}

/// Absolute "set usage" target: deduction = current balance - (total
/// allowance - target usage). Positive when the target raises recorded
/// usage, negative when it lowers it (a correction), zero when already met.
fn set_usage_delta(
    grants: &[&Grant],
    target_usage: Decimal,
    entity_id: Option<&str>,
    now: DateTime<Utc>,
) -> Decimal {
    let total_allowance: Decimal = grants
        .iter()
        .filter(|g| !g.unlimited)
        .map(|g| g.included_usage(now))
        .sum();
    let current_balance: Decimal = grants
        .iter()
        .filter(|g| !g.unlimited)
        .map(|g| g.balance_for(entity_id) + g.additional_balance_for(entity_id))
        .sum();

    let target_balance = total_allowance - target_usage;
    current_balance - target_balance
}
