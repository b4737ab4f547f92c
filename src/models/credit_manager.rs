use rust_decimal::Decimal;

use crate::models::errors::EngineError;
use crate::models::feature::Feature;

/// Converts reported usage between constituent-feature units and credit
/// units, and validates input precision against the feature's configured
/// scale.
#[derive(Debug, Default)]
pub struct CreditManager;

impl CreditManager {
    pub fn new() -> Self {
        Self
    }

    /// Validate input precision.
    /// Example: if max_precision is 2, input 1.23 is valid, 1.234 is invalid.
    pub fn validate_amount(&self, feature: &Feature, amount: Decimal) -> Result<(), EngineError> {
        if amount.normalize().scale() > feature.max_precision {
            return Err(EngineError::InvalidPrecision {
                value: amount.to_string(),
                expected: feature.max_precision,
            });
        }
        Ok(())
    }

    /// Convert `amount` units of `constituent` into credit units of
    /// `credit_feature`. None if the schema does not cover the constituent.
    pub fn to_credit_amount(
        &self,
        credit_feature: &Feature,
        constituent: &str,
        amount: Decimal,
    ) -> Option<Decimal> {
        let per_unit = credit_feature.credits_per_unit(constituent)?;
        Some(amount * per_unit)
    }

    /// Convert a credit-unit amount back into constituent units. None when
    /// the constituent is not covered or the multiplier is zero.
    pub fn to_constituent_amount(
        &self,
        credit_feature: &Feature,
        constituent: &str,
        credits: Decimal,
    ) -> Option<Decimal> {
        let per_unit = credit_feature.credits_per_unit(constituent)?;
        if per_unit.is_zero() {
            return None;
        }
        Some(credits / per_unit)
    }
}
