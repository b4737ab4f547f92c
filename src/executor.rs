//! Deduction executor
//!
//! Applies a planned deduction against a customer aggregate: sorts the
//! eligible grants into a deterministic precedence order, walks them
//! allocating the deduction, and emits one idempotent `GrantUpdate` per
//! touched grant. The input aggregate is never mutated; a new aggregate
//! value is produced and swapped in at the cache layer.

use std::cmp::Ordering;

use rust_decimal::Decimal;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::models::{
    CustomerAggregate, Deduction, EngineError, FeatureKind, Grant, GrantUpdate,
    OverageBehaviour,
};

/// Org-level ordering configuration. The default exhausts reset-bound
/// balances before perpetual ones and shorter cycles before longer ones;
/// the flag inverts both.
#[derive(Debug, Clone, Copy)]
pub struct SortConfig {
    pub reset_bound_first: bool,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self { reset_bound_first: true }
    }
}

#[derive(Debug)]
pub struct ExecutionOutcome {
    pub aggregate: CustomerAggregate,
    pub updates: Vec<GrantUpdate>,
    /// Portion of the requested deduction actually charged (in primary
    /// feature units). Less than requested only when a cap floored the
    /// balance of a strict grant set.
    pub absorbed: Decimal,
}

/// Deterministic precedence between two grants eligible for one feature.
/// Stable: each rule applies only when every previous rule ties.
pub fn grant_order(a: &Grant, b: &Grant, cfg: &SortConfig) -> Ordering {
    // 1. Boolean grants first (presence check only).
    let bool_rank = |g: &Grant| (g.kind != FeatureKind::Boolean) as u8;
    // 2. The feature's own balance before a shared credit pool.
    let credit_rank = |g: &Grant| (g.kind == FeatureKind::CreditSystem) as u8;
    // 3. Unlimited grants absorb everything and short-circuit the walk.
    let unlimited_rank = |g: &Grant| (!g.unlimited) as u8;
    // 4. Exhaust strict grants first so unavoidable overage lands on a
    //    grant built to tolerate it.
    let overage_rank = |g: &Grant| g.usage_allowed as u8;
    // 5. Use-it-before-it-resets, invertible per org.
    let reset_rank = |g: &Grant| {
        let bound_rank = g.next_reset_at.is_none() as u8;
        if cfg.reset_bound_first {
            bound_rank
        } else {
            1 - bound_rank
        }
    };
    // 6. Among reset-bound grants, shorter cycles first; same flag inverts.
    let cycle_magnitude = |g: &Grant| {
        g.next_reset_at
            .map(|_| g.interval.magnitude_secs() * g.interval_count as i64)
    };

    bool_rank(a)
        .cmp(&bool_rank(b))
        .then_with(|| credit_rank(a).cmp(&credit_rank(b)))
        .then_with(|| unlimited_rank(a).cmp(&unlimited_rank(b)))
        .then_with(|| overage_rank(a).cmp(&overage_rank(b)))
        .then_with(|| reset_rank(a).cmp(&reset_rank(b)))
        .then_with(|| match (cycle_magnitude(a), cycle_magnitude(b)) {
            (Some(x), Some(y)) => {
                if cfg.reset_bound_first {
                    x.cmp(&y)
                } else {
                    y.cmp(&x)
                }
            }
            _ => Ordering::Equal,
        })
        // 7. Main-plan grants before add-on grants.
        .then_with(|| (a.is_add_on as u8).cmp(&(b.is_add_on as u8)))
        // 8. Final tie-break: oldest grant first.
        .then_with(|| a.created_at.cmp(&b.created_at))
}

/// Execute a planned deduction. All-or-nothing: on `InsufficientBalance`
/// no grant is mutated and no update is emitted.
pub fn execute(
    aggregate: &CustomerAggregate,
    deductions: &[Deduction],
    behaviour: OverageBehaviour,
    entity_id: Option<&str>,
    sort: &SortConfig,
) -> Result<ExecutionOutcome, EngineError> {
    let Some(primary) = deductions.first() else {
        return Ok(ExecutionOutcome {
            aggregate: aggregate.clone(),
            updates: Vec::new(),
            absorbed: Decimal::ZERO,
        });
    };

    let per_unit: FxHashMap<&str, Decimal> = deductions
        .iter()
        .map(|d| (d.feature.id.as_str(), d.per_unit))
        .collect();

    let mut working: Vec<Grant> = aggregate
        .grants
        .iter()
        .filter(|g| per_unit.contains_key(g.feature_id.as_str()))
        .filter(|g| eligible_for_entity(g, entity_id))
        .cloned()
        .collect();
    working.sort_by(|a, b| grant_order(a, b, sort));
    // Pre-walk snapshot; updates take their OCC preconditions from here.
    let originals = working.clone();

    let mut remaining = primary.amount;
    let mut touched: FxHashSet<usize> = FxHashSet::default();

    if remaining < Decimal::ZERO {
        // Usage correction: credit the highest-precedence grant, repaying
        // absorbed overage before restoring balance.
        if let Some(idx) = working
            .iter()
            .position(|g| g.kind != FeatureKind::Boolean && !g.unlimited)
        {
            let factor = per_unit[working[idx].feature_id.as_str()];
            credit_grant(&mut working[idx], entity_id, -remaining * factor);
            touched.insert(idx);
        }
        remaining = Decimal::ZERO;
    }

    let mut last_numeric: Option<usize> = None;
    for idx in 0..working.len() {
        if remaining <= Decimal::ZERO {
            break;
        }
        let grant = &mut working[idx];
        if grant.kind == FeatureKind::Boolean {
            continue;
        }
        if grant.unlimited {
            // Absorbs the rest with no numeric effect.
            remaining = Decimal::ZERO;
            break;
        }
        let factor = per_unit[grant.feature_id.as_str()];
        if factor <= Decimal::ZERO {
            continue;
        }
        last_numeric = Some(idx);

        let capacity_units = grant.balance_for(entity_id).max(Decimal::ZERO) / factor;
        let take = remaining.min(capacity_units);
        if take > Decimal::ZERO {
            deduct_grant(grant, entity_id, take * factor);
            touched.insert(idx);
            remaining -= take;
        }
    }

    if remaining > Decimal::ZERO {
        match behaviour {
            OverageBehaviour::Reject => {
                return Err(EngineError::InsufficientBalance {
                    available: primary.amount - remaining,
                    required: primary.amount,
                    feature: primary.feature.id.clone(),
                });
            }
            OverageBehaviour::Cap => match last_numeric {
                Some(idx) if working[idx].usage_allowed => {
                    let factor = per_unit[working[idx].feature_id.as_str()];
                    absorb_overage(&mut working[idx], entity_id, remaining * factor);
                    touched.insert(idx);
                    remaining = Decimal::ZERO;
                }
                Some(idx) => {
                    // Every eligible grant is strict: the deduction caps at
                    // what was absorbed and the balance floors at zero.
                    log::debug!(
                        "capped deduction for {} on grant {}: dropping remainder {}",
                        aggregate.customer_id,
                        working[idx].id,
                        remaining
                    );
                }
                None => {
                    log::warn!(
                        "deduction for {} found no numeric grant for feature {}",
                        aggregate.customer_id,
                        primary.feature.id
                    );
                }
            },
        }
    }

    let mut updates: Vec<GrantUpdate> = Vec::with_capacity(touched.len());
    for (idx, grant) in working.iter().enumerate() {
        if touched.contains(&idx) {
            let mut update = GrantUpdate::from_grant(&aggregate.customer_id, &originals[idx]);
            update.balance = grant.balance;
            update.additional_balance = grant.additional_balance;
            update.entities = grant.entities.clone();
            updates.push(update);
        }
    }

    let absorbed = primary.amount - remaining.max(Decimal::ZERO);
    Ok(ExecutionOutcome {
        aggregate: aggregate.applying(&updates),
        updates,
        absorbed,
    })
}

/// Entity-scoped grants participate only when the request addresses one of
/// their entities; an entity can never spend another entity's balance, and
/// a customer-level deduction cannot spend unattributed entity balance.
fn eligible_for_entity(grant: &Grant, entity_id: Option<&str>) -> bool {
    match (&grant.entities, entity_id) {
        (Some(entities), Some(id)) => entities.contains_key(id),
        (Some(_), None) => false,
        (None, _) => true,
    }
}

fn deduct_grant(grant: &mut Grant, entity_id: Option<&str>, delta: Decimal) {
    match (&mut grant.entities, entity_id) {
        (Some(entities), Some(id)) => {
            if let Some(entity) = entities.get_mut(id) {
                entity.balance -= delta;
            }
            grant.balance = entities.values().map(|e| e.balance).sum();
        }
        _ => grant.balance -= delta,
    }
}

fn absorb_overage(grant: &mut Grant, entity_id: Option<&str>, delta: Decimal) {
    match (&mut grant.entities, entity_id) {
        (Some(entities), Some(id)) => {
            if let Some(entity) = entities.get_mut(id) {
                entity.additional_balance -= delta;
            }
            grant.additional_balance = entities.values().map(|e| e.additional_balance).sum();
        }
        _ => grant.additional_balance -= delta,
    }
}

fn credit_grant(grant: &mut Grant, entity_id: Option<&str>, delta: Decimal) {
    match (&mut grant.entities, entity_id) {
        (Some(entities), Some(id)) => {
            if let Some(entity) = entities.get_mut(id) {
                let deficit = -entity.additional_balance;
                let repay = delta.min(deficit.max(Decimal::ZERO));
                entity.additional_balance += repay;
                entity.balance += delta - repay;
            }
            grant.balance = entities.values().map(|e| e.balance).sum();
            grant.additional_balance = entities.values().map(|e| e.additional_balance).sum();
        }
        _ => {
            let deficit = -grant.additional_balance;
            let repay = delta.min(deficit.max(Decimal::ZERO));
            grant.additional_balance += repay;
            grant.balance += delta - repay;
        }
    }
}
