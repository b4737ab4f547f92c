//! Usage engine
//!
//! Orchestrates the synchronous request path: plan the deduction, load the
//! aggregate cache-aside, execute the walk, apply the result atomically to
//! the cache, and hand the dirty grants to the sync batcher. A stale write
//! is retried once against a fresh read before the path degrades to
//! computing directly against the ledger.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;

use crate::adapters::traits::{Catalog, LedgerStore};
use crate::balance_cache::store::BalanceStore;
use crate::executor::{self, ExecutionOutcome, SortConfig};
use crate::models::credit_manager::CreditManager;
use crate::models::{
    BalanceCheck, CustomerAggregate, EngineError, EntityUsage, Feature, FeatureKind,
    Grant, GrantUpdate, TrackUsageRequest, UsageResponse, UsageValue,
};
use crate::planner;
use crate::sync::batcher::SyncBatcher;

pub struct UsageEngine {
    catalog: Arc<dyn Catalog>,
    ledger: Arc<dyn LedgerStore>,
    balances: Arc<BalanceStore>,
    batcher: Arc<SyncBatcher>,
    credit_manager: CreditManager,
    sort: SortConfig,
}

impl UsageEngine {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        ledger: Arc<dyn LedgerStore>,
        balances: Arc<BalanceStore>,
        batcher: Arc<SyncBatcher>,
        sort: SortConfig,
    ) -> Self {
        Self {
            catalog,
            ledger,
            balances,
            batcher,
            credit_manager: CreditManager::new(),
            sort,
        }
    }

    async fn resolve(&self, id_or_event: &str) -> Result<(Feature, Vec<Feature>), EngineError> {
        let feature = self
            .catalog
            .resolve_feature(id_or_event)
            .await?
            .ok_or_else(|| EngineError::FeatureNotFound(id_or_event.to_string()))?;
        let credits = self.catalog.credit_systems_for(&feature.id).await?;
        Ok((feature, credits))
    }

    /// Record a usage event and return the resulting balance view.
    pub async fn track_usage(
        &self,
        req: &TrackUsageRequest,
    ) -> Result<UsageResponse, EngineError> {
        let (feature, credits) = self.resolve(&req.feature).await?;
        let entity = req.entity_id.as_deref();

        for attempt in 0..2 {
            let Some(aggregate) = self.balances.load(&req.customer_id).await? else {
                return Err(EngineError::FeatureNotFound(feature.id.clone()));
            };
            let plan = planner::plan(
                &aggregate,
                &feature,
                &credits,
                req.value,
                entity,
                &self.credit_manager,
                Utc::now(),
            )?;
            if plan.is_empty() {
                return Ok(self.build_response(&aggregate, &feature, &credits, entity));
            }
            let outcome =
                executor::execute(&aggregate, &plan, req.overage_behaviour, entity, &self.sort)?;

            match self
                .balances
                .atomic_apply(&req.customer_id, &outcome.updates)
                .await
            {
                Ok(()) => {
                    self.enqueue_dirty(&aggregate, &outcome);
                    return Ok(self.build_response(
                        &outcome.aggregate,
                        &feature,
                        &credits,
                        entity,
                    ));
                }
                Err(EngineError::StaleWrite(_)) | Err(EngineError::GuardActive(_))
                    if attempt == 0 =>
                {
                    log::info!(
                        "stale apply for {}, reloading and retrying once",
                        req.customer_id
                    );
                }
                Err(EngineError::StaleWrite(_)) | Err(EngineError::GuardActive(_)) => {
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        self.track_usage_ledger_direct(req, &feature, &credits).await
    }

    /// Degraded mode: compute against the ledger itself. Slower, still
    /// atomic at the ledger level; the cache entry is invalidated so the
    /// next read reloads authoritative state.
    async fn track_usage_ledger_direct(
        &self,
        req: &TrackUsageRequest,
        feature: &Feature,
        credits: &[Feature],
    ) -> Result<UsageResponse, EngineError> {
        log::warn!(
            "degrading to ledger-direct deduction for customer {}",
            req.customer_id
        );
        let entity = req.entity_id.as_deref();
        let Some(aggregate) = self.ledger.load_aggregate(&req.customer_id).await? else {
            return Err(EngineError::FeatureNotFound(feature.id.clone()));
        };
        let (aggregate, _) = aggregate.apply_due_resets(Utc::now());

        let plan = planner::plan(
            &aggregate,
            feature,
            credits,
            req.value,
            entity,
            &self.credit_manager,
            Utc::now(),
        )?;
        if plan.is_empty() {
            return Ok(self.build_response(&aggregate, feature, credits, entity));
        }
        let outcome =
            executor::execute(&aggregate, &plan, req.overage_behaviour, entity, &self.sort)?;

        self.ledger
            .commit_updates(&outcome.updates)
            .await
            .map_err(|e| EngineError::LedgerUnavailable(e.to_string()))?;
        self.balances.invalidate(&req.customer_id).await?;

        Ok(self.build_response(&outcome.aggregate, feature, credits, entity))
    }

    /// Read-only variant of the planner/executor walk: would a deduction
    /// of `required` succeed under reject semantics?
    pub async fn check_balance(
        &self,
        customer_id: &str,
        feature: &str,
        required: Decimal,
        entity_id: Option<&str>,
    ) -> Result<BalanceCheck, EngineError> {
        let (feature, credits) = self.resolve(feature).await?;
        let Some(aggregate) = self.balances.load(customer_id).await? else {
            return Err(EngineError::FeatureNotFound(feature.id.clone()));
        };

        if feature.kind == FeatureKind::Boolean {
            let allowed = !aggregate.grants_for_feature(&feature.id).is_empty();
            return Ok(BalanceCheck { allowed, balance: Decimal::ZERO, required });
        }

        let plan = planner::plan(
            &aggregate,
            &feature,
            &credits,
            UsageValue::Amount(required),
            entity_id,
            &self.credit_manager,
            Utc::now(),
        )?;
        let allowed = plan.is_empty()
            || executor::execute(
                &aggregate,
                &plan,
                crate::models::OverageBehaviour::Reject,
                entity_id,
                &self.sort,
            )
            .is_ok();

        let response = self.build_response(&aggregate, &feature, &credits, entity_id);
        Ok(BalanceCheck { allowed, balance: response.current, required })
    }

    /// Administrative override: move the grant's total granted balance to
    /// `target_granted` by adjusting `additional_granted_balance` and the
    /// signed `adjustment`, bypassing the deduction walk entirely. Racing
    /// a concurrent deduction on the same grant serializes through the
    /// cache's atomic apply; the loser of the race recomputes.
    pub async fn update_granted_balance(
        &self,
        customer_id: &str,
        feature_id: &str,
        target_granted: Decimal,
        entity_id: Option<&str>,
    ) -> Result<(), EngineError> {
        for attempt in 0..2 {
            let Some(aggregate) = self.balances.load(customer_id).await? else {
                return Err(EngineError::FeatureNotFound(feature_id.to_string()));
            };
            let mut grants: Vec<&Grant> = aggregate
                .grants_for_feature(feature_id)
                .into_iter()
                .filter(|g| !g.unlimited)
                .collect();
            grants.sort_by(|a, b| executor::grant_order(a, b, &self.sort));
            let Some(grant) = grants.first() else {
                return Err(EngineError::FeatureNotFound(feature_id.to_string()));
            };

            let now = Utc::now();
            let delta = target_granted - grant.included_usage(now);
            if delta.is_zero() {
                return Ok(());
            }

            let mut update = GrantUpdate::from_grant(customer_id, grant);
            update.additional_granted_balance += delta;
            update.adjustment += delta;
            match (&mut update.entities, entity_id) {
                (Some(entities), Some(id)) => {
                    let entry = entities.entry(id.to_string()).or_default();
                    entry.balance += delta;
                    update.balance = entities.values().map(|e| e.balance).sum();
                }
                _ => update.balance += delta,
            }
            let grant_id = update.grant_id.clone();

            match self
                .balances
                .atomic_apply(customer_id, std::slice::from_ref(&update))
                .await
            {
                Ok(()) => {
                    log::info!(
                        "granted balance for {} grant {} set to {} (delta {})",
                        customer_id,
                        grant_id,
                        target_granted,
                        delta
                    );
                    self.batcher.enqueue(
                        customer_id,
                        &aggregate.org_id,
                        &aggregate.env,
                        vec![grant_id],
                    );
                    return Ok(());
                }
                Err(EngineError::StaleWrite(_)) | Err(EngineError::GuardActive(_))
                    if attempt == 0 =>
                {
                    log::info!(
                        "stale administrative update for {}, retrying once",
                        customer_id
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::StaleWrite(customer_id.to_string()))
    }

    fn enqueue_dirty(&self, aggregate: &CustomerAggregate, outcome: &ExecutionOutcome) {
        if outcome.updates.is_empty() {
            return;
        }
        let grant_ids = outcome.updates.iter().map(|u| u.grant_id.clone()).collect();
        self.batcher.enqueue(
            &aggregate.customer_id,
            &aggregate.org_id,
            &aggregate.env,
            grant_ids,
        );
    }

    /// Balance view over the grants relevant to the feature: the primary
    /// feature's own grants when any exist, otherwise the covering credit
    /// grants (reported in credit units).
    fn build_response(
        &self,
        aggregate: &CustomerAggregate,
        feature: &Feature,
        credits: &[Feature],
        entity_id: Option<&str>,
    ) -> UsageResponse {
        let now = Utc::now();
        let direct = aggregate.grants_for_feature(&feature.id);
        let report: Vec<&Grant> = if direct.is_empty() {
            credits
                .iter()
                .flat_map(|c| aggregate.grants_for_feature(&c.id))
                .collect()
        } else {
            direct
        };

        let unlimited = report.iter().any(|g| g.unlimited);
        let sized: Vec<&&Grant> = report.iter().filter(|g| !g.unlimited).collect();
        let granted: Decimal = sized.iter().map(|g| g.included_usage(now)).sum();
        let current: Decimal = sized
            .iter()
            .map(|g| g.balance_for(entity_id) + g.additional_balance_for(entity_id))
            .sum();

        let entity_breakdown = if entity_id.is_none() {
            let mut per_entity: Vec<EntityUsage> = Vec::new();
            for grant in &report {
                if let Some(entities) = &grant.entities {
                    for (id, entity) in entities {
                        match per_entity.iter_mut().find(|e| &e.entity_id == id) {
                            Some(existing) => {
                                existing.balance += entity.balance + entity.additional_balance
                            }
                            None => per_entity.push(EntityUsage {
                                entity_id: id.clone(),
                                balance: entity.balance + entity.additional_balance,
                            }),
                        }
                    }
                }
            }
            if per_entity.is_empty() {
                None
            } else {
                per_entity.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
                Some(per_entity)
            }
        } else {
            None
        };

        UsageResponse {
            feature_id: feature.id.clone(),
            granted,
            current,
            usage: granted - current,
            unlimited,
            entity_breakdown,
        }
    }
}
