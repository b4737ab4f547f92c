use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::prelude::FromStr;
use rust_decimal::Decimal;

use usage_ledger::adapters::{MemoryCatalog, MemoryJobQueue, MemoryLedger};
use usage_ledger::balance_cache::{BalanceStore, MemoryStore, TransactionalStore};
use usage_ledger::engine::UsageEngine;
use usage_ledger::executor::SortConfig;
use usage_ledger::models::{
    CreditCost, CustomerAggregate, EngineError, EntityBalance, Feature, FeatureKind, Grant,
    OverageBehaviour, ResetInterval, RolloverPolicy, TrackUsageRequest, UsageValue,
};
use usage_ledger::sync::{BatcherConfig, SyncBatcher};

struct Harness {
    engine: Arc<UsageEngine>,
    ledger: Arc<MemoryLedger>,
    cache: Arc<MemoryStore>,
    batcher: Arc<SyncBatcher>,
    queue: Arc<MemoryJobQueue>,
}

fn harness(features: Vec<Feature>) -> Harness {
    let catalog = Arc::new(MemoryCatalog::with_features(features));
    let ledger = Arc::new(MemoryLedger::new());
    let cache = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let balances = Arc::new(BalanceStore::new(
        cache.clone(),
        ledger.clone(),
        Duration::from_millis(200),
    ));
    let batcher = SyncBatcher::new(
        queue.clone(),
        BatcherConfig { flush_interval_ms: 10_000, max_pending: 10_000 },
    );
    batcher.start();
    let engine = Arc::new(UsageEngine::new(
        catalog,
        ledger.clone(),
        balances,
        batcher.clone(),
        SortConfig::default(),
    ));
    Harness { engine, ledger, cache, batcher, queue }
}

fn grant(id: &str, feature_id: &str, balance: i64) -> Grant {
    Grant {
        id: id.to_string(),
        feature_id: feature_id.to_string(),
        kind: FeatureKind::Metered,
        product_id: "pro".to_string(),
        is_add_on: false,
        allowance: Decimal::from(balance),
        balance: Decimal::from(balance),
        additional_balance: Decimal::ZERO,
        additional_granted_balance: Decimal::ZERO,
        adjustment: Decimal::ZERO,
        rollover_policy: None,
        rollovers: Vec::new(),
        next_reset_at: Some(Utc::now() + ChronoDuration::days(10)),
        interval: ResetInterval::Month,
        interval_count: 1,
        unlimited: false,
        usage_allowed: false,
        entities: None,
        created_at: Utc::now(),
    }
}

fn aggregate(customer_id: &str, grants: Vec<Grant>) -> CustomerAggregate {
    CustomerAggregate {
        customer_id: customer_id.to_string(),
        org_id: "org_1".to_string(),
        env: "live".to_string(),
        grants,
    }
}

fn track(customer_id: &str, feature: &str, amount: &str) -> TrackUsageRequest {
    TrackUsageRequest {
        customer_id: customer_id.to_string(),
        entity_id: None,
        feature: feature.to_string(),
        value: UsageValue::Amount(Decimal::from_str(amount).unwrap()),
        overage_behaviour: OverageBehaviour::Cap,
    }
}

#[tokio::test]
async fn test_track_usage_basic_deduction() {
    // Balance 100, deduct 23.47 under cap.
    let h = harness(vec![Feature::metered("api_calls")]);
    h.ledger.seed(aggregate("cus_1", vec![grant("g1", "api_calls", 100)]));

    let resp = h.engine.track_usage(&track("cus_1", "api_calls", "23.47")).await.unwrap();

    assert_eq!(resp.current, Decimal::from_str("76.53").unwrap());
    assert_eq!(resp.usage, Decimal::from_str("23.47").unwrap());
    assert_eq!(resp.granted, Decimal::from(100));

    // Cache holds the in-request result; the ledger is only updated by
    // the async sync path.
    let cached = h.cache.get("cus_1").await.unwrap().unwrap();
    assert_eq!(cached.grants[0].balance, Decimal::from_str("76.53").unwrap());
    assert_eq!(h.ledger.get("cus_1").unwrap().grants[0].balance, Decimal::from(100));
    assert_eq!(h.batcher.pending_count(), 1);
}

#[tokio::test]
async fn test_reject_overage_fails_without_side_effects() {
    // Prepaid 500, no overage; requesting 501 under reject fails and
    // leaves the balance at 500.
    let h = harness(vec![Feature::metered("api_calls")]);
    h.ledger.seed(aggregate("cus_1", vec![grant("g1", "api_calls", 500)]));

    let mut req = track("cus_1", "api_calls", "501");
    req.overage_behaviour = OverageBehaviour::Reject;
    let err = h.engine.track_usage(&req).await.unwrap_err();
    assert!(matches!(err, EngineError::InsufficientBalance { .. }));

    let cached = h.cache.get("cus_1").await.unwrap().unwrap();
    assert_eq!(cached.grants[0].balance, Decimal::from(500));
    assert_eq!(h.batcher.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_capped_deductions_conserve_balance() {
    // Free grant with balance 5; five concurrent 10-unit deductions under
    // cap all succeed, final balance 0, recorded usage exactly 5.
    let h = harness(vec![Feature::metered("api_calls")]);
    h.ledger.seed(aggregate("cus_1", vec![grant("g1", "api_calls", 5)]));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.track_usage(&track("cus_1", "api_calls", "10")).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().expect("every capped call succeeds");
    }

    let check = h.engine.check_balance("cus_1", "api_calls", Decimal::ONE, None).await.unwrap();
    assert_eq!(check.balance, Decimal::ZERO);

    let resp = h.engine.track_usage(&track("cus_1", "api_calls", "0")).await.unwrap();
    assert_eq!(resp.current, Decimal::ZERO);
    assert_eq!(resp.usage, Decimal::from(5));
}

#[tokio::test]
async fn test_reset_rollover_carries_unused_balance() {
    // Allowance 400 with rollover, 250 unused, reset overdue: the next
    // period's usable balance is 650.
    let h = harness(vec![Feature::metered("api_calls")]);
    let mut g = grant("g1", "api_calls", 400);
    g.balance = Decimal::from(250);
    g.rollover_policy = Some(RolloverPolicy { cap: None, expiry_interval_count: 1 });
    g.next_reset_at = Some(Utc::now() - ChronoDuration::hours(1));
    h.ledger.seed(aggregate("cus_1", vec![g]));

    let resp = h.engine.track_usage(&track("cus_1", "api_calls", "0")).await.unwrap();
    assert_eq!(resp.granted, Decimal::from(650));
    assert_eq!(resp.current, Decimal::from(650));
    assert_eq!(resp.usage, Decimal::ZERO);
}

#[tokio::test]
async fn test_credit_system_conversion() {
    // 0.2 credits per constituent unit: tracking 50 units against the
    // credit grant deducts 10 credits.
    let credit_feature = Feature::credit_system(
        "ai_credits",
        vec![CreditCost {
            feature_id: "gpu_seconds".to_string(),
            credits_per_unit: Decimal::from_str("0.2").unwrap(),
        }],
    );
    let h = harness(vec![Feature::metered("gpu_seconds"), credit_feature]);

    let mut credit_grant = grant("g_credit", "ai_credits", 100);
    credit_grant.kind = FeatureKind::CreditSystem;
    h.ledger.seed(aggregate("cus_1", vec![credit_grant]));

    let resp = h.engine.track_usage(&track("cus_1", "gpu_seconds", "50")).await.unwrap();

    // Reported in credit units since only the credit grant covers it.
    assert_eq!(resp.current, Decimal::from(90));
    let cached = h.cache.get("cus_1").await.unwrap().unwrap();
    assert_eq!(cached.grants[0].balance, Decimal::from(90));
}

#[tokio::test]
async fn test_event_name_resolution() {
    let mut feature = Feature::metered("api_calls");
    feature.event_names = vec!["request.completed".to_string()];
    let h = harness(vec![feature]);
    h.ledger.seed(aggregate("cus_1", vec![grant("g1", "api_calls", 100)]));

    let resp = h.engine.track_usage(&track("cus_1", "request.completed", "10")).await.unwrap();
    assert_eq!(resp.feature_id, "api_calls");
    assert_eq!(resp.current, Decimal::from(90));
}

#[tokio::test]
async fn test_feature_not_found() {
    let h = harness(vec![Feature::metered("api_calls")]);
    h.ledger.seed(aggregate("cus_1", vec![grant("g1", "api_calls", 100)]));

    let err = h.engine.track_usage(&track("cus_1", "unknown", "10")).await.unwrap_err();
    assert!(matches!(err, EngineError::FeatureNotFound(_)));

    // Known feature, but no grant anywhere for this customer.
    let err = h.engine.track_usage(&track("cus_2", "api_calls", "10")).await.unwrap_err();
    assert!(matches!(err, EngineError::FeatureNotFound(_)));
}

#[tokio::test]
async fn test_set_usage_correction() {
    let h = harness(vec![Feature::metered("api_calls")]);
    let mut g = grant("g1", "api_calls", 100);
    g.balance = Decimal::from(40); // 60 used
    h.ledger.seed(aggregate("cus_1", vec![g]));

    // Correct recorded usage down to 25: balance goes back up to 75.
    let req = TrackUsageRequest {
        customer_id: "cus_1".to_string(),
        entity_id: None,
        feature: "api_calls".to_string(),
        value: UsageValue::SetUsage(Decimal::from(25)),
        overage_behaviour: OverageBehaviour::Cap,
    };
    let resp = h.engine.track_usage(&req).await.unwrap();
    assert_eq!(resp.current, Decimal::from(75));
    assert_eq!(resp.usage, Decimal::from(25));

    // Setting the same target again is a no-op.
    let resp = h.engine.track_usage(&req).await.unwrap();
    assert_eq!(resp.current, Decimal::from(75));
    assert_eq!(h.batcher.pending_count(), 1);
}

#[tokio::test]
async fn test_guarded_cache_degrades_to_ledger_direct() {
    let h = harness(vec![Feature::metered("api_calls")]);
    h.ledger.seed(aggregate("cus_1", vec![grant("g1", "api_calls", 100)]));

    // Warm the cache, then invalidate: the guard blocks atomic applies.
    h.engine.track_usage(&track("cus_1", "api_calls", "10")).await.unwrap();
    h.cache.remove_guarded("cus_1", Duration::from_secs(60)).await.unwrap();

    // The deduction still succeeds through the ledger-direct path.
    let resp = h.engine.track_usage(&track("cus_1", "api_calls", "10")).await.unwrap();
    assert_eq!(resp.current, Decimal::from(90));
    assert_eq!(h.ledger.get("cus_1").unwrap().grants[0].balance, Decimal::from(90));
}

#[tokio::test]
async fn test_check_balance_is_read_only() {
    let h = harness(vec![Feature::metered("api_calls")]);
    h.ledger.seed(aggregate("cus_1", vec![grant("g1", "api_calls", 50)]));

    let ok = h.engine.check_balance("cus_1", "api_calls", Decimal::from(30), None).await.unwrap();
    assert!(ok.allowed);
    assert_eq!(ok.balance, Decimal::from(50));
    assert_eq!(ok.required, Decimal::from(30));

    let too_much =
        h.engine.check_balance("cus_1", "api_calls", Decimal::from(51), None).await.unwrap();
    assert!(!too_much.allowed);

    // No mutation, no sync traffic.
    let cached = h.cache.get("cus_1").await.unwrap().unwrap();
    assert_eq!(cached.grants[0].balance, Decimal::from(50));
    assert_eq!(h.batcher.pending_count(), 0);
}

#[tokio::test]
async fn test_check_balance_boolean_feature() {
    let h = harness(vec![Feature::boolean("sso")]);
    let mut g = grant("g1", "sso", 0);
    g.kind = FeatureKind::Boolean;
    h.ledger.seed(aggregate("cus_1", vec![g]));

    let check = h.engine.check_balance("cus_1", "sso", Decimal::ONE, None).await.unwrap();
    assert!(check.allowed);
    assert_eq!(check.balance, Decimal::ZERO);
}

#[tokio::test]
async fn test_unlimited_grant_allows_everything() {
    let h = harness(vec![Feature::metered("api_calls")]);
    let mut g = grant("g1", "api_calls", 0);
    g.unlimited = true;
    h.ledger.seed(aggregate("cus_1", vec![g]));

    let resp = h.engine.track_usage(&track("cus_1", "api_calls", "1000000")).await.unwrap();
    assert!(resp.unlimited);
    assert_eq!(h.batcher.pending_count(), 0);

    let check = h
        .engine
        .check_balance("cus_1", "api_calls", Decimal::from(1_000_000), None)
        .await
        .unwrap();
    assert!(check.allowed);
}

#[tokio::test]
async fn test_update_granted_balance() {
    let h = harness(vec![Feature::metered("api_calls")]);
    h.ledger.seed(aggregate("cus_1", vec![grant("g1", "api_calls", 100)]));

    h.engine
        .update_granted_balance("cus_1", "api_calls", Decimal::from(150), None)
        .await
        .unwrap();

    let cached = h.cache.get("cus_1").await.unwrap().unwrap();
    assert_eq!(cached.grants[0].additional_granted_balance, Decimal::from(50));
    assert_eq!(cached.grants[0].adjustment, Decimal::from(50));
    assert_eq!(cached.grants[0].balance, Decimal::from(150));
    assert_eq!(h.batcher.pending_count(), 1);

    let resp = h.engine.track_usage(&track("cus_1", "api_calls", "0")).await.unwrap();
    assert_eq!(resp.granted, Decimal::from(150));

    // Lowering the granted balance works the same way.
    h.engine
        .update_granted_balance("cus_1", "api_calls", Decimal::from(120), None)
        .await
        .unwrap();
    let cached = h.cache.get("cus_1").await.unwrap().unwrap();
    assert_eq!(cached.grants[0].balance, Decimal::from(120));
}

#[tokio::test]
async fn test_entity_scoped_tracking() {
    let h = harness(vec![Feature::metered("api_calls")]);
    let mut g = grant("g1", "api_calls", 20);
    let mut entities = rustc_hash::FxHashMap::default();
    entities.insert(
        "seat_a".to_string(),
        EntityBalance { balance: Decimal::from(10), additional_balance: Decimal::ZERO },
    );
    entities.insert(
        "seat_b".to_string(),
        EntityBalance { balance: Decimal::from(10), additional_balance: Decimal::ZERO },
    );
    g.entities = Some(entities);
    h.ledger.seed(aggregate("cus_1", vec![g]));

    let req = TrackUsageRequest {
        customer_id: "cus_1".to_string(),
        entity_id: Some("seat_a".to_string()),
        feature: "api_calls".to_string(),
        value: UsageValue::Amount(Decimal::from(4)),
        overage_behaviour: OverageBehaviour::Cap,
    };
    let resp = h.engine.track_usage(&req).await.unwrap();
    assert_eq!(resp.current, Decimal::from(6));

    // The customer-level view sums the per-entity balances.
    let check = h.engine.check_balance("cus_1", "api_calls", Decimal::ONE, None).await.unwrap();
    assert_eq!(check.balance, Decimal::from(16));

    let resp = h.engine.track_usage(&track("cus_1", "api_calls", "0")).await.unwrap();
    let breakdown = resp.entity_breakdown.unwrap();
    assert_eq!(breakdown.len(), 2);
    assert_eq!(breakdown[0].entity_id, "seat_a");
    assert_eq!(breakdown[0].balance, Decimal::from(6));
    assert_eq!(breakdown[1].balance, Decimal::from(10));
}

#[tokio::test]
async fn test_overage_lands_on_tolerant_grant() {
    // Strict grant is exhausted first; the remainder lands on the
    // overage-tolerant grant's additional balance.
    let h = harness(vec![Feature::metered("api_calls")]);
    let strict = grant("g_strict", "api_calls", 10);
    let mut tolerant = grant("g_tolerant", "api_calls", 5);
    tolerant.usage_allowed = true;
    h.ledger.seed(aggregate("cus_1", vec![tolerant, strict]));

    let resp = h.engine.track_usage(&track("cus_1", "api_calls", "20")).await.unwrap();
    assert_eq!(resp.current, Decimal::from(-5));
    assert_eq!(resp.usage, Decimal::from(20));

    let cached = h.cache.get("cus_1").await.unwrap().unwrap();
    assert_eq!(cached.find_grant("g_strict").unwrap().balance, Decimal::ZERO);
    let tolerant = cached.find_grant("g_tolerant").unwrap();
    assert_eq!(tolerant.balance, Decimal::ZERO);
    assert_eq!(tolerant.additional_balance, Decimal::from(-5));
}

#[tokio::test]
async fn test_dirty_pairs_reach_queue_on_flush() {
    let h = harness(vec![Feature::metered("api_calls")]);
    h.ledger.seed(aggregate("cus_1", vec![grant("g1", "api_calls", 100)]));

    h.engine.track_usage(&track("cus_1", "api_calls", "10")).await.unwrap();
    h.engine.track_usage(&track("cus_1", "api_calls", "5")).await.unwrap();
    assert_eq!(h.batcher.pending_count(), 1, "same customer dedups");

    h.batcher.flush().await;
    let batch = h.queue.try_pop().unwrap();
    assert_eq!(batch.pairs.len(), 1);
    assert_eq!(batch.pairs[0].customer_id, "cus_1");
    assert_eq!(batch.pairs[0].grant_ids, vec!["g1".to_string()]);
}
