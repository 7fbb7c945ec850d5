//! Offline end-to-end tests for deposit reconciliation
//!
//! Exercises the coordinator against a real SQLite file: dedup across
//! delivery paths, partial funding accumulation, excess flagging, and the
//! poll sweep with a fixture chain client.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;

use server::chain::{ChainClient, ChainTransfer};
use server::models::deposit_event::DepositEvent;
use server::models::trade_transition::TradeTransition;
use server::services::audit::AuditService;
use server::services::chain_monitor::{ChainMonitor, MonitorConfig};
use server::services::correlator::{CorrelationError, DepositSource};
use server::services::reconciler::{ApplyOutcome, ReconciliationCoordinator};

use common::{deposit, insert_trade, insert_user, reload_trade, setup};

fn coordinator(pool: &server::db::DbPool) -> Arc<ReconciliationCoordinator> {
    Arc::new(ReconciliationCoordinator::new(
        pool.clone(),
        AuditService::new(pool.clone()),
    ))
}

#[tokio::test]
async fn test_single_deposit_funds_trade() {
    let db = setup();
    let buyer = insert_user(&db.pool, "buyer_a");
    let seller = insert_user(&db.pool, "seller_a");
    let trade = insert_trade(&db.pool, &buyer, &seller, 100);
    let reconciler = coordinator(&db.pool);

    let outcome = reconciler
        .apply_deposit(deposit(
            DepositSource::Webhook,
            "tx-fund-1",
            100,
            &trade.escrow_id.to_string(),
        ))
        .await
        .unwrap();

    match outcome {
        ApplyOutcome::Applied {
            trade: fresh,
            newly_funded,
            excess,
        } => {
            assert!(newly_funded);
            assert_eq!(excess, 0);
            assert_eq!(fresh.status, "funded");
            assert_eq!(fresh.funded_amount, 100);
        }
        other => panic!("expected Applied, got {:?}", other),
    }
}

#[tokio::test]
async fn test_replay_same_tx_hash_is_idempotent() {
    let db = setup();
    let buyer = insert_user(&db.pool, "buyer_b");
    let seller = insert_user(&db.pool, "seller_b");
    let trade = insert_trade(&db.pool, &buyer, &seller, 100);
    let reconciler = coordinator(&db.pool);
    let memo = trade.escrow_id.to_string();

    let first = reconciler
        .apply_deposit(deposit(DepositSource::Webhook, "tx-dup", 100, &memo))
        .await
        .unwrap();
    assert!(matches!(first, ApplyOutcome::Applied { .. }));

    let after_first = reload_trade(&db.pool, &trade.id);

    // Redelivered from the other source: acknowledged, no further effect.
    let second = reconciler
        .apply_deposit(deposit(DepositSource::Poll, "tx-dup", 100, &memo))
        .await
        .unwrap();
    assert!(matches!(second, ApplyOutcome::AlreadyApplied));

    let after_second = reload_trade(&db.pool, &trade.id);
    assert_eq!(after_first.funded_amount, after_second.funded_amount);
    assert_eq!(after_first.status, after_second.status);
    assert_eq!(after_first.version, after_second.version);
}

#[tokio::test]
async fn test_partial_deposits_accumulate_and_fund_once() {
    let db = setup();
    let buyer = insert_user(&db.pool, "buyer_c");
    let seller = insert_user(&db.pool, "seller_c");
    let trade = insert_trade(&db.pool, &buyer, &seller, 100);
    let reconciler = coordinator(&db.pool);
    let memo = trade.escrow_id.to_string();

    // 60 first: recorded, not yet funded.
    let first = reconciler
        .apply_deposit(deposit(DepositSource::Webhook, "tx-part-1", 60, &memo))
        .await
        .unwrap();
    match first {
        ApplyOutcome::Applied {
            trade: fresh,
            newly_funded,
            ..
        } => {
            assert!(!newly_funded);
            assert_eq!(fresh.status, "pending_funding");
            assert_eq!(fresh.funded_amount, 60);
        }
        other => panic!("expected Applied, got {:?}", other),
    }

    // 50 second: crosses the threshold, 10 excess recorded.
    let second = reconciler
        .apply_deposit(deposit(DepositSource::Poll, "tx-part-2", 50, &memo))
        .await
        .unwrap();
    match second {
        ApplyOutcome::Applied {
            trade: fresh,
            newly_funded,
            excess,
        } => {
            assert!(newly_funded);
            assert_eq!(excess, 10);
            assert_eq!(fresh.status, "funded");
            assert_eq!(fresh.funded_amount, 110);
            assert_eq!(fresh.excess_amount, 10);
        }
        other => panic!("expected Applied, got {:?}", other),
    }

    // Exactly one FUNDED transition in the log.
    let mut conn = db.pool.get().unwrap();
    let history = TradeTransition::history(&mut conn, &trade.id).unwrap();
    let funded_count = history.iter().filter(|t| t.to_status == "funded").count();
    assert_eq!(funded_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deposits_settle_exactly_once() {
    let db = setup();
    let buyer = insert_user(&db.pool, "buyer_d");
    let seller = insert_user(&db.pool, "seller_d");
    let trade = insert_trade(&db.pool, &buyer, &seller, 100);
    let reconciler = coordinator(&db.pool);
    let memo = trade.escrow_id.to_string();

    // Webhook and poll race with different transactions for one escrow.
    let results = join_all([
        reconciler.apply_deposit(deposit(DepositSource::Webhook, "tx-race-1", 60, &memo)),
        reconciler.apply_deposit(deposit(DepositSource::Poll, "tx-race-2", 50, &memo)),
    ])
    .await;

    for result in results {
        assert!(matches!(result.unwrap(), ApplyOutcome::Applied { .. }));
    }

    let fresh = reload_trade(&db.pool, &trade.id);
    assert_eq!(fresh.status, "funded");
    assert_eq!(fresh.funded_amount, 110);
    assert_eq!(fresh.excess_amount, 10);

    let mut conn = db.pool.get().unwrap();
    let history = TradeTransition::history(&mut conn, &trade.id).unwrap();
    let funded_count = history.iter().filter(|t| t.to_status == "funded").count();
    assert_eq!(funded_count, 1, "FUNDED must fire exactly once");

    // Both deposits attributed to this trade, none lost, none doubled.
    assert_eq!(DepositEvent::total_for_trade(&mut conn, &trade.id).unwrap(), 110);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_tx_racing_from_both_sources_applies_once() {
    let db = setup();
    let buyer = insert_user(&db.pool, "buyer_e");
    let seller = insert_user(&db.pool, "seller_e");
    let trade = insert_trade(&db.pool, &buyer, &seller, 100);
    let reconciler = coordinator(&db.pool);
    let memo = trade.escrow_id.to_string();

    let results = join_all([
        reconciler.apply_deposit(deposit(DepositSource::Webhook, "tx-same", 100, &memo)),
        reconciler.apply_deposit(deposit(DepositSource::Poll, "tx-same", 100, &memo)),
    ])
    .await;

    let applied = results
        .into_iter()
        .filter(|r| matches!(r.as_ref().unwrap(), ApplyOutcome::Applied { .. }))
        .count();
    assert_eq!(applied, 1, "one delivery wins, the other replays");

    let fresh = reload_trade(&db.pool, &trade.id);
    assert_eq!(fresh.funded_amount, 100, "no double count");
}

#[tokio::test]
async fn test_funded_amount_never_regresses() {
    let db = setup();
    let buyer = insert_user(&db.pool, "buyer_f");
    let seller = insert_user(&db.pool, "seller_f");
    let trade = insert_trade(&db.pool, &buyer, &seller, 1_000);
    let reconciler = coordinator(&db.pool);
    let memo = trade.escrow_id.to_string();

    let mut last_funded = 0;
    for (i, amount) in [100, 250, 400, 250, 500].iter().enumerate() {
        reconciler
            .apply_deposit(deposit(
                DepositSource::Poll,
                &format!("tx-mono-{}", i),
                *amount,
                &memo,
            ))
            .await
            .unwrap();
        let fresh = reload_trade(&db.pool, &trade.id);
        assert!(fresh.funded_amount >= last_funded, "monotonicity violated");
        last_funded = fresh.funded_amount;
    }
    assert_eq!(last_funded, 1_500);
}

#[tokio::test]
async fn test_unparsable_memo_dropped_without_state_change() {
    let db = setup();
    let buyer = insert_user(&db.pool, "buyer_g");
    let seller = insert_user(&db.pool, "seller_g");
    let trade = insert_trade(&db.pool, &buyer, &seller, 100);
    let reconciler = coordinator(&db.pool);

    for memo in ["not-a-number", "-5", "12.5", ""] {
        let outcome = reconciler
            .apply_deposit(deposit(
                DepositSource::Webhook,
                &format!("tx-memo-{}", memo.len()),
                100,
                memo,
            ))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ApplyOutcome::Dropped(CorrelationError::UnparsableMemo)
        ));
    }

    let fresh = reload_trade(&db.pool, &trade.id);
    assert_eq!(fresh.funded_amount, 0);
    assert_eq!(fresh.status, "pending_funding");
}

#[tokio::test]
async fn test_unknown_escrow_dropped() {
    let db = setup();
    let reconciler = coordinator(&db.pool);

    let outcome = reconciler
        .apply_deposit(deposit(DepositSource::Poll, "tx-orphan", 100, "424242"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ApplyOutcome::Dropped(CorrelationError::NoSuchEscrow(424242))
    ));
}

// ============================================================================
// Poll sweep with a fixture chain client
// ============================================================================

struct FixtureChainClient {
    transfers: Vec<ChainTransfer>,
    calls: AtomicUsize,
}

#[async_trait]
impl ChainClient for FixtureChainClient {
    async fn list_transfers(&self, since_cursor: i64) -> anyhow::Result<Vec<ChainTransfer>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .transfers
            .iter()
            .filter(|t| t.cursor > since_cursor)
            .cloned()
            .collect())
    }
}

#[tokio::test]
async fn test_poll_sweep_applies_and_advances_checkpoint() {
    let db = setup();
    let buyer = insert_user(&db.pool, "buyer_h");
    let seller = insert_user(&db.pool, "seller_h");
    let trade = insert_trade(&db.pool, &buyer, &seller, 100);
    let reconciler = coordinator(&db.pool);

    let client = Arc::new(FixtureChainClient {
        transfers: vec![
            ChainTransfer {
                tx_hash: "tx-sweep-1".to_string(),
                sender_address: "TSweepSender0000000001".to_string(),
                amount: 100,
                memo: trade.escrow_id.to_string(),
                cursor: 11,
            },
            ChainTransfer {
                tx_hash: "tx-sweep-2".to_string(),
                sender_address: "TSweepSender0000000002".to_string(),
                amount: 50,
                memo: "garbage".to_string(),
                cursor: 12,
            },
        ],
        calls: AtomicUsize::new(0),
    });

    let monitor = ChainMonitor::new(
        client.clone(),
        db.pool.clone(),
        reconciler,
        MonitorConfig::default(),
    );

    let stats = monitor.sweep_once().await.unwrap();
    assert_eq!(stats.fetched, 2);
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.dropped, 1);

    let fresh = reload_trade(&db.pool, &trade.id);
    assert_eq!(fresh.status, "funded");

    // Second pass: checkpoint advanced past both transfers, nothing refetched.
    let stats = monitor.sweep_once().await.unwrap();
    assert_eq!(stats.fetched, 0);
    assert_eq!(client.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_poll_sweep_replays_are_absorbed() {
    let db = setup();
    let buyer = insert_user(&db.pool, "buyer_i");
    let seller = insert_user(&db.pool, "seller_i");
    let trade = insert_trade(&db.pool, &buyer, &seller, 100);
    let reconciler = coordinator(&db.pool);
    let memo = trade.escrow_id.to_string();

    // Webhook already delivered this transfer.
    reconciler
        .apply_deposit(deposit(DepositSource::Webhook, "tx-overlap", 100, &memo))
        .await
        .unwrap();

    let client = Arc::new(FixtureChainClient {
        transfers: vec![ChainTransfer {
            tx_hash: "tx-overlap".to_string(),
            sender_address: "TSweepSender0000000003".to_string(),
            amount: 100,
            memo,
            cursor: 5,
        }],
        calls: AtomicUsize::new(0),
    });

    let monitor = ChainMonitor::new(
        client,
        db.pool.clone(),
        reconciler,
        MonitorConfig::default(),
    );

    let stats = monitor.sweep_once().await.unwrap();
    assert_eq!(stats.replayed, 1);
    assert_eq!(stats.applied, 0);

    let fresh = reload_trade(&db.pool, &trade.id);
    assert_eq!(fresh.funded_amount, 100, "poll replay must not double count");
}
