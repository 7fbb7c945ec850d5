//! Offline end-to-end tests for the trade lifecycle
//!
//! Full state-machine paths over a real SQLite file: settlement with fee
//! conservation, cancellation windows, lazy deadline handling, dispute
//! resolution policy, reviews and ban self-healing.

mod common;

use chrono::{Duration, Utc};

use server::config::{FeeConfig, VolumeTier};
use server::models::trade_transition::TradeTransition;
use server::models::user::User;
use server::services::audit::AuditService;
use server::services::ban_guard::BanGuard;
use server::services::correlator::DepositSource;
use server::services::reconciler::ReconciliationCoordinator;
use server::services::reputation::{ReputationLedger, ReviewError, Vote};
use server::services::state_machine::{
    EscrowStateMachine, Resolution, TransitionError, TransitionOutcome,
};
use server::services::timeout_monitor::TimeoutMonitor;

use common::{deposit, insert_trade, insert_trade_with_deadlines, insert_user, reload_trade, reload_user, setup};

fn services(
    pool: &server::db::DbPool,
) -> (
    EscrowStateMachine,
    ReconciliationCoordinator,
    BanGuard,
    ReputationLedger,
) {
    let audit = AuditService::new(pool.clone());
    (
        EscrowStateMachine::new(pool.clone(), FeeConfig::default(), audit.clone()),
        ReconciliationCoordinator::new(pool.clone(), audit.clone()),
        BanGuard::new(pool.clone(), audit.clone()),
        ReputationLedger::new(pool.clone(), audit),
    )
}

async fn fund(
    reconciler: &ReconciliationCoordinator,
    trade: &server::models::trade::Trade,
    tx: &str,
) {
    reconciler
        .apply_deposit(deposit(
            DepositSource::Webhook,
            tx,
            trade.amount,
            &trade.escrow_id.to_string(),
        ))
        .await
        .unwrap();
}

// ============================================================================
// Settlement path
// ============================================================================

#[tokio::test]
async fn test_happy_path_settlement_with_fee_conservation() {
    let db = setup();
    let buyer = insert_user(&db.pool, "hp_buyer");
    let seller = insert_user(&db.pool, "hp_seller");
    // 100 units principal; default schedule: 0.5%, min fee 10_000
    let trade = insert_trade(&db.pool, &buyer, &seller, 100_000_000);
    let (sm, reconciler, _, _) = services(&db.pool);

    fund(&reconciler, &trade, "tx-hp-1").await;
    assert_eq!(reload_trade(&db.pool, &trade.id).status, "funded");

    let outcome = sm.mark_fiat_sent(&trade.id, &buyer.id).await.unwrap();
    assert_eq!(outcome.trade().status, "active");

    let outcome = sm.confirm_fiat_received(&trade.id, &seller.id).await.unwrap();
    let completed = outcome.trade();
    assert_eq!(completed.status, "completed");
    assert!(completed.completed_at.is_some());

    // Conservation: fee + net = principal, fee >= configured minimum.
    let fee = completed.fee_amount.unwrap();
    let net = completed.net_amount.unwrap();
    assert_eq!(fee + net, completed.amount);
    assert_eq!(fee, 500_000); // 0.5% of 100 units
    assert!(fee >= 10_000);

    // Both participants picked up a completed trade.
    assert_eq!(reload_user(&db.pool, &buyer.id).completed_trades, 1);
    assert_eq!(reload_user(&db.pool, &seller.id).completed_trades, 1);

    // Transition log is gapless and ordered.
    let mut conn = db.pool.get().unwrap();
    let history = TradeTransition::history(&mut conn, &trade.id).unwrap();
    let seqs: Vec<i64> = history.iter().map(|t| t.seq).collect();
    assert_eq!(seqs, (1..=seqs.len() as i64).collect::<Vec<_>>());
    assert_eq!(history.last().unwrap().to_status, "completed");
}

#[tokio::test]
async fn test_fee_uses_seller_volume_tier() {
    let db = setup();
    let buyer = insert_user(&db.pool, "vt_buyer");
    let seller = insert_user(&db.pool, "vt_seller");
    let audit = AuditService::new(db.pool.clone());
    let fee_config = FeeConfig::new(
        50,
        0,
        None,
        vec![VolumeTier { min_volume: 50_000_000, bps: 10 }],
    );
    let sm = EscrowStateMachine::new(db.pool.clone(), fee_config, audit.clone());
    let reconciler = ReconciliationCoordinator::new(db.pool.clone(), audit);

    // First settlement builds the seller's trailing volume at the base rate.
    let first = insert_trade(&db.pool, &buyer, &seller, 60_000_000);
    fund(&reconciler, &first, "tx-vt-1").await;
    sm.mark_fiat_sent(&first.id, &buyer.id).await.unwrap();
    sm.confirm_fiat_received(&first.id, &seller.id).await.unwrap();
    assert_eq!(reload_trade(&db.pool, &first.id).fee_bps, Some(50));

    // Second settlement sees 60 units of trailing volume and hits the tier.
    let second = insert_trade(&db.pool, &buyer, &seller, 10_000_000);
    fund(&reconciler, &second, "tx-vt-2").await;
    sm.mark_fiat_sent(&second.id, &buyer.id).await.unwrap();
    sm.confirm_fiat_received(&second.id, &seller.id).await.unwrap();
    assert_eq!(reload_trade(&db.pool, &second.id).fee_bps, Some(10));
}

#[tokio::test]
async fn test_confirm_replay_is_noop_and_fee_charged_once() {
    let db = setup();
    let buyer = insert_user(&db.pool, "rp_buyer");
    let seller = insert_user(&db.pool, "rp_seller");
    let trade = insert_trade(&db.pool, &buyer, &seller, 100_000_000);
    let (sm, reconciler, _, _) = services(&db.pool);

    fund(&reconciler, &trade, "tx-rp-1").await;
    sm.mark_fiat_sent(&trade.id, &buyer.id).await.unwrap();

    let first = sm.confirm_fiat_received(&trade.id, &seller.id).await.unwrap();
    assert!(matches!(first, TransitionOutcome::Applied(_)));
    let fee_after_first = first.trade().fee_amount;

    let second = sm.confirm_fiat_received(&trade.id, &seller.id).await.unwrap();
    assert!(matches!(second, TransitionOutcome::Noop(_)));
    assert_eq!(second.trade().fee_amount, fee_after_first);

    // The replay did not double the counters either.
    assert_eq!(reload_user(&db.pool, &seller.id).completed_trades, 1);
}

#[tokio::test]
async fn test_participant_gating() {
    let db = setup();
    let buyer = insert_user(&db.pool, "pg_buyer");
    let seller = insert_user(&db.pool, "pg_seller");
    let stranger = insert_user(&db.pool, "pg_stranger");
    let trade = insert_trade(&db.pool, &buyer, &seller, 100_000_000);
    let (sm, reconciler, _, _) = services(&db.pool);

    fund(&reconciler, &trade, "tx-pg-1").await;

    // Seller cannot declare the buyer's fiat sent.
    let result = sm.mark_fiat_sent(&trade.id, &seller.id).await;
    assert!(matches!(
        result,
        Err(TransitionError::WrongParticipant { .. })
    ));

    // A stranger cannot act at all.
    let result = sm.mark_fiat_sent(&trade.id, &stranger.id).await;
    assert!(matches!(result, Err(TransitionError::NotAParticipant { .. })));

    // No mutation happened.
    assert_eq!(reload_trade(&db.pool, &trade.id).status, "funded");
}

#[tokio::test]
async fn test_unknown_trade_rejected() {
    let db = setup();
    let (sm, _, _, _) = services(&db.pool);
    let result = sm.mark_fiat_sent("no-such-trade", "nobody").await;
    assert!(matches!(result, Err(TransitionError::TradeNotFound(_))));
}

// ============================================================================
// Cancellation and deadlines
// ============================================================================

#[tokio::test]
async fn test_cancel_only_before_funding() {
    let db = setup();
    let buyer = insert_user(&db.pool, "cx_buyer");
    let seller = insert_user(&db.pool, "cx_seller");
    let (sm, reconciler, _, _) = services(&db.pool);

    // Pre-funding cancel succeeds.
    let trade = insert_trade(&db.pool, &buyer, &seller, 100_000_000);
    let outcome = sm.cancel(&trade.id, &buyer.id).await.unwrap();
    assert_eq!(outcome.trade().status, "cancelled");

    // Post-funding cancel is rejected.
    let trade = insert_trade(&db.pool, &buyer, &seller, 100_000_000);
    fund(&reconciler, &trade, "tx-cx-1").await;
    let result = sm.cancel(&trade.id, &buyer.id).await;
    assert!(matches!(
        result,
        Err(TransitionError::InvalidTransition { .. })
    ));
    assert_eq!(reload_trade(&db.pool, &trade.id).status, "funded");
}

#[tokio::test]
async fn test_unfunded_trade_expires_lazily_on_access() {
    let db = setup();
    let buyer = insert_user(&db.pool, "ex_buyer");
    let seller = insert_user(&db.pool, "ex_seller");
    let now = Utc::now().naive_utc();
    let trade = insert_trade_with_deadlines(
        &db.pool,
        &buyer,
        &seller,
        100_000_000,
        now - Duration::minutes(5),
        now + Duration::hours(24),
    );
    let (sm, _, _, _) = services(&db.pool);

    let fresh = sm.load_fresh(&trade.id).await.unwrap();
    assert_eq!(fresh.status, "expired");
}

#[tokio::test]
async fn test_funded_trade_escalates_instead_of_expiring() {
    let db = setup();
    let buyer = insert_user(&db.pool, "es_buyer");
    let seller = insert_user(&db.pool, "es_seller");
    let now = Utc::now().naive_utc();
    let trade = insert_trade_with_deadlines(
        &db.pool,
        &buyer,
        &seller,
        100_000_000,
        now + Duration::hours(1),
        now - Duration::minutes(5),
    );
    let (sm, reconciler, _, _) = services(&db.pool);

    fund(&reconciler, &trade, "tx-es-1").await;

    let fresh = sm.load_fresh(&trade.id).await.unwrap();
    assert_eq!(fresh.status, "disputed");
    assert!(fresh.dispute_reason.is_some());
}

#[tokio::test]
async fn test_timeout_sweep_processes_overdue_trades() {
    let db = setup();
    let buyer = insert_user(&db.pool, "ts_buyer");
    let seller = insert_user(&db.pool, "ts_seller");
    let now = Utc::now().naive_utc();
    let stale = insert_trade_with_deadlines(
        &db.pool,
        &buyer,
        &seller,
        100_000_000,
        now - Duration::minutes(5),
        now + Duration::hours(24),
    );
    let healthy = insert_trade(&db.pool, &buyer, &seller, 100_000_000);

    let audit = AuditService::new(db.pool.clone());
    let monitor = TimeoutMonitor::new(
        db.pool.clone(),
        audit,
        server::config::TimeoutConfig::default(),
    );

    let stats = monitor.sweep_once().await.unwrap();
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.escalated, 0);

    assert_eq!(reload_trade(&db.pool, &stale.id).status, "expired");
    assert_eq!(reload_trade(&db.pool, &healthy.id).status, "pending_funding");
}

// ============================================================================
// Disputes
// ============================================================================

#[tokio::test]
async fn test_dispute_and_release_resolution() {
    let db = setup();
    let buyer = insert_user(&db.pool, "dr_buyer");
    let seller = insert_user(&db.pool, "dr_seller");
    let trade = insert_trade(&db.pool, &buyer, &seller, 100_000_000);
    let (sm, reconciler, _, _) = services(&db.pool);

    fund(&reconciler, &trade, "tx-dr-1").await;
    sm.mark_fiat_sent(&trade.id, &buyer.id).await.unwrap();
    sm.raise_dispute(&trade.id, &seller.id, "payment reference missing")
        .await
        .unwrap();
    assert_eq!(reload_trade(&db.pool, &trade.id).status, "disputed");

    let outcome = sm
        .resolve_dispute(&trade.id, Resolution::Release, "admin-1")
        .await
        .unwrap();
    let resolved = outcome.trade();
    assert_eq!(resolved.status, "resolved_release");
    assert_eq!(resolved.resolution.as_deref(), Some("release"));
    // Release carries the standard fee.
    let fee = resolved.fee_amount.unwrap();
    assert!(fee > 0);
    assert_eq!(fee + resolved.net_amount.unwrap(), resolved.amount);
}

#[tokio::test]
async fn test_refund_resolution_charges_no_fee() {
    let db = setup();
    let buyer = insert_user(&db.pool, "rf_buyer");
    let seller = insert_user(&db.pool, "rf_seller");
    let trade = insert_trade(&db.pool, &buyer, &seller, 100_000_000);
    let (sm, reconciler, _, _) = services(&db.pool);

    fund(&reconciler, &trade, "tx-rf-1").await;
    sm.mark_fiat_sent(&trade.id, &buyer.id).await.unwrap();
    sm.raise_dispute(&trade.id, &buyer.id, "seller unreachable")
        .await
        .unwrap();

    let outcome = sm
        .resolve_dispute(&trade.id, Resolution::Refund, "admin-1")
        .await
        .unwrap();
    let resolved = outcome.trade();
    assert_eq!(resolved.status, "resolved_refund");
    assert_eq!(resolved.fee_amount, Some(0));
    // The full escrow balance goes back to the depositor.
    assert_eq!(resolved.net_amount, Some(resolved.funded_amount));
}

#[tokio::test]
async fn test_dispute_requires_active_status() {
    let db = setup();
    let buyer = insert_user(&db.pool, "da_buyer");
    let seller = insert_user(&db.pool, "da_seller");
    let trade = insert_trade(&db.pool, &buyer, &seller, 100_000_000);
    let (sm, _, _, _) = services(&db.pool);

    // Still pending funding: no dispute yet.
    let result = sm.raise_dispute(&trade.id, &buyer.id, "cold feet").await;
    assert!(matches!(
        result,
        Err(TransitionError::InvalidTransition { .. })
    ));
}

// ============================================================================
// Reviews
// ============================================================================

#[tokio::test]
async fn test_review_flow_and_uniqueness() {
    let db = setup();
    let buyer = insert_user(&db.pool, "rv_buyer");
    let seller = insert_user(&db.pool, "rv_seller");
    let trade = insert_trade(&db.pool, &buyer, &seller, 100_000_000);
    let (sm, reconciler, _, ledger) = services(&db.pool);

    fund(&reconciler, &trade, "tx-rv-1").await;
    sm.mark_fiat_sent(&trade.id, &buyer.id).await.unwrap();
    sm.confirm_fiat_received(&trade.id, &seller.id).await.unwrap();

    let review = ledger
        .submit_review(&trade.id, &buyer.id, Vote::Up, Some("smooth trade".to_string()))
        .await
        .unwrap();
    assert_eq!(review.reviewee_id, seller.id);

    let seller_after = reload_user(&db.pool, &seller.id);
    assert_eq!(seller_after.upvotes, 1);
    assert_eq!(seller_after.downvotes, 0);

    // Second attempt by the same reviewer: rejected, counters untouched.
    let result = ledger
        .submit_review(&trade.id, &buyer.id, Vote::Down, None)
        .await;
    assert!(matches!(result, Err(ReviewError::DuplicateReview)));
    let seller_after = reload_user(&db.pool, &seller.id);
    assert_eq!(seller_after.upvotes, 1);
    assert_eq!(seller_after.downvotes, 0);

    // The counterparty reviews independently.
    ledger
        .submit_review(&trade.id, &seller.id, Vote::Up, None)
        .await
        .unwrap();
    assert_eq!(reload_user(&db.pool, &buyer.id).upvotes, 1);
}

#[tokio::test]
async fn test_review_preconditions() {
    let db = setup();
    let buyer = insert_user(&db.pool, "rp2_buyer");
    let seller = insert_user(&db.pool, "rp2_seller");
    let stranger = insert_user(&db.pool, "rp2_stranger");
    let trade = insert_trade(&db.pool, &buyer, &seller, 100_000_000);
    let (sm, reconciler, _, ledger) = services(&db.pool);

    // Not reviewable while live.
    let result = ledger.submit_review(&trade.id, &buyer.id, Vote::Up, None).await;
    assert!(matches!(result, Err(ReviewError::NotReviewable { .. })));

    fund(&reconciler, &trade, "tx-rp2-1").await;
    sm.mark_fiat_sent(&trade.id, &buyer.id).await.unwrap();
    sm.confirm_fiat_received(&trade.id, &seller.id).await.unwrap();

    // Non-participants cannot review.
    let result = ledger
        .submit_review(&trade.id, &stranger.id, Vote::Up, None)
        .await;
    assert!(matches!(result, Err(ReviewError::NotAParticipant { .. })));

    // Oversize comments are rejected before any write.
    let long_comment = "x".repeat(281);
    let result = ledger
        .submit_review(&trade.id, &buyer.id, Vote::Up, Some(long_comment))
        .await;
    assert!(matches!(result, Err(ReviewError::CommentTooLong)));

    // Unknown trade.
    let result = ledger
        .submit_review("no-such-trade", &buyer.id, Vote::Up, None)
        .await;
    assert!(matches!(result, Err(ReviewError::TradeNotFound(_))));
}

// ============================================================================
// Ban guard
// ============================================================================

#[tokio::test]
async fn test_expired_temporary_ban_self_heals_on_access() {
    let db = setup();
    let user = insert_user(&db.pool, "bg_lapsed");
    let (_, _, guard, _) = services(&db.pool);

    {
        let mut conn = db.pool.get().unwrap();
        User::set_ban(
            &mut conn,
            &user.id,
            "temporary",
            Some(Utc::now().naive_utc() - Duration::minutes(1)),
            "cooling off",
        )
        .unwrap();
    }

    // The very next access is allowed and the row is healed.
    assert!(guard.check_access(&user.id).await.is_allowed());

    let healed = reload_user(&db.pool, &user.id);
    assert!(!healed.is_banned);
    assert!(healed.ban_type.is_none());
    assert!(healed.ban_expires_at.is_none());
    assert!(healed.ban_reason.is_none());
}

#[tokio::test]
async fn test_active_bans_deny() {
    let db = setup();
    let temp = insert_user(&db.pool, "bg_temp");
    let perm = insert_user(&db.pool, "bg_perm");
    let (_, _, guard, _) = services(&db.pool);

    {
        let mut conn = db.pool.get().unwrap();
        User::set_ban(
            &mut conn,
            &temp.id,
            "temporary",
            Some(Utc::now().naive_utc() + Duration::hours(1)),
            "spam",
        )
        .unwrap();
        User::set_ban(&mut conn, &perm.id, "permanent", None, "fraud").unwrap();
    }

    assert!(!guard.check_access(&temp.id).await.is_allowed());
    assert!(!guard.check_access(&perm.id).await.is_allowed());

    // Denial does not clear anything.
    assert!(reload_user(&db.pool, &temp.id).is_banned);
    assert!(reload_user(&db.pool, &perm.id).is_banned);
}
