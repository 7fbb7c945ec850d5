//! Escrow trade state machine
//!
//! The single authority over `trades.status` and the settlement fee fields.
//! Every transition is a guarded conditional UPDATE (status predicate plus
//! affected-row check) inside an immediate transaction, paired with a
//! `trade_transitions` row carrying the next per-trade sequence number.
//!
//! Replays are idempotent: re-applying an event whose target status already
//! holds returns `Noop` with the fresh row instead of an error.

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::FeeConfig;
use crate::db::{db_blocking, DbPool};
use crate::log_trade_id;
use crate::models::trade::Trade;
use crate::models::trade_transition::TradeTransition;
use crate::models::user::User;
use crate::schema::trades;
use crate::services::audit::AuditService;
use crate::services::fees::{compute_fee, FeeBreakdown};

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    PendingFunding,
    Funded,
    Active,
    Disputed,
    Completed,
    ResolvedRelease,
    ResolvedRefund,
    Expired,
    Cancelled,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::PendingFunding => "pending_funding",
            TradeStatus::Funded => "funded",
            TradeStatus::Active => "active",
            TradeStatus::Disputed => "disputed",
            TradeStatus::Completed => "completed",
            TradeStatus::ResolvedRelease => "resolved_release",
            TradeStatus::ResolvedRefund => "resolved_refund",
            TradeStatus::Expired => "expired",
            TradeStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_funding" => Some(TradeStatus::PendingFunding),
            "funded" => Some(TradeStatus::Funded),
            "active" => Some(TradeStatus::Active),
            "disputed" => Some(TradeStatus::Disputed),
            "completed" => Some(TradeStatus::Completed),
            "resolved_release" => Some(TradeStatus::ResolvedRelease),
            "resolved_refund" => Some(TradeStatus::ResolvedRefund),
            "expired" => Some(TradeStatus::Expired),
            "cancelled" => Some(TradeStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::Completed
                | TradeStatus::ResolvedRelease
                | TradeStatus::ResolvedRefund
                | TradeStatus::Expired
                | TradeStatus::Cancelled
        )
    }

    /// Only settled terminals accept post-trade reviews.
    pub fn is_reviewable(&self) -> bool {
        matches!(
            self,
            TradeStatus::Completed | TradeStatus::ResolvedRelease | TradeStatus::ResolvedRefund
        )
    }
}

/// Dispute resolution decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Release,
    Refund,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Release => "release",
            Resolution::Refund => "refund",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "release" => Some(Resolution::Release),
            "refund" => Some(Resolution::Refund),
            _ => None,
        }
    }
}

// Event names recorded in the transition log
pub const EVENT_DEPOSIT_MATCHED: &str = "deposit_matched";
pub const EVENT_FIAT_SENT: &str = "fiat_sent";
pub const EVENT_FIAT_CONFIRMED: &str = "fiat_confirmed";
pub const EVENT_DISPUTE_RAISED: &str = "dispute_raised";
pub const EVENT_DISPUTE_RESOLVED: &str = "dispute_resolved";
pub const EVENT_FUNDING_EXPIRED: &str = "funding_expired";
pub const EVENT_DEADLINE_ESCALATED: &str = "deadline_escalated";
pub const EVENT_CANCELLED: &str = "cancelled";

// ============================================================================
// Errors and outcomes
// ============================================================================

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("trade {0} not found")]
    TradeNotFound(String),
    #[error("user {user_id} is not a participant of trade {trade_id}")]
    NotAParticipant { trade_id: String, user_id: String },
    #[error("user {user_id} may not perform {event} on trade {trade_id}")]
    WrongParticipant {
        trade_id: String,
        user_id: String,
        event: &'static str,
    },
    #[error("trade {trade_id} in status {status} does not accept {event}")]
    InvalidTransition {
        trade_id: String,
        status: String,
        event: &'static str,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Result of an accepted transition request
#[derive(Debug)]
pub enum TransitionOutcome {
    /// The status changed in this call
    Applied(Trade),
    /// The trade already held the target status (idempotent replay)
    Noop(Trade),
}

impl TransitionOutcome {
    pub fn trade(&self) -> &Trade {
        match self {
            TransitionOutcome::Applied(t) | TransitionOutcome::Noop(t) => t,
        }
    }
}

// ============================================================================
// Service
// ============================================================================

/// Drives trade lifecycle transitions.
pub struct EscrowStateMachine {
    pool: DbPool,
    fee_config: FeeConfig,
    audit: AuditService,
}

impl EscrowStateMachine {
    pub fn new(pool: DbPool, fee_config: FeeConfig, audit: AuditService) -> Self {
        Self {
            pool,
            fee_config,
            audit,
        }
    }

    /// Load a trade and lazily apply any deadline transition it is due for.
    ///
    /// This is the access path mandated by the lifecycle rules: deadlines
    /// take effect the moment a trade is touched, scheduler or not.
    pub async fn load_fresh(&self, trade_id: &str) -> Result<Trade, TransitionError> {
        let id = trade_id.to_string();
        let outcome = db_blocking(&self.pool, move |conn| {
            conn.immediate_transaction(|conn| {
                let Some(trade) = Trade::find_by_id_opt(conn, &id)? else {
                    return Ok(None);
                };
                Ok(Some(reconcile_deadlines(conn, trade, Utc::now().naive_utc())?))
            })
        })
        .await?;

        match outcome {
            Some((trade, transitioned)) => {
                if let Some(event) = transitioned {
                    self.log_transition(&trade, event, None);
                }
                Ok(trade)
            }
            None => Err(TransitionError::TradeNotFound(trade_id.to_string())),
        }
    }

    /// Buyer declares the fiat payment sent: FUNDED -> ACTIVE.
    pub async fn mark_fiat_sent(
        &self,
        trade_id: &str,
        user_id: &str,
    ) -> Result<TransitionOutcome, TransitionError> {
        let id = trade_id.to_string();
        let actor = user_id.to_string();
        let outcome = db_blocking(&self.pool, move |conn| {
            conn.immediate_transaction(|conn| {
                let trade = load_live(conn, &id)?;
                let Some(trade) = trade else {
                    return Ok(Err(TransitionError::TradeNotFound(id.clone())));
                };
                if trade.buyer_id != actor {
                    return Ok(Err(if trade.is_participant(&actor) {
                        TransitionError::WrongParticipant {
                            trade_id: id.clone(),
                            user_id: actor.clone(),
                            event: EVENT_FIAT_SENT,
                        }
                    } else {
                        TransitionError::NotAParticipant {
                            trade_id: id.clone(),
                            user_id: actor.clone(),
                        }
                    }));
                }
                guarded_status_update(
                    conn,
                    &trade,
                    TradeStatus::Funded,
                    TradeStatus::Active,
                    EVENT_FIAT_SENT,
                    Some(&actor),
                )
            })
        })
        .await??;

        self.report(&outcome, EVENT_FIAT_SENT, Some(user_id));
        Ok(outcome)
    }

    /// Seller confirms the fiat arrived: ACTIVE -> COMPLETED.
    ///
    /// The settlement fee is computed and recorded exactly once, inside the
    /// same conditional write that flips the status.
    pub async fn confirm_fiat_received(
        &self,
        trade_id: &str,
        user_id: &str,
    ) -> Result<TransitionOutcome, TransitionError> {
        let id = trade_id.to_string();
        let actor = user_id.to_string();
        let fee_config = self.fee_config.clone();
        let outcome = db_blocking(&self.pool, move |conn| {
            conn.immediate_transaction(|conn| {
                let Some(trade) = load_live(conn, &id)? else {
                    return Ok(Err(TransitionError::TradeNotFound(id.clone())));
                };
                if trade.seller_id != actor {
                    return Ok(Err(if trade.is_participant(&actor) {
                        TransitionError::WrongParticipant {
                            trade_id: id.clone(),
                            user_id: actor.clone(),
                            event: EVENT_FIAT_CONFIRMED,
                        }
                    } else {
                        TransitionError::NotAParticipant {
                            trade_id: id.clone(),
                            user_id: actor.clone(),
                        }
                    }));
                }
                complete_with_fee(conn, &trade, &fee_config, Some(&actor))
            })
        })
        .await??;

        self.report(&outcome, EVENT_FIAT_CONFIRMED, Some(user_id));
        Ok(outcome)
    }

    /// Either participant raises a dispute: ACTIVE -> DISPUTED.
    pub async fn raise_dispute(
        &self,
        trade_id: &str,
        user_id: &str,
        reason: &str,
    ) -> Result<TransitionOutcome, TransitionError> {
        let id = trade_id.to_string();
        let actor = user_id.to_string();
        let reason = reason.to_string();
        let outcome = db_blocking(&self.pool, move |conn| {
            conn.immediate_transaction(|conn| {
                let Some(trade) = load_live(conn, &id)? else {
                    return Ok(Err(TransitionError::TradeNotFound(id.clone())));
                };
                if !trade.is_participant(&actor) {
                    return Ok(Err(TransitionError::NotAParticipant {
                        trade_id: id.clone(),
                        user_id: actor.clone(),
                    }));
                }
                let now = Utc::now().naive_utc();
                let updated = diesel::update(
                    trades::table
                        .filter(trades::id.eq(&trade.id))
                        .filter(trades::status.eq(TradeStatus::Active.as_str())),
                )
                .set((
                    trades::status.eq(TradeStatus::Disputed.as_str()),
                    trades::dispute_reason.eq(Some(reason.as_str())),
                    trades::updated_at.eq(now),
                ))
                .execute(conn)
                .context("Failed to mark trade disputed")?;

                finish_transition(
                    conn,
                    &trade,
                    updated,
                    TradeStatus::Active,
                    TradeStatus::Disputed,
                    EVENT_DISPUTE_RAISED,
                    Some(&actor),
                )
            })
        })
        .await??;

        self.report(&outcome, EVENT_DISPUTE_RAISED, Some(user_id));
        Ok(outcome)
    }

    /// Admin resolution of a dispute: DISPUTED -> RESOLVED_RELEASE | RESOLVED_REFUND.
    ///
    /// Release charges the standard settlement fee; refund returns the full
    /// escrow to the depositor with no fee.
    pub async fn resolve_dispute(
        &self,
        trade_id: &str,
        decision: Resolution,
        admin_id: &str,
    ) -> Result<TransitionOutcome, TransitionError> {
        let id = trade_id.to_string();
        let actor = admin_id.to_string();
        let fee_config = self.fee_config.clone();
        let outcome = db_blocking(&self.pool, move |conn| {
            conn.immediate_transaction(|conn| {
                let Some(trade) = load_live(conn, &id)? else {
                    return Ok(Err(TransitionError::TradeNotFound(id.clone())));
                };
                resolve_with_policy(conn, &trade, decision, &fee_config, &actor)
            })
        })
        .await??;

        self.report(&outcome, EVENT_DISPUTE_RESOLVED, Some(admin_id));
        Ok(outcome)
    }

    /// Explicit cancellation; only permitted before the escrow is funded.
    pub async fn cancel(
        &self,
        trade_id: &str,
        user_id: &str,
    ) -> Result<TransitionOutcome, TransitionError> {
        let id = trade_id.to_string();
        let actor = user_id.to_string();
        let outcome = db_blocking(&self.pool, move |conn| {
            conn.immediate_transaction(|conn| {
                let Some(trade) = load_live(conn, &id)? else {
                    return Ok(Err(TransitionError::TradeNotFound(id.clone())));
                };
                if !trade.is_participant(&actor) {
                    return Ok(Err(TransitionError::NotAParticipant {
                        trade_id: id.clone(),
                        user_id: actor.clone(),
                    }));
                }
                guarded_status_update(
                    conn,
                    &trade,
                    TradeStatus::PendingFunding,
                    TradeStatus::Cancelled,
                    EVENT_CANCELLED,
                    Some(&actor),
                )
            })
        })
        .await??;

        self.report(&outcome, EVENT_CANCELLED, Some(user_id));
        Ok(outcome)
    }

    fn report(&self, outcome: &TransitionOutcome, event: &str, actor: Option<&str>) {
        if let TransitionOutcome::Applied(trade) = outcome {
            self.log_transition(trade, event, actor);
        }
    }

    fn log_transition(&self, trade: &Trade, event: &str, actor: Option<&str>) {
        info!(
            trade_id = %log_trade_id!(&trade.id),
            status = %trade.status,
            event,
            "Trade transition applied"
        );
        let mut builder = crate::models::audit_event::AuditEventBuilder::new(format!(
            "trade.{}",
            event
        ))
        .resource("trade", trade.id.clone())
        .metadata("status", trade.status.clone());
        if let Some(actor) = actor {
            builder = builder.actor(actor);
        }
        self.audit.log_async(builder);
    }
}

// ============================================================================
// Connection-level transition primitives
//
// The reconciliation coordinator and the deadline sweep share these so every
// status write goes through the same guarded path, whatever triggered it.
// ============================================================================

fn load_live(conn: &mut SqliteConnection, trade_id: &str) -> Result<Option<Trade>> {
    let Some(trade) = Trade::find_by_id_opt(conn, trade_id)? else {
        return Ok(None);
    };
    let (trade, _) = reconcile_deadlines(conn, trade, Utc::now().naive_utc())?;
    Ok(Some(trade))
}

/// Apply a lazy deadline transition if one is due. Returns the (possibly
/// updated) trade and the event that fired, if any.
pub fn reconcile_deadlines(
    conn: &mut SqliteConnection,
    trade: Trade,
    now: NaiveDateTime,
) -> Result<(Trade, Option<&'static str>)> {
    let Some(status) = TradeStatus::parse(&trade.status) else {
        anyhow::bail!("Trade {} has unknown status {}", trade.id, trade.status);
    };

    match status {
        TradeStatus::PendingFunding if trade.funding_deadline_passed(now) => {
            // No or partial deposit by the deadline: the escrow expires.
            let updated = diesel::update(
                trades::table
                    .filter(trades::id.eq(&trade.id))
                    .filter(trades::status.eq(TradeStatus::PendingFunding.as_str())),
            )
            .set((
                trades::status.eq(TradeStatus::Expired.as_str()),
                trades::updated_at.eq(now),
            ))
            .execute(conn)
            .context("Failed to expire trade")?;

            if updated == 1 {
                TradeTransition::record(
                    conn,
                    &trade.id,
                    TradeStatus::PendingFunding.as_str(),
                    TradeStatus::Expired.as_str(),
                    EVENT_FUNDING_EXPIRED,
                    None,
                )?;
                let trade = Trade::find_by_id(conn, &trade.id)?;
                return Ok((trade, Some(EVENT_FUNDING_EXPIRED)));
            }
            Ok((Trade::find_by_id(conn, &trade.id)?, None))
        }
        TradeStatus::Funded | TradeStatus::Active if trade.trade_deadline_passed(now) => {
            // A funded escrow never silently expires: escalate to dispute
            // so an operator routes the funds.
            let updated = diesel::update(
                trades::table
                    .filter(trades::id.eq(&trade.id))
                    .filter(trades::status.eq(status.as_str())),
            )
            .set((
                trades::status.eq(TradeStatus::Disputed.as_str()),
                trades::dispute_reason
                    .eq(Some("trade deadline elapsed without settlement")),
                trades::updated_at.eq(now),
            ))
            .execute(conn)
            .context("Failed to escalate trade past deadline")?;

            if updated == 1 {
                TradeTransition::record(
                    conn,
                    &trade.id,
                    status.as_str(),
                    TradeStatus::Disputed.as_str(),
                    EVENT_DEADLINE_ESCALATED,
                    None,
                )?;
                warn!(
                    trade_id = %log_trade_id!(&trade.id),
                    "Funded trade escalated to dispute after deadline"
                );
                let trade = Trade::find_by_id(conn, &trade.id)?;
                return Ok((trade, Some(EVENT_DEADLINE_ESCALATED)));
            }
            Ok((Trade::find_by_id(conn, &trade.id)?, None))
        }
        _ => Ok((trade, None)),
    }
}

/// Mark a trade FUNDED once its cumulative funded amount covers the
/// principal. Called by the reconciliation coordinator inside its deposit
/// transaction; the cumulative re-check happens here, at transition time,
/// not at event arrival.
pub fn try_mark_funded(
    conn: &mut SqliteConnection,
    trade_id: &str,
) -> Result<Option<Trade>> {
    let now = Utc::now().naive_utc();
    let updated = diesel::update(
        trades::table
            .filter(trades::id.eq(trade_id))
            .filter(trades::status.eq(TradeStatus::PendingFunding.as_str()))
            .filter(trades::funded_amount.ge(trades::amount)),
    )
    .set((
        trades::status.eq(TradeStatus::Funded.as_str()),
        trades::updated_at.eq(now),
    ))
    .execute(conn)
    .context("Failed to mark trade funded")?;

    if updated == 1 {
        TradeTransition::record(
            conn,
            trade_id,
            TradeStatus::PendingFunding.as_str(),
            TradeStatus::Funded.as_str(),
            EVENT_DEPOSIT_MATCHED,
            None,
        )?;
        return Ok(Some(Trade::find_by_id(conn, trade_id)?));
    }
    Ok(None)
}

/// Simple from->to transition with no extra columns.
fn guarded_status_update(
    conn: &mut SqliteConnection,
    trade: &Trade,
    from: TradeStatus,
    to: TradeStatus,
    event: &'static str,
    actor: Option<&str>,
) -> Result<Result<TransitionOutcome, TransitionError>> {
    let now = Utc::now().naive_utc();
    let updated = diesel::update(
        trades::table
            .filter(trades::id.eq(&trade.id))
            .filter(trades::status.eq(from.as_str())),
    )
    .set((
        trades::status.eq(to.as_str()),
        trades::updated_at.eq(now),
    ))
    .execute(conn)
    .context(format!("Failed to apply {} to trade {}", event, trade.id))?;

    finish_transition(conn, trade, updated, from, to, event, actor)
}

/// Shared tail: record the transition row on success, classify replay vs
/// rejection on a zero-row update.
fn finish_transition(
    conn: &mut SqliteConnection,
    trade: &Trade,
    updated_rows: usize,
    from: TradeStatus,
    to: TradeStatus,
    event: &'static str,
    actor: Option<&str>,
) -> Result<Result<TransitionOutcome, TransitionError>> {
    if updated_rows == 1 {
        TradeTransition::record(conn, &trade.id, from.as_str(), to.as_str(), event, actor)?;
        let fresh = Trade::find_by_id(conn, &trade.id)?;
        return Ok(Ok(TransitionOutcome::Applied(fresh)));
    }

    let fresh = Trade::find_by_id(conn, &trade.id)?;
    if fresh.status == to.as_str() {
        // Same event delivered twice; the first application won.
        return Ok(Ok(TransitionOutcome::Noop(fresh)));
    }
    Ok(Err(TransitionError::InvalidTransition {
        trade_id: trade.id.clone(),
        status: fresh.status,
        event,
    }))
}

/// ACTIVE -> COMPLETED with the fee recorded in the same write.
fn complete_with_fee(
    conn: &mut SqliteConnection,
    trade: &Trade,
    fee_config: &FeeConfig,
    actor: Option<&str>,
) -> Result<Result<TransitionOutcome, TransitionError>> {
    let now = Utc::now().naive_utc();
    let volume = trailing_monthly_volume(conn, &trade.seller_id, now)?;
    let breakdown = compute_fee(trade.amount, Some(volume), fee_config, now)
        .map_err(|e| anyhow::anyhow!("Fee computation rejected trade amount: {}", e))?;

    if breakdown.net_amount < 0 {
        warn!(
            trade_id = %log_trade_id!(&trade.id),
            fee = breakdown.fee_amount,
            "Configured minimum fee exceeds trade amount"
        );
    }

    let updated = diesel::update(
        trades::table
            .filter(trades::id.eq(&trade.id))
            .filter(trades::status.eq(TradeStatus::Active.as_str()))
            .filter(trades::fee_amount.is_null()),
    )
    .set((
        trades::status.eq(TradeStatus::Completed.as_str()),
        trades::fee_bps.eq(Some(breakdown.fee_bps)),
        trades::fee_amount.eq(Some(breakdown.fee_amount)),
        trades::net_amount.eq(Some(breakdown.net_amount)),
        trades::completed_at.eq(Some(now)),
        trades::updated_at.eq(now),
    ))
    .execute(conn)
    .context("Failed to complete trade")?;

    if updated == 1 {
        User::increment_completed_trades(conn, &trade.buyer_id)?;
        User::increment_completed_trades(conn, &trade.seller_id)?;
    }

    finish_transition(
        conn,
        trade,
        updated,
        TradeStatus::Active,
        TradeStatus::Completed,
        EVENT_FIAT_CONFIRMED,
        actor,
    )
}

/// DISPUTED -> RESOLVED_* with the policy fee treatment.
fn resolve_with_policy(
    conn: &mut SqliteConnection,
    trade: &Trade,
    decision: Resolution,
    fee_config: &FeeConfig,
    admin_id: &str,
) -> Result<Result<TransitionOutcome, TransitionError>> {
    let now = Utc::now().naive_utc();
    let (to, breakdown) = match decision {
        Resolution::Release => {
            let volume = trailing_monthly_volume(conn, &trade.seller_id, now)?;
            let breakdown = compute_fee(trade.amount, Some(volume), fee_config, now)
                .map_err(|e| anyhow::anyhow!("Fee computation rejected trade amount: {}", e))?;
            (TradeStatus::ResolvedRelease, breakdown)
        }
        Resolution::Refund => (
            TradeStatus::ResolvedRefund,
            FeeBreakdown {
                fee_bps: 0,
                fee_amount: 0,
                net_amount: trade.funded_amount,
            },
        ),
    };

    let updated = diesel::update(
        trades::table
            .filter(trades::id.eq(&trade.id))
            .filter(trades::status.eq(TradeStatus::Disputed.as_str()))
            .filter(trades::fee_amount.is_null()),
    )
    .set((
        trades::status.eq(to.as_str()),
        trades::resolution.eq(Some(decision.as_str())),
        trades::fee_bps.eq(Some(breakdown.fee_bps)),
        trades::fee_amount.eq(Some(breakdown.fee_amount)),
        trades::net_amount.eq(Some(breakdown.net_amount)),
        trades::completed_at.eq(Some(now)),
        trades::updated_at.eq(now),
    ))
    .execute(conn)
    .context("Failed to resolve dispute")?;

    finish_transition(
        conn,
        trade,
        updated,
        TradeStatus::Disputed,
        to,
        EVENT_DISPUTE_RESOLVED,
        Some(admin_id),
    )
}

/// Sum of a seller's settled principal over the trailing 30 days, used for
/// the volume-discount tier lookup at settlement time.
fn trailing_monthly_volume(
    conn: &mut SqliteConnection,
    seller_id: &str,
    now: NaiveDateTime,
) -> Result<i64> {
    use diesel::dsl::sql;
    use diesel::sql_types::{BigInt, Nullable};
    let window_start = now - chrono::Duration::days(30);
    let total: Option<i64> = trades::table
        .filter(trades::seller_id.eq(seller_id))
        .filter(trades::status.eq_any(["completed", "resolved_release"]))
        .filter(trades::completed_at.ge(window_start))
        .select(sql::<Nullable<BigInt>>("SUM(amount)"))
        .first(conn)
        .context("Failed to compute trailing monthly volume")?;
    Ok(total.unwrap_or(0))
}
