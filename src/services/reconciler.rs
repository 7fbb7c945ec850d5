//! Reconciliation coordinator
//!
//! Applies deposit events from both delivery paths (webhook push, poll
//! sweep) against pending escrows with two guarantees:
//!
//! 1. at-most-once application per transaction hash - the UNIQUE index on
//!    `deposit_events.tx_hash` is checked before correlation and enforced
//!    again inside the applying transaction, so a replay from either source
//!    acknowledges as success without touching the trade;
//! 2. at-most-one escrow mutation in flight per trade - an in-process keyed
//!    mutex serializes local writers, and the version-guarded conditional
//!    UPDATE serializes writers across instances sharing the store.
//!
//! No lock is ever held across a network call: callers hand this service
//! fully collected events.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use diesel::prelude::*;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{db_blocking, db_find_deposit_by_hash, DbPool};
use crate::models::audit_event::AuditEventBuilder;
use crate::models::deposit_event::{DepositEvent, NewDepositEvent};
use crate::models::trade::Trade;
use crate::services::audit::AuditService;
use crate::services::correlator::{correlate, CorrelationError, InboundDeposit};
use crate::services::state_machine::try_mark_funded;
use crate::{log_amount, log_trade_id, log_txid};

/// Bounded retries for optimistic-version collisions before surfacing a
/// transient failure.
const MAX_APPLY_ATTEMPTS: u32 = 3;

/// Outcome of feeding one deposit event through the coordinator.
#[derive(Debug)]
pub enum ApplyOutcome {
    /// The deposit was recorded and accumulated into the trade.
    Applied {
        trade: Trade,
        /// True when this deposit pushed the trade across the funding
        /// threshold.
        newly_funded: bool,
        /// Amount received beyond the principal by this deposit, if any.
        excess: i64,
    },
    /// The transaction hash was already applied; idempotent replay.
    AlreadyApplied,
    /// Correlation failed; the event was logged and dropped.
    Dropped(CorrelationError),
}

enum TxnError {
    /// Lost the optimistic race; re-read and retry.
    Conflict,
    Other(anyhow::Error),
}

impl From<diesel::result::Error> for TxnError {
    fn from(e: diesel::result::Error) -> Self {
        TxnError::Other(e.into())
    }
}

impl From<anyhow::Error> for TxnError {
    fn from(e: anyhow::Error) -> Self {
        TxnError::Other(e)
    }
}

pub struct ReconciliationCoordinator {
    pool: DbPool,
    audit: AuditService,
    /// Per-escrow serialization of local writers, keyed by escrow id.
    trade_locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl ReconciliationCoordinator {
    pub fn new(pool: DbPool, audit: AuditService) -> Self {
        Self {
            pool,
            audit,
            trade_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Apply one deposit event. Safe to call concurrently from the webhook
    /// handler and the poll sweep with overlapping transactions.
    pub async fn apply_deposit(&self, deposit: InboundDeposit) -> Result<ApplyOutcome> {
        // Fast-path dedup before any correlation work.
        if db_find_deposit_by_hash(&self.pool, &deposit.tx_hash)
            .await?
            .is_some()
        {
            debug!(
                tx = %log_txid!(&deposit.tx_hash),
                source = deposit.source.as_str(),
                "Deposit already applied, acknowledging replay"
            );
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        // Correlate to find the lock key. The result is advisory; the
        // applying transaction re-reads under the lock.
        let probe = deposit.clone();
        let correlation = db_blocking(&self.pool, move |conn| correlate(conn, &probe)).await?;

        let escrow_id = match correlation {
            Ok((escrow_id, _)) => escrow_id,
            Err(err) => {
                self.drop_event(&deposit, &err);
                return Ok(ApplyOutcome::Dropped(err));
            }
        };

        let lock = self.lock_for(escrow_id).await;
        let _guard = lock.lock().await;

        let outcome = self.apply_locked(&deposit).await?;

        match &outcome {
            ApplyOutcome::Applied {
                trade,
                newly_funded,
                excess,
            } => {
                info!(
                    tx = %log_txid!(&deposit.tx_hash),
                    trade_id = %log_trade_id!(&trade.id),
                    amount = %log_amount!(deposit.amount),
                    source = deposit.source.as_str(),
                    newly_funded,
                    "Deposit applied"
                );
                self.audit.log_async(
                    AuditEventBuilder::new("deposit.applied")
                        .resource("trade", trade.id.clone())
                        .metadata("tx", log_txid!(&deposit.tx_hash))
                        .metadata("source", deposit.source.as_str())
                        .metadata("funded_amount", trade.funded_amount),
                );
                if *newly_funded {
                    self.audit.log_async(
                        AuditEventBuilder::new("trade.funded")
                            .resource("trade", trade.id.clone())
                            .metadata("funded_amount", trade.funded_amount),
                    );
                }
                if *excess > 0 {
                    // Overage is never discarded: flag it for manual review.
                    warn!(
                        trade_id = %log_trade_id!(&trade.id),
                        excess = *excess,
                        "Deposit exceeds outstanding amount, flagged for review"
                    );
                    self.audit.log_async(
                        AuditEventBuilder::new("deposit.overfunded")
                            .resource("trade", trade.id.clone())
                            .metadata("excess", *excess)
                            .metadata("tx", log_txid!(&deposit.tx_hash)),
                    );
                }
            }
            ApplyOutcome::AlreadyApplied => {
                debug!(
                    tx = %log_txid!(&deposit.tx_hash),
                    "Deposit claimed by a concurrent delivery"
                );
            }
            ApplyOutcome::Dropped(err) => self.drop_event(&deposit, err),
        }

        Ok(outcome)
    }

    /// The serialized section: insert the dedup row and accumulate the
    /// amount in one transaction, retrying on version conflicts.
    async fn apply_locked(&self, deposit: &InboundDeposit) -> Result<ApplyOutcome> {
        for attempt in 1..=MAX_APPLY_ATTEMPTS {
            let event = deposit.clone();
            let result = db_blocking(&self.pool, move |conn| {
                Ok(apply_deposit_txn(conn, &event))
            })
            .await?;

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(TxnError::Conflict) => {
                    warn!(
                        tx = %log_txid!(&deposit.tx_hash),
                        attempt,
                        "Optimistic conflict applying deposit, retrying"
                    );
                }
                Err(TxnError::Other(e)) => return Err(e),
            }
        }

        Err(anyhow::anyhow!(
            "Deposit application for tx {} kept conflicting after {} attempts",
            deposit.tx_hash,
            MAX_APPLY_ATTEMPTS
        ))
    }

    async fn lock_for(&self, escrow_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.trade_locks.lock().await;
        locks
            .entry(escrow_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn drop_event(&self, deposit: &InboundDeposit, err: &CorrelationError) {
        // Chain data is untrusted and noisy: log, audit, move on.
        warn!(
            tx = %log_txid!(&deposit.tx_hash),
            source = deposit.source.as_str(),
            error = %err,
            "Deposit event dropped"
        );
        self.audit.log_async(
            AuditEventBuilder::new("deposit.dropped")
                .resource("deposit", log_txid!(&deposit.tx_hash))
                .metadata("reason", err.to_string())
                .metadata("source", deposit.source.as_str()),
        );
    }
}

/// One attempt at the apply transaction. Runs with an immediate write lock;
/// a conflict on the version predicate rolls the whole attempt back so the
/// dedup row never lands without its accumulation.
fn apply_deposit_txn(
    conn: &mut SqliteConnection,
    deposit: &InboundDeposit,
) -> Result<ApplyOutcome, TxnError> {
    conn.immediate_transaction::<_, TxnError, _>(|conn| {
        let (escrow_id, trade) = match correlate(conn, deposit).map_err(TxnError::Other)? {
            Ok(found) => found,
            Err(err) => return Ok(ApplyOutcome::Dropped(err)),
        };

        let now = chrono::Utc::now().naive_utc();
        let row = NewDepositEvent {
            id: Uuid::new_v4().to_string(),
            tx_hash: deposit.tx_hash.clone(),
            trade_id: trade.id.clone(),
            escrow_id,
            source: deposit.source.as_str().to_string(),
            sender_address: deposit.sender_address.clone(),
            amount: deposit.amount,
            memo: deposit.memo.clone(),
            observed_at: deposit.observed_at,
            applied_at: now,
        };

        if !DepositEvent::insert_new(conn, &row).map_err(TxnError::Other)? {
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let funded_before = trade.funded_amount;
        let funded_after = funded_before + deposit.amount;
        let excess =
            (funded_after - trade.amount).max(0) - (funded_before - trade.amount).max(0);

        let updated = Trade::accumulate_deposit(
            conn,
            &trade.id,
            trade.version,
            deposit.amount,
            excess,
        )
        .map_err(TxnError::Other)?;

        if updated == 0 {
            // Another writer advanced the version between our read and this
            // write; roll back (including the dedup row) and retry.
            return Err(TxnError::Conflict);
        }

        // Threshold re-check at transition time, on the accumulated value.
        let flipped = try_mark_funded(conn, &trade.id).map_err(TxnError::Other)?;
        let newly_funded = flipped.is_some();

        let fresh = match flipped {
            Some(t) => t,
            None => Trade::find_by_id(conn, &trade.id).map_err(TxnError::Other)?,
        };

        Ok(ApplyOutcome::Applied {
            trade: fresh,
            newly_funded,
            excess,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excess_delta_only_counts_overage() {
        // trade amount 100: 60 then 50 -> second deposit carries 10 excess
        let amount = 100_i64;
        let step = |before: i64, deposit: i64| {
            let after = before + deposit;
            (after - amount).max(0) - (before - amount).max(0)
        };
        assert_eq!(step(0, 60), 0);
        assert_eq!(step(60, 50), 10);
        // a third, fully excess deposit is all overage
        assert_eq!(step(110, 25), 25);
    }
}
