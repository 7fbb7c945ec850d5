//! Deposit correlator
//!
//! Resolves an inbound chain event to the pending escrow it funds. The memo
//! is the sole correlation key and is treated as untrusted input with a
//! narrow grammar: ASCII digits only, non-empty, fits in i64. Anything else
//! is rejected with a typed error, logged and dropped upstream.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::trade::Trade;
use crate::services::state_machine::TradeStatus;

/// Delivery path of a deposit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositSource {
    Webhook,
    Poll,
}

impl DepositSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositSource::Webhook => "webhook",
            DepositSource::Poll => "poll",
        }
    }
}

/// A normalized on-chain transfer, regardless of delivery path.
#[derive(Debug, Clone)]
pub struct InboundDeposit {
    pub source: DepositSource,
    pub tx_hash: String,
    pub sender_address: String,
    pub amount: i64,
    pub memo: String,
    pub observed_at: NaiveDateTime,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("memo does not parse as a non-negative integer escrow id")]
    UnparsableMemo,
    #[error("no pending escrow with id {0}")]
    NoSuchEscrow(i64),
    #[error("escrow {0} is no longer accepting deposits")]
    EscrowNotFundable(i64),
    #[error("deposit amount must be positive, got {0}")]
    NonPositiveAmount(i64),
}

/// Parse the memo under the strict escrow-id grammar.
///
/// Leading/trailing whitespace is tolerated (gateways differ on padding);
/// signs, decimal points, separators and anything non-digit are not.
pub fn parse_memo(memo: &str) -> Result<i64, CorrelationError> {
    let trimmed = memo.trim();
    if trimmed.is_empty() || trimmed.len() > 19 {
        return Err(CorrelationError::UnparsableMemo);
    }
    if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CorrelationError::UnparsableMemo);
    }
    trimmed
        .parse::<i64>()
        .map_err(|_| CorrelationError::UnparsableMemo)
}

/// Resolve a deposit to the trade its escrow id names.
///
/// A trade accepts deposits while PENDING_FUNDING, and also while FUNDED so
/// the second of two concurrent transfers still lands in the ledger instead
/// of vanishing; anything later is not fundable.
///
/// The outer Result is storage trouble (retryable upstream); the inner one
/// is the correlation verdict on an untrusted event (logged and dropped).
pub fn correlate(
    conn: &mut SqliteConnection,
    deposit: &InboundDeposit,
) -> anyhow::Result<Result<(i64, Trade), CorrelationError>> {
    if deposit.amount <= 0 {
        return Ok(Err(CorrelationError::NonPositiveAmount(deposit.amount)));
    }

    let escrow_id = match parse_memo(&deposit.memo) {
        Ok(id) => id,
        Err(e) => return Ok(Err(e)),
    };

    let Some(trade) = Trade::find_by_escrow_id(conn, escrow_id)? else {
        return Ok(Err(CorrelationError::NoSuchEscrow(escrow_id)));
    };

    Ok(match TradeStatus::parse(&trade.status) {
        Some(TradeStatus::PendingFunding) | Some(TradeStatus::Funded) => Ok((escrow_id, trade)),
        _ => Err(CorrelationError::EscrowNotFundable(escrow_id)),
    })
}
