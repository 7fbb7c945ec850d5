//! Deposit event model
//!
//! A normalized on-chain transfer as observed by either delivery path. The
//! UNIQUE index on tx_hash is the authoritative at-most-once guard: a row
//! exists if and only if the deposit has been applied to its trade.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::{Deserialize, Serialize};

use crate::schema::deposit_events;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = deposit_events)]
pub struct DepositEvent {
    pub id: String,
    pub tx_hash: String,
    pub trade_id: String,
    pub escrow_id: i64,
    /// "webhook" or "poll"
    pub source: String,
    /// Recorded for audit only; never a matching criterion
    pub sender_address: String,
    pub amount: i64,
    pub memo: String,
    pub observed_at: NaiveDateTime,
    pub applied_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = deposit_events)]
pub struct NewDepositEvent {
    pub id: String,
    pub tx_hash: String,
    pub trade_id: String,
    pub escrow_id: i64,
    pub source: String,
    pub sender_address: String,
    pub amount: i64,
    pub memo: String,
    pub observed_at: NaiveDateTime,
    pub applied_at: NaiveDateTime,
}

impl DepositEvent {
    /// Insert the event if its tx hash has not been applied yet.
    ///
    /// Returns `false` when the UNIQUE constraint on tx_hash fires, i.e. a
    /// concurrent or earlier delivery already claimed this transaction.
    pub fn insert_new(conn: &mut SqliteConnection, new_event: &NewDepositEvent) -> Result<bool> {
        match diesel::insert_into(deposit_events::table)
            .values(new_event)
            .execute(conn)
        {
            Ok(_) => Ok(true),
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => Ok(false),
            Err(e) => Err(e).context(format!(
                "Failed to insert deposit event for tx {}",
                new_event.tx_hash
            )),
        }
    }

    pub fn find_by_tx_hash(conn: &mut SqliteConnection, tx_hash: &str) -> Result<Option<Self>> {
        deposit_events::table
            .filter(deposit_events::tx_hash.eq(tx_hash))
            .first(conn)
            .optional()
            .context(format!("Failed to query deposit event for tx {}", tx_hash))
    }

    /// All deposits applied to a trade, oldest first
    pub fn find_by_trade(conn: &mut SqliteConnection, trade_id: &str) -> Result<Vec<Self>> {
        deposit_events::table
            .filter(deposit_events::trade_id.eq(trade_id))
            .order(deposit_events::applied_at.asc())
            .load(conn)
            .context(format!("Failed to load deposit events for trade {}", trade_id))
    }

    /// Sum of applied deposits for a trade
    pub fn total_for_trade(conn: &mut SqliteConnection, trade_id: &str) -> Result<i64> {
        use diesel::dsl::sql;
        use diesel::sql_types::{BigInt, Nullable};
        let total: Option<i64> = deposit_events::table
            .filter(deposit_events::trade_id.eq(trade_id))
            .select(sql::<Nullable<BigInt>>("SUM(amount)"))
            .first(conn)
            .context(format!("Failed to sum deposits for trade {}", trade_id))?;
        Ok(total.unwrap_or(0))
    }
}
