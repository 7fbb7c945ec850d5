//! Trade model and related database operations

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::trades;

/// Trade model - IMPORTANT: Column order MUST match schema.rs exactly!
/// Diesel's Queryable trait requires fields in the same order as the table columns.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = trades)]
pub struct Trade {
    pub id: String,
    /// Correlation key carried as the deposit memo. Unique, immutable.
    pub escrow_id: i64,
    pub buyer_id: String,
    pub seller_id: String,
    /// Principal in stablecoin minor units
    pub amount: i64,
    pub fiat_currency: String,
    /// Fiat minor units per stablecoin unit
    pub fiat_price: i64,
    pub status: String,
    /// Sum of matched deposits. Never decreases.
    pub funded_amount: i64,
    /// Amount received beyond the principal, flagged for manual review
    pub excess_amount: i64,
    pub fee_bps: Option<i64>,
    pub fee_amount: Option<i64>,
    pub net_amount: Option<i64>,
    /// Optimistic concurrency counter; every funding-state write bumps it
    pub version: i64,
    pub dispute_reason: Option<String>,
    pub resolution: Option<String>,
    pub created_at: NaiveDateTime,
    pub funding_deadline: NaiveDateTime,
    pub trade_deadline: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = trades)]
pub struct NewTrade {
    pub id: String,
    pub escrow_id: i64,
    pub buyer_id: String,
    pub seller_id: String,
    pub amount: i64,
    pub fiat_currency: String,
    pub fiat_price: i64,
    pub status: String,
    pub funded_amount: i64,
    pub excess_amount: i64,
    pub version: i64,
    pub created_at: NaiveDateTime,
    pub funding_deadline: NaiveDateTime,
    pub trade_deadline: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Trade {
    /// Create a new trade in the database
    pub fn create(conn: &mut SqliteConnection, new_trade: NewTrade) -> Result<Trade> {
        let trade_id = new_trade.id.clone();

        diesel::insert_into(trades::table)
            .values(&new_trade)
            .execute(conn)
            .map_err(|e| {
                tracing::error!("Diesel insert error for trade {}: {:?}", trade_id, e);
                anyhow::anyhow!("Failed to insert trade: {}", e)
            })?;

        trades::table
            .filter(trades::id.eq(trade_id))
            .first(conn)
            .context("Failed to retrieve created trade")
    }

    /// Find trade by ID
    pub fn find_by_id(conn: &mut SqliteConnection, trade_id: &str) -> Result<Trade> {
        trades::table
            .filter(trades::id.eq(trade_id))
            .first(conn)
            .context(format!("Trade with ID {} not found", trade_id))
    }

    pub fn find_by_id_opt(conn: &mut SqliteConnection, trade_id: &str) -> Result<Option<Trade>> {
        trades::table
            .filter(trades::id.eq(trade_id))
            .first(conn)
            .optional()
            .context(format!("Failed to query trade {}", trade_id))
    }

    /// Find trade by its escrow correlation key
    pub fn find_by_escrow_id(conn: &mut SqliteConnection, escrow_id: i64) -> Result<Option<Trade>> {
        trades::table
            .filter(trades::escrow_id.eq(escrow_id))
            .first(conn)
            .optional()
            .context(format!("Failed to query trade for escrow {}", escrow_id))
    }

    /// Find trades involving a user, newest first
    pub fn find_by_participant(conn: &mut SqliteConnection, user_id: &str) -> Result<Vec<Trade>> {
        trades::table
            .filter(
                trades::buyer_id
                    .eq(user_id)
                    .or(trades::seller_id.eq(user_id)),
            )
            .order(trades::created_at.desc())
            .load(conn)
            .context(format!("Failed to load trades for user {}", user_id))
    }

    /// Allocate the next escrow correlation key.
    ///
    /// Must be called inside the same transaction that inserts the trade so
    /// two concurrent creations cannot both observe the same maximum; the
    /// UNIQUE index on escrow_id backstops the race across instances.
    pub fn next_escrow_id(conn: &mut SqliteConnection) -> Result<i64> {
        use diesel::dsl::max;
        let current: Option<i64> = trades::table
            .select(max(trades::escrow_id))
            .first(conn)
            .context("Failed to read max escrow_id")?;
        Ok(current.unwrap_or(0) + 1)
    }

    /// Accumulate a matched deposit into the trade's funding state.
    ///
    /// Conditional on the observed version so two writers re-reading the
    /// same row cannot both apply; returns the number of rows updated
    /// (0 = lost the optimistic race, caller re-reads and retries).
    pub fn accumulate_deposit(
        conn: &mut SqliteConnection,
        trade_id: &str,
        expected_version: i64,
        deposit_amount: i64,
        excess_delta: i64,
    ) -> Result<usize> {
        let now = chrono::Utc::now().naive_utc();
        diesel::update(
            trades::table
                .filter(trades::id.eq(trade_id))
                .filter(trades::version.eq(expected_version)),
        )
        .set((
            trades::funded_amount.eq(trades::funded_amount + deposit_amount),
            trades::excess_amount.eq(trades::excess_amount + excess_delta),
            trades::version.eq(trades::version + 1),
            trades::updated_at.eq(now),
        ))
        .execute(conn)
        .context(format!(
            "Failed to accumulate deposit for trade {}",
            trade_id
        ))
    }

    /// Trades past their funding deadline that never got (fully) funded.
    ///
    /// Used by the deadline sweep; lazy evaluation on access catches the
    /// same rows when they are touched first.
    pub fn find_past_funding_deadline(
        conn: &mut SqliteConnection,
        now: NaiveDateTime,
    ) -> Result<Vec<Trade>> {
        trades::table
            .filter(trades::status.eq("pending_funding"))
            .filter(trades::funding_deadline.lt(now))
            .load(conn)
            .context("Failed to load trades past funding deadline")
    }

    /// Funded trades past their settlement deadline.
    pub fn find_past_trade_deadline(
        conn: &mut SqliteConnection,
        now: NaiveDateTime,
    ) -> Result<Vec<Trade>> {
        trades::table
            .filter(trades::status.eq_any(["funded", "active"]))
            .filter(trades::trade_deadline.lt(now))
            .load(conn)
            .context("Failed to load trades past settlement deadline")
    }

    /// Amount still required to reach the principal
    pub fn outstanding(&self) -> i64 {
        (self.amount - self.funded_amount).max(0)
    }

    pub fn is_fully_funded(&self) -> bool {
        self.funded_amount >= self.amount
    }

    pub fn funding_deadline_passed(&self, now: NaiveDateTime) -> bool {
        self.funding_deadline < now
    }

    pub fn trade_deadline_passed(&self, now: NaiveDateTime) -> bool {
        self.trade_deadline < now
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.buyer_id == user_id || self.seller_id == user_id
    }

    /// The counterparty of a participant, if the user is one
    pub fn counterparty_of(&self, user_id: &str) -> Option<&str> {
        if self.buyer_id == user_id {
            Some(&self.seller_id)
        } else if self.seller_id == user_id {
            Some(&self.buyer_id)
        } else {
            None
        }
    }
}
