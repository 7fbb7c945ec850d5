//! Per-trade transition log
//!
//! Every accepted state transition appends a row with the next sequence
//! number for its trade. The log is the audit trail for replays and the
//! UNIQUE (trade_id, seq) pair makes concurrent double-writes visible.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::trade_transitions;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = trade_transitions)]
pub struct TradeTransition {
    pub id: String,
    pub trade_id: String,
    pub seq: i64,
    pub from_status: String,
    pub to_status: String,
    pub event: String,
    pub actor: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = trade_transitions)]
struct NewTradeTransition {
    id: String,
    trade_id: String,
    seq: i64,
    from_status: String,
    to_status: String,
    event: String,
    actor: Option<String>,
    created_at: NaiveDateTime,
}

impl TradeTransition {
    /// Append the next transition for a trade.
    ///
    /// Must run inside the transaction performing the status write so the
    /// sequence read and the insert are atomic.
    pub fn record(
        conn: &mut SqliteConnection,
        trade_id: &str,
        from_status: &str,
        to_status: &str,
        event: &str,
        actor: Option<&str>,
    ) -> Result<TradeTransition> {
        use diesel::dsl::max;

        let last_seq: Option<i64> = trade_transitions::table
            .filter(trade_transitions::trade_id.eq(trade_id))
            .select(max(trade_transitions::seq))
            .first(conn)
            .context("Failed to read last transition seq")?;

        let row = NewTradeTransition {
            id: Uuid::new_v4().to_string(),
            trade_id: trade_id.to_string(),
            seq: last_seq.unwrap_or(0) + 1,
            from_status: from_status.to_string(),
            to_status: to_status.to_string(),
            event: event.to_string(),
            actor: actor.map(|a| a.to_string()),
            created_at: chrono::Utc::now().naive_utc(),
        };

        let row_id = row.id.clone();
        diesel::insert_into(trade_transitions::table)
            .values(&row)
            .execute(conn)
            .context(format!(
                "Failed to record transition for trade {}",
                trade_id
            ))?;

        trade_transitions::table
            .filter(trade_transitions::id.eq(row_id))
            .first(conn)
            .context("Failed to retrieve recorded transition")
    }

    /// Full transition history for a trade, in sequence order
    pub fn history(conn: &mut SqliteConnection, trade_id: &str) -> Result<Vec<TradeTransition>> {
        trade_transitions::table
            .filter(trade_transitions::trade_id.eq(trade_id))
            .order(trade_transitions::seq.asc())
            .load(conn)
            .context(format!("Failed to load transitions for trade {}", trade_id))
    }
}
