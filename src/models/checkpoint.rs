//! Poll-sweep checkpoint
//!
//! Single-row cursor recording how far the chain poll has scanned. The
//! cursor only moves forward; replays below it are harmless because the
//! deposit dedup absorbs them.

use anyhow::{Context, Result};
use diesel::prelude::*;

use crate::schema::chain_checkpoints;

const CHECKPOINT_ROW: i32 = 1;

pub struct ChainCheckpoint;

impl ChainCheckpoint {
    /// Current cursor, 0 if the sweep has never run.
    pub fn current(conn: &mut SqliteConnection) -> Result<i64> {
        let cursor: Option<i64> = chain_checkpoints::table
            .find(CHECKPOINT_ROW)
            .select(chain_checkpoints::cursor)
            .first(conn)
            .optional()
            .context("Failed to read chain checkpoint")?;
        Ok(cursor.unwrap_or(0))
    }

    /// Advance the cursor; never moves it backwards.
    pub fn advance(conn: &mut SqliteConnection, cursor: i64) -> Result<()> {
        let now = chrono::Utc::now().naive_utc();
        let updated = diesel::update(
            chain_checkpoints::table
                .find(CHECKPOINT_ROW)
                .filter(chain_checkpoints::cursor.lt(cursor)),
        )
        .set((
            chain_checkpoints::cursor.eq(cursor),
            chain_checkpoints::updated_at.eq(now),
        ))
        .execute(conn)
        .context("Failed to advance chain checkpoint")?;

        if updated == 0 {
            let exists: Option<i32> = chain_checkpoints::table
                .find(CHECKPOINT_ROW)
                .select(chain_checkpoints::id)
                .first(conn)
                .optional()
                .context("Failed to probe chain checkpoint")?;
            if exists.is_none() {
                diesel::insert_into(chain_checkpoints::table)
                    .values((
                        chain_checkpoints::id.eq(CHECKPOINT_ROW),
                        chain_checkpoints::cursor.eq(cursor),
                        chain_checkpoints::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .context("Failed to initialize chain checkpoint")?;
            }
        }
        Ok(())
    }
}
