//! Account model: identity, ban state, reputation counters

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::users;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: String,
    pub username: String,
    pub verification_tier: String,
    pub is_banned: bool,
    pub ban_type: Option<String>,
    pub ban_expires_at: Option<NaiveDateTime>,
    pub ban_reason: Option<String>,
    pub upvotes: i32,
    pub downvotes: i32,
    pub completed_trades: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: String,
    pub username: String,
    pub verification_tier: String,
    pub is_banned: bool,
    pub upvotes: i32,
    pub downvotes: i32,
    pub completed_trades: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl NewUser {
    pub fn with_username(username: &str) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            verification_tier: "basic".to_string(),
            is_banned: false,
            upvotes: 0,
            downvotes: 0,
            completed_trades: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

impl User {
    pub fn create(conn: &mut SqliteConnection, new_user: NewUser) -> Result<User> {
        let user_id = new_user.id.clone();
        diesel::insert_into(users::table)
            .values(&new_user)
            .execute(conn)
            .context("Failed to insert user")?;
        users::table
            .find(user_id)
            .first(conn)
            .context("Failed to retrieve created user")
    }

    pub fn find_by_id(conn: &mut SqliteConnection, user_id: &str) -> Result<User> {
        users::table
            .find(user_id)
            .first(conn)
            .context(format!("User with ID {} not found", user_id))
    }

    pub fn find_by_id_opt(conn: &mut SqliteConnection, user_id: &str) -> Result<Option<User>> {
        users::table
            .find(user_id)
            .first(conn)
            .optional()
            .context(format!("Failed to query user {}", user_id))
    }

    /// Apply a ban. `expires_at = None` with type "permanent" bans forever.
    pub fn set_ban(
        conn: &mut SqliteConnection,
        user_id: &str,
        ban_type: &str,
        expires_at: Option<NaiveDateTime>,
        reason: &str,
    ) -> Result<()> {
        diesel::update(users::table.find(user_id))
            .set((
                users::is_banned.eq(true),
                users::ban_type.eq(Some(ban_type)),
                users::ban_expires_at.eq(expires_at),
                users::ban_reason.eq(Some(reason)),
                users::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .context(format!("Failed to ban user {}", user_id))?;
        Ok(())
    }

    /// Clear all ban fields. Used by the ban guard's self-heal path.
    pub fn clear_ban(conn: &mut SqliteConnection, user_id: &str) -> Result<()> {
        diesel::update(users::table.find(user_id))
            .set((
                users::is_banned.eq(false),
                users::ban_type.eq(None::<String>),
                users::ban_expires_at.eq(None::<NaiveDateTime>),
                users::ban_reason.eq(None::<String>),
                users::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .context(format!("Failed to clear ban for user {}", user_id))?;
        Ok(())
    }

    /// Increment the up- or downvote counter.
    ///
    /// Must run inside the same transaction as the review insert so the
    /// counter and the review row commit or roll back together.
    pub fn record_vote(conn: &mut SqliteConnection, user_id: &str, upvote: bool) -> Result<()> {
        let now = chrono::Utc::now().naive_utc();
        let updated = if upvote {
            diesel::update(users::table.find(user_id))
                .set((
                    users::upvotes.eq(users::upvotes + 1),
                    users::updated_at.eq(now),
                ))
                .execute(conn)
        } else {
            diesel::update(users::table.find(user_id))
                .set((
                    users::downvotes.eq(users::downvotes + 1),
                    users::updated_at.eq(now),
                ))
                .execute(conn)
        }
        .context(format!("Failed to record vote for user {}", user_id))?;

        if updated == 0 {
            anyhow::bail!("User {} not found for vote update", user_id);
        }
        Ok(())
    }

    pub fn increment_completed_trades(conn: &mut SqliteConnection, user_id: &str) -> Result<()> {
        diesel::update(users::table.find(user_id))
            .set((
                users::completed_trades.eq(users::completed_trades + 1),
                users::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)
            .context(format!(
                "Failed to increment completed trades for user {}",
                user_id
            ))?;
        Ok(())
    }
}
