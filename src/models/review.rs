//! Review model
//!
//! One reputation vote per (trade, reviewer), enforced by a UNIQUE index.

use anyhow::{Context, Result};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::reviews;

pub const MAX_COMMENT_CHARS: usize = 280;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
#[diesel(table_name = reviews)]
pub struct Review {
    pub id: String,
    pub trade_id: String,
    pub reviewer_id: String,
    pub reviewee_id: String,
    pub vote: String,
    pub comment: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = reviews)]
pub struct NewReview {
    pub id: String,
    pub trade_id: String,
    pub reviewer_id: String,
    pub reviewee_id: String,
    pub vote: String,
    pub comment: Option<String>,
    pub created_at: String,
}

impl NewReview {
    pub fn new(
        trade_id: &str,
        reviewer_id: &str,
        reviewee_id: &str,
        vote: &str,
        comment: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            trade_id: trade_id.to_string(),
            reviewer_id: reviewer_id.to_string(),
            reviewee_id: reviewee_id.to_string(),
            vote: vote.to_string(),
            comment,
            created_at: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

/// Outcome of a review insert attempt
pub enum ReviewInsert {
    Created(Review),
    Duplicate,
}

impl Review {
    /// Insert the review; a UNIQUE violation on (trade_id, reviewer_id)
    /// reports `Duplicate` instead of an error.
    pub fn insert_unique(conn: &mut SqliteConnection, new_review: NewReview) -> Result<ReviewInsert> {
        let review_id = new_review.id.clone();
        match diesel::insert_into(reviews::table)
            .values(&new_review)
            .execute(conn)
        {
            Ok(_) => {}
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                return Ok(ReviewInsert::Duplicate);
            }
            Err(e) => {
                return Err(e).context(format!(
                    "Failed to insert review for trade {}",
                    new_review.trade_id
                ));
            }
        }

        let review = reviews::table
            .filter(reviews::id.eq(review_id))
            .first(conn)
            .context("Failed to retrieve created review")?;
        Ok(ReviewInsert::Created(review))
    }

    pub fn exists_for(
        conn: &mut SqliteConnection,
        trade_id: &str,
        reviewer_id: &str,
    ) -> Result<bool> {
        use diesel::dsl::count_star;
        let count: i64 = reviews::table
            .filter(reviews::trade_id.eq(trade_id))
            .filter(reviews::reviewer_id.eq(reviewer_id))
            .select(count_star())
            .first(conn)
            .context("Failed to count reviews")?;
        Ok(count > 0)
    }

    /// Reviews received by a user, newest first
    pub fn find_by_reviewee(conn: &mut SqliteConnection, reviewee_id: &str) -> Result<Vec<Review>> {
        reviews::table
            .filter(reviews::reviewee_id.eq(reviewee_id))
            .order(reviews::created_at.desc())
            .load(conn)
            .context(format!("Failed to load reviews for user {}", reviewee_id))
    }
}
