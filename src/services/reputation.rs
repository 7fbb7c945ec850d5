//! Reputation ledger
//!
//! Records post-settlement reviews and keeps the aggregated vote counters
//! on the account row in lockstep: the review insert and the counter
//! increment share one transaction, so both land or neither does.

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::db::{db_blocking, DbPool};
use crate::models::audit_event::AuditEventBuilder;
use crate::models::review::{NewReview, Review, ReviewInsert, MAX_COMMENT_CHARS};
use crate::models::trade::Trade;
use crate::models::user::User;
use crate::services::audit::AuditService;
use crate::services::state_machine::TradeStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Up,
    Down,
}

impl Vote {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vote::Up => "up",
            Vote::Down => "down",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(Vote::Up),
            "down" => Some(Vote::Down),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("trade {0} not found")]
    TradeNotFound(String),
    #[error("trade {trade_id} in status {status} is not reviewable")]
    NotReviewable { trade_id: String, status: String },
    #[error("user {user_id} is not a participant of trade {trade_id}")]
    NotAParticipant { trade_id: String, user_id: String },
    #[error("a review for this trade by this reviewer already exists")]
    DuplicateReview,
    #[error("comment exceeds {MAX_COMMENT_CHARS} characters")]
    CommentTooLong,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub struct ReputationLedger {
    pool: DbPool,
    audit: AuditService,
}

impl ReputationLedger {
    pub fn new(pool: DbPool, audit: AuditService) -> Self {
        Self { pool, audit }
    }

    /// Submit a review for a settled trade.
    ///
    /// The reviewee is always the counterparty; clients never name one.
    pub async fn submit_review(
        &self,
        trade_id: &str,
        reviewer_id: &str,
        vote: Vote,
        comment: Option<String>,
    ) -> Result<Review, ReviewError> {
        if let Some(text) = &comment {
            if text.chars().count() > MAX_COMMENT_CHARS {
                return Err(ReviewError::CommentTooLong);
            }
        }

        let id = trade_id.to_string();
        let reviewer = reviewer_id.to_string();
        let review = db_blocking(&self.pool, move |conn| {
            conn.immediate_transaction(|conn| {
                let Some(trade) = Trade::find_by_id_opt(conn, &id)? else {
                    return Ok(Err(ReviewError::TradeNotFound(id.clone())));
                };

                let reviewable = TradeStatus::parse(&trade.status)
                    .map(|s| s.is_reviewable())
                    .unwrap_or(false);
                if !reviewable {
                    return Ok(Err(ReviewError::NotReviewable {
                        trade_id: id.clone(),
                        status: trade.status.clone(),
                    }));
                }

                let Some(reviewee) = trade.counterparty_of(&reviewer) else {
                    return Ok(Err(ReviewError::NotAParticipant {
                        trade_id: id.clone(),
                        user_id: reviewer.clone(),
                    }));
                };
                let reviewee = reviewee.to_string();

                let new_review =
                    NewReview::new(&id, &reviewer, &reviewee, vote.as_str(), comment.clone());

                match Review::insert_unique(conn, new_review)? {
                    ReviewInsert::Duplicate => Ok(Err(ReviewError::DuplicateReview)),
                    ReviewInsert::Created(review) => {
                        // Counter update rides the same transaction.
                        User::record_vote(conn, &reviewee, vote == Vote::Up)?;
                        Ok(Ok(review))
                    }
                }
            })
        })
        .await??;

        info!(
            trade_id = %crate::log_trade_id!(&review.trade_id),
            vote = %review.vote,
            "Review recorded"
        );
        self.audit.log_async(
            AuditEventBuilder::new("review.submitted")
                .actor(reviewer_id)
                .resource("trade", trade_id)
                .metadata("vote", vote.as_str()),
        );

        Ok(review)
    }

    /// Reputation summary for an account.
    pub async fn summary_for(&self, user_id: &str) -> Result<ReputationSummary> {
        let id = user_id.to_string();
        db_blocking(&self.pool, move |conn| {
            let user = User::find_by_id(conn, &id)?;
            Ok(ReputationSummary::of(&user))
        })
        .await
    }
}

/// Aggregated reputation state derived from the account counters.
#[derive(Debug, Clone, Serialize)]
pub struct ReputationSummary {
    pub completed_trades: i32,
    pub upvotes: i32,
    pub downvotes: i32,
    pub score: i32,
    pub tier: &'static str,
}

impl ReputationSummary {
    pub fn of(user: &User) -> Self {
        let score = score(user.upvotes, user.downvotes);
        Self {
            completed_trades: user.completed_trades,
            upvotes: user.upvotes,
            downvotes: user.downvotes,
            score,
            tier: reputation_tier(user.completed_trades, score).as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationTier {
    TopTrader,
    Experienced,
    Verified,
    NewTrader,
    Unrated,
}

impl ReputationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReputationTier::TopTrader => "Top Trader",
            ReputationTier::Experienced => "Experienced",
            ReputationTier::Verified => "Verified",
            ReputationTier::NewTrader => "New Trader",
            ReputationTier::Unrated => "Unrated",
        }
    }
}

/// Percentage of up votes among cast votes; an account with no votes scores
/// 100 so it is gated by trade count alone.
pub fn score(upvotes: i32, downvotes: i32) -> i32 {
    let total = upvotes + downvotes;
    if total == 0 {
        return 100;
    }
    (upvotes as i64 * 100 / total as i64) as i32
}

/// Map (completed trades, score) onto the fixed tier ladder; the highest
/// qualifying tier wins.
pub fn reputation_tier(completed_trades: i32, score: i32) -> ReputationTier {
    if completed_trades == 0 {
        return ReputationTier::Unrated;
    }
    if completed_trades >= 100 && score >= 90 {
        ReputationTier::TopTrader
    } else if completed_trades >= 50 && score >= 80 {
        ReputationTier::Experienced
    } else if completed_trades >= 10 && score >= 70 {
        ReputationTier::Verified
    } else {
        ReputationTier::NewTrader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_with_no_votes() {
        assert_eq!(score(0, 0), 100);
    }

    #[test]
    fn test_score_percentage() {
        assert_eq!(score(9, 1), 90);
        assert_eq!(score(1, 1), 50);
        assert_eq!(score(0, 5), 0);
    }

    #[test]
    fn test_tier_ladder() {
        assert_eq!(reputation_tier(0, 100), ReputationTier::Unrated);
        assert_eq!(reputation_tier(1, 100), ReputationTier::NewTrader);
        assert_eq!(reputation_tier(10, 70), ReputationTier::Verified);
        assert_eq!(reputation_tier(50, 80), ReputationTier::Experienced);
        assert_eq!(reputation_tier(100, 90), ReputationTier::TopTrader);
    }

    #[test]
    fn test_highest_qualifying_tier_wins() {
        // Plenty of trades but a weak score stops at the tier its score allows
        assert_eq!(reputation_tier(200, 85), ReputationTier::Experienced);
        assert_eq!(reputation_tier(200, 75), ReputationTier::Verified);
        assert_eq!(reputation_tier(200, 10), ReputationTier::NewTrader);
    }

    #[test]
    fn test_vote_parse() {
        assert_eq!(Vote::parse("up"), Some(Vote::Up));
        assert_eq!(Vote::parse("down"), Some(Vote::Down));
        assert_eq!(Vote::parse("sideways"), None);
    }
}
