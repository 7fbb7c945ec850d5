//! Review and reputation endpoints

use actix_web::{get, post, web, HttpResponse, Responder};
use serde::Deserialize;

use crate::db::{db_blocking, DbPool};
use crate::models::review::Review;
use crate::services::ban_guard::{AccessDecision, BanGuard};
use crate::services::reputation::{ReputationLedger, ReviewError, Vote};

#[derive(Debug, Deserialize)]
pub struct SubmitReviewRequest {
    pub reviewer_id: String,
    /// "up" or "down"
    pub vote: String,
    pub comment: Option<String>,
}

/// POST /api/trades/{id}/reviews
#[post("/trades/{id}/reviews")]
pub async fn submit_review(
    ledger: web::Data<ReputationLedger>,
    ban_guard: web::Data<BanGuard>,
    path: web::Path<String>,
    body: web::Json<SubmitReviewRequest>,
) -> impl Responder {
    let Some(vote) = Vote::parse(&body.vote) else {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "vote must be 'up' or 'down'"
        }));
    };

    if let AccessDecision::Denied { reason, .. } = ban_guard.check_access(&body.reviewer_id).await {
        return HttpResponse::Forbidden().json(serde_json::json!({
            "error": "account banned",
            "reason": reason
        }));
    }

    match ledger
        .submit_review(
            &path.into_inner(),
            &body.reviewer_id,
            vote,
            body.comment.clone(),
        )
        .await
    {
        Ok(review) => HttpResponse::Created().json(review),
        Err(e) => review_error_response(e),
    }
}

/// GET /api/users/{id}/reputation
#[get("/users/{id}/reputation")]
pub async fn get_reputation(
    ledger: web::Data<ReputationLedger>,
    path: web::Path<String>,
) -> impl Responder {
    match ledger.summary_for(&path.into_inner()).await {
        Ok(summary) => HttpResponse::Ok().json(summary),
        Err(e) => {
            let message = e.to_string();
            if message.contains("not found") {
                HttpResponse::NotFound().json(serde_json::json!({ "error": message }))
            } else {
                tracing::error!(error = %e, "Failed to load reputation");
                HttpResponse::InternalServerError().json(serde_json::json!({
                    "error": "failed to load reputation"
                }))
            }
        }
    }
}

/// GET /api/users/{id}/reviews
#[get("/users/{id}/reviews")]
pub async fn list_reviews(pool: web::Data<DbPool>, path: web::Path<String>) -> impl Responder {
    let user_id = path.into_inner();
    let result = db_blocking(&pool, move |conn| Review::find_by_reviewee(conn, &user_id)).await;
    match result {
        Ok(reviews) => HttpResponse::Ok().json(serde_json::json!({
            "count": reviews.len(),
            "reviews": reviews
        })),
        Err(e) => {
            tracing::error!(error = %e, "Failed to list reviews");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "failed to list reviews"
            }))
        }
    }
}

fn review_error_response(e: ReviewError) -> HttpResponse {
    match e {
        ReviewError::TradeNotFound(_) => {
            HttpResponse::NotFound().json(serde_json::json!({ "error": e.to_string() }))
        }
        ReviewError::NotAParticipant { .. } => {
            HttpResponse::Forbidden().json(serde_json::json!({ "error": e.to_string() }))
        }
        ReviewError::NotReviewable { .. } | ReviewError::DuplicateReview => {
            HttpResponse::Conflict().json(serde_json::json!({ "error": e.to_string() }))
        }
        ReviewError::CommentTooLong => {
            HttpResponse::BadRequest().json(serde_json::json!({ "error": e.to_string() }))
        }
        ReviewError::Storage(e) => {
            tracing::error!(error = %e, "Review submission failed");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "internal error"
            }))
        }
    }
}
