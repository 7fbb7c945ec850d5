//! Trade lifecycle endpoints
//!
//! Thin layer: validation of request shape, ban gating, then straight into
//! the state machine. Participant identity arrives in the request body; the
//! authentication surface in front of this core is an external collaborator.

use actix_web::{get, post, web, HttpResponse, Responder};
use chrono::Duration;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::{TimeoutConfig, TradeLimitsConfig};
use crate::db::{db_blocking, DbPool};
use crate::models::trade::{NewTrade, Trade};
use crate::models::trade_transition::TradeTransition;
use crate::models::user::User;
use crate::services::ban_guard::{AccessDecision, BanGuard};
use crate::services::state_machine::{
    EscrowStateMachine, Resolution, TradeStatus, TransitionError, TransitionOutcome,
};

/// Stablecoin minor units per whole unit (6 decimals)
pub const MINOR_PER_UNIT: i64 = 1_000_000;

#[derive(Debug, Deserialize)]
pub struct CreateTradeRequest {
    pub buyer_id: String,
    pub seller_id: String,
    /// Principal in stablecoin minor units
    pub amount: i64,
    pub fiat_currency: String,
    /// Fiat minor units per stablecoin unit
    pub fiat_price: i64,
}

#[derive(Debug, Deserialize)]
pub struct ActorRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DisputeRequest {
    pub user_id: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub admin_id: String,
    /// "release" or "refund"
    pub decision: String,
}

/// POST /api/trades - open a trade and assign its escrow correlation key
#[post("/trades")]
pub async fn create_trade(
    pool: web::Data<DbPool>,
    ban_guard: web::Data<BanGuard>,
    limits: web::Data<TradeLimitsConfig>,
    timeouts: web::Data<TimeoutConfig>,
    body: web::Json<CreateTradeRequest>,
) -> impl Responder {
    if body.buyer_id == body.seller_id {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "buyer and seller must be distinct"
        }));
    }
    if body.amount <= 0 || body.fiat_price <= 0 {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "amount and fiat_price must be positive"
        }));
    }

    for user_id in [&body.buyer_id, &body.seller_id] {
        if let AccessDecision::Denied { reason, .. } = ban_guard.check_access(user_id).await {
            return HttpResponse::Forbidden().json(serde_json::json!({
                "error": "account banned",
                "reason": reason
            }));
        }
    }

    let request = body.into_inner();
    let limits = limits.get_ref().clone();
    let timeouts = timeouts.get_ref().clone();

    let created = db_blocking(&pool, move |conn| {
        // Limits follow the depositor's verification tier.
        let Some(seller) = User::find_by_id_opt(conn, &request.seller_id)? else {
            return Ok(Err(format!("seller {} not found", request.seller_id)));
        };
        if User::find_by_id_opt(conn, &request.buyer_id)?.is_none() {
            return Ok(Err(format!("buyer {} not found", request.buyer_id)));
        }

        let (min_amount, max_amount) = limits.bounds_for_tier(&seller.verification_tier);
        if request.amount < min_amount || request.amount > max_amount {
            return Ok(Err(format!(
                "amount outside limits for tier {} ({}..{})",
                seller.verification_tier, min_amount, max_amount
            )));
        }

        if let Some(fiat_min) = limits.fiat_minimum(&request.fiat_currency) {
            let fiat_value =
                (request.amount as i128 * request.fiat_price as i128 / MINOR_PER_UNIT as i128) as i64;
            if fiat_value < fiat_min {
                return Ok(Err(format!(
                    "fiat value {} below minimum {} for {}",
                    fiat_value, fiat_min, request.fiat_currency
                )));
            }
        }

        let now = chrono::Utc::now().naive_utc();
        let trade = conn.immediate_transaction(|conn| {
            let escrow_id = Trade::next_escrow_id(conn)?;
            Trade::create(
                conn,
                NewTrade {
                    id: Uuid::new_v4().to_string(),
                    escrow_id,
                    buyer_id: request.buyer_id.clone(),
                    seller_id: request.seller_id.clone(),
                    amount: request.amount,
                    fiat_currency: request.fiat_currency.to_uppercase(),
                    fiat_price: request.fiat_price,
                    status: TradeStatus::PendingFunding.as_str().to_string(),
                    funded_amount: 0,
                    excess_amount: 0,
                    version: 0,
                    created_at: now,
                    funding_deadline: now + Duration::seconds(timeouts.funding_timeout_secs),
                    trade_deadline: now + Duration::seconds(timeouts.trade_timeout_secs),
                    updated_at: now,
                },
            )
        })?;
        Ok(Ok(trade))
    })
    .await;

    match created {
        Ok(Ok(trade)) => {
            tracing::info!(
                trade_id = %crate::log_trade_id!(&trade.id),
                escrow_id = trade.escrow_id,
                "Trade created"
            );
            HttpResponse::Created().json(trade)
        }
        Ok(Err(reason)) => HttpResponse::BadRequest().json(serde_json::json!({ "error": reason })),
        Err(e) => {
            tracing::error!(error = %e, "Failed to create trade");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "failed to create trade"
            }))
        }
    }
}

/// GET /api/trades/{id} - current state, deadlines applied lazily
#[get("/trades/{id}")]
pub async fn get_trade(
    state_machine: web::Data<EscrowStateMachine>,
    path: web::Path<String>,
) -> impl Responder {
    match state_machine.load_fresh(&path.into_inner()).await {
        Ok(trade) => HttpResponse::Ok().json(trade),
        Err(e) => transition_error_response(e),
    }
}

/// GET /api/trades/{id}/transitions - audit history, in sequence order
#[get("/trades/{id}/transitions")]
pub async fn get_trade_transitions(
    pool: web::Data<DbPool>,
    path: web::Path<String>,
) -> impl Responder {
    let trade_id = path.into_inner();
    let result = db_blocking(&pool, move |conn| TradeTransition::history(conn, &trade_id)).await;
    match result {
        Ok(history) => HttpResponse::Ok().json(serde_json::json!({
            "count": history.len(),
            "transitions": history
        })),
        Err(e) => {
            tracing::error!(error = %e, "Failed to load transitions");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "failed to load transitions"
            }))
        }
    }
}

/// POST /api/trades/{id}/fiat-sent - buyer declares the fiat payment sent
#[post("/trades/{id}/fiat-sent")]
pub async fn mark_fiat_sent(
    state_machine: web::Data<EscrowStateMachine>,
    ban_guard: web::Data<BanGuard>,
    path: web::Path<String>,
    body: web::Json<ActorRequest>,
) -> impl Responder {
    if let Some(denied) = deny_if_banned(&ban_guard, &body.user_id).await {
        return denied;
    }
    respond(
        state_machine
            .mark_fiat_sent(&path.into_inner(), &body.user_id)
            .await,
    )
}

/// POST /api/trades/{id}/fiat-confirmed - seller confirms the fiat arrived
#[post("/trades/{id}/fiat-confirmed")]
pub async fn confirm_fiat_received(
    state_machine: web::Data<EscrowStateMachine>,
    ban_guard: web::Data<BanGuard>,
    path: web::Path<String>,
    body: web::Json<ActorRequest>,
) -> impl Responder {
    if let Some(denied) = deny_if_banned(&ban_guard, &body.user_id).await {
        return denied;
    }
    respond(
        state_machine
            .confirm_fiat_received(&path.into_inner(), &body.user_id)
            .await,
    )
}

/// POST /api/trades/{id}/dispute
#[post("/trades/{id}/dispute")]
pub async fn raise_dispute(
    state_machine: web::Data<EscrowStateMachine>,
    ban_guard: web::Data<BanGuard>,
    path: web::Path<String>,
    body: web::Json<DisputeRequest>,
) -> impl Responder {
    if body.reason.trim().is_empty() {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "dispute reason is required"
        }));
    }
    if let Some(denied) = deny_if_banned(&ban_guard, &body.user_id).await {
        return denied;
    }
    respond(
        state_machine
            .raise_dispute(&path.into_inner(), &body.user_id, body.reason.trim())
            .await,
    )
}

/// POST /api/trades/{id}/resolve - admin resolution of a dispute
#[post("/trades/{id}/resolve")]
pub async fn resolve_dispute(
    state_machine: web::Data<EscrowStateMachine>,
    path: web::Path<String>,
    body: web::Json<ResolveRequest>,
) -> impl Responder {
    let Some(decision) = Resolution::parse(&body.decision) else {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "decision must be 'release' or 'refund'"
        }));
    };
    respond(
        state_machine
            .resolve_dispute(&path.into_inner(), decision, &body.admin_id)
            .await,
    )
}

/// POST /api/trades/{id}/cancel - only before funding
#[post("/trades/{id}/cancel")]
pub async fn cancel_trade(
    state_machine: web::Data<EscrowStateMachine>,
    ban_guard: web::Data<BanGuard>,
    path: web::Path<String>,
    body: web::Json<ActorRequest>,
) -> impl Responder {
    if let Some(denied) = deny_if_banned(&ban_guard, &body.user_id).await {
        return denied;
    }
    respond(
        state_machine
            .cancel(&path.into_inner(), &body.user_id)
            .await,
    )
}

async fn deny_if_banned(ban_guard: &BanGuard, user_id: &str) -> Option<HttpResponse> {
    match ban_guard.check_access(user_id).await {
        AccessDecision::Allowed => None,
        AccessDecision::Denied {
            reason,
            ban_type,
            expires_at,
        } => Some(HttpResponse::Forbidden().json(serde_json::json!({
            "error": "account banned",
            "reason": reason,
            "ban_type": ban_type,
            "expires_at": expires_at
        }))),
    }
}

fn respond(result: Result<TransitionOutcome, TransitionError>) -> HttpResponse {
    match result {
        Ok(outcome) => {
            let replay = matches!(outcome, TransitionOutcome::Noop(_));
            HttpResponse::Ok().json(serde_json::json!({
                "trade": outcome.trade(),
                "replay": replay
            }))
        }
        Err(e) => transition_error_response(e),
    }
}

fn transition_error_response(e: TransitionError) -> HttpResponse {
    match e {
        TransitionError::TradeNotFound(_) => {
            HttpResponse::NotFound().json(serde_json::json!({ "error": e.to_string() }))
        }
        TransitionError::NotAParticipant { .. } | TransitionError::WrongParticipant { .. } => {
            HttpResponse::Forbidden().json(serde_json::json!({ "error": e.to_string() }))
        }
        TransitionError::InvalidTransition { .. } => {
            HttpResponse::Conflict().json(serde_json::json!({ "error": e.to_string() }))
        }
        TransitionError::Storage(e) => {
            tracing::error!(error = %e, "Trade operation failed");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "internal error"
            }))
        }
    }
}
