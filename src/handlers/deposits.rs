//! Inbound deposit webhook
//!
//! The push half of deposit delivery. The HMAC check runs over the raw
//! request body before anything is parsed; a bad or missing signature (when
//! a secret is configured) is a security event, not a validation error, and
//! never reaches the correlator.
//!
//! Signature scheme, mirrored from the outbound side of the chain gateway:
//!   X-LocalStable-Signature: sha256=<hex(HMAC(secret, timestamp.body))>
//!   X-LocalStable-Timestamp: Unix timestamp

use actix_web::{post, web, HttpRequest, HttpResponse, Responder};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;

use crate::config::WebhookConfig;
use crate::log_txid;
use crate::models::audit_event::AuditEventBuilder;
use crate::services::audit::AuditService;
use crate::services::correlator::{DepositSource, InboundDeposit};
use crate::services::reconciler::{ApplyOutcome, ReconciliationCoordinator};

pub const SIGNATURE_HEADER: &str = "X-LocalStable-Signature";
pub const TIMESTAMP_HEADER: &str = "X-LocalStable-Timestamp";

#[derive(Debug, Deserialize)]
pub struct WebhookDepositRequest {
    pub tx_hash: String,
    pub sender_address: String,
    /// Stablecoin minor units
    pub amount: i64,
    pub memo: String,
}

/// POST /api/deposits/webhook
#[post("/deposits/webhook")]
pub async fn deposit_webhook(
    req: HttpRequest,
    body: web::Bytes,
    webhook_config: web::Data<WebhookConfig>,
    reconciler: web::Data<Arc<ReconciliationCoordinator>>,
    audit: web::Data<AuditService>,
) -> impl Responder {
    if let Some(secret) = &webhook_config.secret {
        match verify_signature(&req, &body, secret) {
            Ok(()) => {}
            Err(reason) => {
                tracing::warn!(reason, "Rejected deposit webhook signature");
                audit.log_async(
                    AuditEventBuilder::new("webhook.signature_rejected")
                        .resource("webhook", "deposit")
                        .metadata("reason", reason),
                );
                return HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "invalid webhook signature"
                }));
            }
        }
    }

    let payload: WebhookDepositRequest = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": format!("malformed payload: {}", e)
            }));
        }
    };

    if payload.tx_hash.trim().is_empty() {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "tx_hash is required"
        }));
    }

    let deposit = InboundDeposit {
        source: DepositSource::Webhook,
        tx_hash: payload.tx_hash.trim().to_string(),
        sender_address: payload.sender_address,
        amount: payload.amount,
        memo: payload.memo,
        observed_at: chrono::Utc::now().naive_utc(),
    };

    match reconciler.apply_deposit(deposit).await {
        Ok(ApplyOutcome::Applied { trade, newly_funded, .. }) => {
            HttpResponse::Ok().json(serde_json::json!({
                "status": "applied",
                "trade_id": trade.id,
                "funded": newly_funded || trade.status == "funded"
            }))
        }
        // Replays acknowledge as success: the gateway must not keep retrying.
        Ok(ApplyOutcome::AlreadyApplied) => HttpResponse::Ok().json(serde_json::json!({
            "status": "already_applied"
        })),
        // Correlation misses are durably logged before we ack.
        Ok(ApplyOutcome::Dropped(reason)) => HttpResponse::Ok().json(serde_json::json!({
            "status": "dropped",
            "reason": reason.to_string()
        })),
        Err(e) => {
            // Not durably recorded: signal the gateway to redeliver.
            tracing::error!(
                error = %e,
                tx = %log_txid!(&payload.tx_hash),
                "Deposit webhook processing failed"
            );
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "error": "transient failure, retry later"
            }))
        }
    }
}

/// Verify the HMAC-SHA256 signature over `timestamp.body`.
fn verify_signature(req: &HttpRequest, body: &[u8], secret: &str) -> Result<(), &'static str> {
    let signature = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or("missing signature header")?;

    let timestamp = req
        .headers()
        .get(TIMESTAMP_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or("missing timestamp header")?;

    let hex_signature = signature
        .strip_prefix("sha256=")
        .ok_or("signature missing sha256= prefix")?;
    let provided = hex::decode(hex_signature).map_err(|_| "signature is not valid hex")?;

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| "webhook secret unusable as HMAC key")?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);

    // Constant-time comparison
    mac.verify_slice(&provided).map_err(|_| "signature mismatch")
}
