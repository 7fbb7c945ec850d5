//! Ban guard
//!
//! Gates every mutating operation on account standing. Temporary bans are
//! evaluated lazily: the decision is a pure function of the stored ban
//! fields and the clock, and the expiry write happens as part of the same
//! access (self-healing, no background sweep required).
//!
//! Lookup failures fail OPEN: blocking all activity on a store hiccup is
//! worse than letting a banned account slip one request through, and every
//! such failure is audit-logged.

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{error, info};

use crate::db::{db_blocking, DbPool};
use crate::models::audit_event::AuditEventBuilder;
use crate::models::user::User;
use crate::services::audit::AuditService;

/// Stored ban fields, detached from the account row for pure evaluation.
#[derive(Debug, Clone)]
pub struct BanState {
    pub is_banned: bool,
    pub ban_type: Option<String>,
    pub ban_expires_at: Option<NaiveDateTime>,
    pub ban_reason: Option<String>,
}

impl BanState {
    pub fn of(user: &User) -> Self {
        Self {
            is_banned: user.is_banned,
            ban_type: user.ban_type.clone(),
            ban_expires_at: user.ban_expires_at,
            ban_reason: user.ban_reason.clone(),
        }
    }
}

/// Effective standing after evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BanStanding {
    Clear,
    Banned {
        reason: String,
        ban_type: String,
        expires_at: Option<NaiveDateTime>,
    },
}

/// Write the evaluation asks the caller to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanMutation {
    /// Temporary ban has lapsed; clear the ban fields.
    ClearExpiredBan,
}

/// Pure two-step contract: decide the effective standing and report the
/// mutation (if any) separately, keeping the decision testable without a
/// store.
pub fn evaluate(ban: &BanState, now: NaiveDateTime) -> (BanStanding, Option<BanMutation>) {
    if !ban.is_banned {
        return (BanStanding::Clear, None);
    }

    let ban_type = ban.ban_type.as_deref().unwrap_or("permanent");

    if ban_type == "temporary" {
        if let Some(expires_at) = ban.ban_expires_at {
            if expires_at <= now {
                return (BanStanding::Clear, Some(BanMutation::ClearExpiredBan));
            }
        }
    }

    (
        BanStanding::Banned {
            reason: ban
                .ban_reason
                .clone()
                .unwrap_or_else(|| "account suspended".to_string()),
            ban_type: ban_type.to_string(),
            expires_at: ban.ban_expires_at,
        },
        None,
    )
}

/// Decision surfaced to callers of the guard.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "access", rename_all = "snake_case")]
pub enum AccessDecision {
    Allowed,
    Denied {
        reason: String,
        ban_type: String,
        expires_at: Option<NaiveDateTime>,
    },
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed)
    }
}

pub struct BanGuard {
    pool: DbPool,
    audit: AuditService,
}

impl BanGuard {
    pub fn new(pool: DbPool, audit: AuditService) -> Self {
        Self { pool, audit }
    }

    /// Check (and lazily heal) the ban standing of a user.
    ///
    /// Checked per request; never cached across requests, bounding
    /// staleness to one round trip.
    pub async fn check_access(&self, user_id: &str) -> AccessDecision {
        let id = user_id.to_string();
        let result = db_blocking(&self.pool, move |conn| {
            let Some(user) = User::find_by_id_opt(conn, &id)? else {
                // Unknown user: nothing to gate here; existence checks
                // belong to the operation itself.
                return Ok(AccessDecision::Allowed);
            };

            let (standing, mutation) = evaluate(&BanState::of(&user), chrono::Utc::now().naive_utc());

            if let Some(BanMutation::ClearExpiredBan) = mutation {
                User::clear_ban(conn, &id)?;
                info!(user_id = %id, "Expired temporary ban cleared on access");
            }

            Ok(match standing {
                BanStanding::Clear => AccessDecision::Allowed,
                BanStanding::Banned {
                    reason,
                    ban_type,
                    expires_at,
                } => AccessDecision::Denied {
                    reason,
                    ban_type,
                    expires_at,
                },
            })
        })
        .await;

        match result {
            Ok(decision) => {
                if let AccessDecision::Denied { reason, .. } = &decision {
                    self.audit.log_async(
                        AuditEventBuilder::new("ban.denied")
                            .actor(user_id)
                            .resource("user", user_id)
                            .metadata("reason", reason.clone()),
                    );
                }
                decision
            }
            Err(e) => {
                // Availability over strictness: the failure itself is the
                // thing that must be loud.
                error!(user_id, error = %e, "Ban check failed, failing open");
                self.audit.log_async(
                    AuditEventBuilder::new("ban.check_failed")
                        .actor(user_id)
                        .resource("user", user_id)
                        .metadata("error", e.to_string()),
                );
                AccessDecision::Allowed
            }
        }
    }
}
