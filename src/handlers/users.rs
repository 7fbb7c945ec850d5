//! Account endpoints: registration and ban administration

use actix_web::{get, post, web, HttpResponse, Responder};
use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::db::{db_blocking, DbPool};
use crate::models::audit_event::AuditEventBuilder;
use crate::models::user::{NewUser, User};
use crate::services::audit::AuditService;
use crate::services::ban_guard::BanGuard;

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct BanRequest {
    pub admin_id: String,
    /// "permanent" or "temporary"
    pub ban_type: String,
    /// Required for temporary bans, "%Y-%m-%dT%H:%M:%S" UTC
    pub expires_at: Option<String>,
    pub reason: String,
}

/// POST /api/users
#[post("/users")]
pub async fn create_user(
    pool: web::Data<DbPool>,
    body: web::Json<CreateUserRequest>,
) -> impl Responder {
    let username = body.username.trim().to_string();
    if username.is_empty() || username.len() > 64 {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "username must be 1-64 characters"
        }));
    }

    let result = db_blocking(&pool, move |conn| {
        User::create(conn, NewUser::with_username(&username))
    })
    .await;

    match result {
        Ok(user) => HttpResponse::Created().json(user),
        Err(e) => {
            let message = format!("{:?}", e);
            if message.contains("UNIQUE constraint failed") {
                HttpResponse::Conflict().json(serde_json::json!({
                    "error": "username already taken"
                }))
            } else {
                tracing::error!(error = %e, "Failed to create user");
                HttpResponse::InternalServerError().json(serde_json::json!({
                    "error": "failed to create user"
                }))
            }
        }
    }
}

/// GET /api/users/{id}
#[get("/users/{id}")]
pub async fn get_user(pool: web::Data<DbPool>, path: web::Path<String>) -> impl Responder {
    let user_id = path.into_inner();
    let result = db_blocking(&pool, move |conn| User::find_by_id_opt(conn, &user_id)).await;
    match result {
        Ok(Some(user)) => HttpResponse::Ok().json(user),
        Ok(None) => HttpResponse::NotFound().json(serde_json::json!({ "error": "user not found" })),
        Err(e) => {
            tracing::error!(error = %e, "Failed to load user");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "failed to load user"
            }))
        }
    }
}

/// GET /api/users/{id}/access - current ban standing (self-healing check)
#[get("/users/{id}/access")]
pub async fn check_access(
    ban_guard: web::Data<BanGuard>,
    path: web::Path<String>,
) -> impl Responder {
    HttpResponse::Ok().json(ban_guard.check_access(&path.into_inner()).await)
}

/// POST /api/users/{id}/ban - admin
#[post("/users/{id}/ban")]
pub async fn ban_user(
    pool: web::Data<DbPool>,
    audit: web::Data<AuditService>,
    path: web::Path<String>,
    body: web::Json<BanRequest>,
) -> impl Responder {
    let user_id = path.into_inner();

    if !matches!(body.ban_type.as_str(), "permanent" | "temporary") {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "ban_type must be 'permanent' or 'temporary'"
        }));
    }

    let expires_at = match (body.ban_type.as_str(), &body.expires_at) {
        ("temporary", Some(raw)) => {
            match NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
                Ok(at) => Some(at),
                Err(_) => {
                    return HttpResponse::BadRequest().json(serde_json::json!({
                        "error": "expires_at must be %Y-%m-%dT%H:%M:%S UTC"
                    }));
                }
            }
        }
        ("temporary", None) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": "temporary bans require expires_at"
            }));
        }
        _ => None,
    };

    let id = user_id.clone();
    let ban_type = body.ban_type.clone();
    let reason = body.reason.clone();
    let result = db_blocking(&pool, move |conn| {
        if User::find_by_id_opt(conn, &id)?.is_none() {
            return Ok(false);
        }
        User::set_ban(conn, &id, &ban_type, expires_at, &reason)?;
        Ok(true)
    })
    .await;

    match result {
        Ok(true) => {
            audit.log_async(
                AuditEventBuilder::new("ban.applied")
                    .actor(body.admin_id.clone())
                    .resource("user", user_id.clone())
                    .metadata("ban_type", body.ban_type.clone())
                    .metadata("reason", body.reason.clone()),
            );
            HttpResponse::Ok().json(serde_json::json!({ "banned": user_id }))
        }
        Ok(false) => {
            HttpResponse::NotFound().json(serde_json::json!({ "error": "user not found" }))
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to ban user");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "failed to ban user"
            }))
        }
    }
}
