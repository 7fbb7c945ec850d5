//! Health check endpoints for monitoring
//!
//! Load balancers and orchestrators poll these; nothing here touches
//! business state.

use actix_web::{get, web, HttpResponse, Responder};
use serde::Serialize;
use std::time::Instant;

use crate::db::DbPool;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub database: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: &'static str,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn healthy(latency_ms: u64) -> Self {
        Self {
            status: "healthy",
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    fn unhealthy(error: String) -> Self {
        Self {
            status: "unhealthy",
            latency_ms: None,
            error: Some(error),
        }
    }
}

/// GET /health
#[get("/health")]
pub async fn health_check(pool: web::Data<DbPool>) -> impl Responder {
    let db_health = check_database_health(&pool).await;

    let overall = if db_health.status == "healthy" {
        "healthy"
    } else {
        "unhealthy"
    };

    let response = HealthResponse {
        status: overall,
        service: "localstable",
        version: env!("CARGO_PKG_VERSION"),
        database: db_health,
    };

    if overall == "healthy" {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}

/// GET /ready - readiness probe
#[get("/ready")]
pub async fn readiness_probe(pool: web::Data<DbPool>) -> impl Responder {
    let db_ok = check_database_health(&pool).await.status == "healthy";
    if db_ok {
        HttpResponse::Ok().json(serde_json::json!({ "ready": true }))
    } else {
        HttpResponse::ServiceUnavailable().json(serde_json::json!({ "ready": false }))
    }
}

/// GET /live - liveness probe
#[get("/live")]
pub async fn liveness_probe() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "alive": true,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn check_database_health(pool: &DbPool) -> ComponentHealth {
    let start = Instant::now();

    match pool.get() {
        Ok(mut conn) => {
            let result = web::block(move || {
                use diesel::prelude::*;
                diesel::sql_query("SELECT 1 AS val").execute(&mut conn)
            })
            .await;

            match result {
                Ok(Ok(_)) => ComponentHealth::healthy(start.elapsed().as_millis() as u64),
                Ok(Err(e)) => ComponentHealth::unhealthy(format!("Query failed: {}", e)),
                Err(e) => ComponentHealth::unhealthy(format!("Block error: {}", e)),
            }
        }
        Err(e) => ComponentHealth::unhealthy(format!("Connection failed: {}", e)),
    }
}
