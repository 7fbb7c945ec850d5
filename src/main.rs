use std::env;
use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::{Context, Result};
use tracing::{info, warn};

use server::chain::HttpChainClient;
use server::config::{FeeConfig, TimeoutConfig, TradeLimitsConfig, WebhookConfig};
use server::db::{create_pool, run_migrations, DbPool};
use server::handlers::{deposits, health, reviews, trades, users};
use server::services::audit::AuditService;
use server::services::ban_guard::BanGuard;
use server::services::chain_monitor::{ChainMonitor, MonitorConfig};
use server::services::reconciler::ReconciliationCoordinator;
use server::services::reputation::ReputationLedger;
use server::services::state_machine::EscrowStateMachine;
use server::services::timeout_monitor::TimeoutMonitor;
use server::telemetry::init_telemetry;

#[actix_web::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_telemetry();

    let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| "localstable.db".to_string());
    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    let pool: DbPool = create_pool(&database_url).context("Failed to create database pool")?;
    run_migrations(&pool).context("Failed to run migrations")?;
    info!(database = %database_url, "Database ready");

    let fee_config = FeeConfig::from_env();
    let timeout_config = TimeoutConfig::from_env();
    let limits_config = TradeLimitsConfig::from_env();
    let webhook_config = WebhookConfig::from_env();

    let audit = AuditService::new(pool.clone());
    audit
        .initialize()
        .await
        .context("Failed to initialize audit chain")?;

    let reconciler = Arc::new(ReconciliationCoordinator::new(pool.clone(), audit.clone()));
    let state_machine = web::Data::new(EscrowStateMachine::new(
        pool.clone(),
        fee_config.clone(),
        audit.clone(),
    ));
    let ban_guard = web::Data::new(BanGuard::new(pool.clone(), audit.clone()));
    let reputation = web::Data::new(ReputationLedger::new(pool.clone(), audit.clone()));

    // Poll sweep: the reliability fallback behind the webhook. Optional so
    // webhook-only deployments can run without a gateway URL.
    match env::var("CHAIN_GATEWAY_URL") {
        Ok(gateway_url) if !gateway_url.is_empty() => {
            let monitor_config = MonitorConfig::from_env();
            let client = Arc::new(
                HttpChainClient::new(gateway_url, monitor_config.request_timeout_secs)
                    .context("Failed to build chain client")?,
            );
            let monitor = ChainMonitor::new(
                client,
                pool.clone(),
                Arc::clone(&reconciler),
                monitor_config,
            );
            tokio::spawn(async move { monitor.start().await });
        }
        _ => {
            warn!("CHAIN_GATEWAY_URL not set - poll sweep disabled, webhook is the only delivery path");
        }
    }

    let sweep = TimeoutMonitor::new(pool.clone(), audit.clone(), timeout_config.clone());
    tokio::spawn(async move { sweep.start().await });

    let pool_data = web::Data::new(pool);
    let audit_data = web::Data::new(audit);
    let reconciler_data = web::Data::new(reconciler);
    let webhook_data = web::Data::new(webhook_config);
    let limits_data = web::Data::new(limits_config);
    let timeouts_data = web::Data::new(timeout_config);

    info!(addr = %bind_addr, "Starting LocalStable server");

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(pool_data.clone())
            .app_data(audit_data.clone())
            .app_data(reconciler_data.clone())
            .app_data(webhook_data.clone())
            .app_data(limits_data.clone())
            .app_data(timeouts_data.clone())
            .app_data(state_machine.clone())
            .app_data(ban_guard.clone())
            .app_data(reputation.clone())
            .service(health::health_check)
            .service(health::readiness_probe)
            .service(health::liveness_probe)
            .service(
                web::scope("/api")
                    .service(users::create_user)
                    .service(users::get_user)
                    .service(users::check_access)
                    .service(users::ban_user)
                    .service(trades::create_trade)
                    .service(trades::get_trade)
                    .service(trades::get_trade_transitions)
                    .service(trades::mark_fiat_sent)
                    .service(trades::confirm_fiat_received)
                    .service(trades::raise_dispute)
                    .service(trades::resolve_dispute)
                    .service(trades::cancel_trade)
                    .service(deposits::deposit_webhook)
                    .service(reviews::submit_review)
                    .service(reviews::get_reputation)
                    .service(reviews::list_reviews),
            )
    })
    .bind(&bind_addr)
    .context("Failed to bind HTTP server")?
    .run()
    .await
    .context("HTTP server terminated")
}
