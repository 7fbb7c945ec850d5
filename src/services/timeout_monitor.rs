//! Deadline sweep
//!
//! Trades evaluate their deadlines lazily whenever they are touched; this
//! worker just touches the overdue ones so nothing waits for the next user
//! request. Each trade goes through the same `reconcile_deadlines` path the
//! access-time check uses, in its own transaction.

use std::time::Duration;

use anyhow::Result;
use tokio::time::interval;
use tracing::{error, info};

use crate::config::TimeoutConfig;
use crate::db::{db_blocking, DbPool};
use crate::models::audit_event::AuditEventBuilder;
use crate::models::trade::Trade;
use crate::services::audit::AuditService;
use crate::services::state_machine::reconcile_deadlines;

/// Counters from one sweep pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TimeoutSweepStats {
    pub expired: usize,
    pub escalated: usize,
}

pub struct TimeoutMonitor {
    pool: DbPool,
    audit: AuditService,
    config: TimeoutConfig,
}

impl TimeoutMonitor {
    pub fn new(pool: DbPool, audit: AuditService, config: TimeoutConfig) -> Self {
        info!(
            sweep_interval = config.sweep_interval_secs,
            "TimeoutMonitor initialized"
        );
        Self {
            pool,
            audit,
            config,
        }
    }

    pub async fn start(&self) {
        let mut ticker = interval(Duration::from_secs(self.config.sweep_interval_secs));
        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(stats) if stats.expired + stats.escalated > 0 => {
                    info!(
                        expired = stats.expired,
                        escalated = stats.escalated,
                        "Deadline sweep pass complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Deadline sweep pass failed"),
            }
        }
    }

    pub async fn sweep_once(&self) -> Result<TimeoutSweepStats> {
        let transitions = db_blocking(&self.pool, move |conn| {
            let now = chrono::Utc::now().naive_utc();
            let mut overdue = Trade::find_past_funding_deadline(conn, now)?;
            overdue.extend(Trade::find_past_trade_deadline(conn, now)?);

            let mut fired = Vec::new();
            for trade in overdue {
                let trade_id = trade.id.clone();
                let result = conn.immediate_transaction(|conn| {
                    let Some(trade) = Trade::find_by_id_opt(conn, &trade_id)? else {
                        return Ok(None);
                    };
                    reconcile_deadlines(conn, trade, now).map(Some)
                });
                match result {
                    Ok(Some((trade, Some(event)))) => fired.push((trade.id, event)),
                    Ok(_) => {}
                    Err(e) => {
                        // One stuck trade must not stall the rest of the sweep.
                        tracing::warn!(error = %e, "Deadline transition failed");
                    }
                }
            }
            Ok(fired)
        })
        .await?;

        let mut stats = TimeoutSweepStats::default();
        for (trade_id, event) in transitions {
            match event {
                "funding_expired" => stats.expired += 1,
                _ => stats.escalated += 1,
            }
            self.audit.log_async(
                AuditEventBuilder::new(format!("trade.{}", event)).resource("trade", trade_id),
            );
        }

        Ok(stats)
    }
}
