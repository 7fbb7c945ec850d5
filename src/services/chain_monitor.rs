//! Chain polling sweep
//!
//! The reliability fallback behind the push webhook: periodically re-scans
//! the gateway's transfer listing for the monitored deposit addresses and
//! feeds every transfer through the same reconciliation path, so dedup and
//! per-trade serialization apply identically regardless of origin.
//!
//! The sweep collects candidates first and only then applies them; no lock
//! is held across the gateway call.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::future::join_all;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::chain::ChainClient;
use crate::db::{db_blocking, DbPool};
use crate::models::checkpoint::ChainCheckpoint;
use crate::services::correlator::{DepositSource, InboundDeposit};
use crate::services::reconciler::{ApplyOutcome, ReconciliationCoordinator};

/// Limits concurrent applications per sweep pass. Distinct trades reconcile
/// in parallel; same-trade events still serialize inside the coordinator.
const PARALLEL_BATCH_SIZE: usize = 8;

/// Configuration for chain polling
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// How often to re-scan the gateway (in seconds)
    pub poll_interval_secs: u64,
    /// Request timeout for gateway calls (in seconds)
    pub request_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            request_timeout_secs: 15,
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval_secs: std::env::var("CHAIN_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.poll_interval_secs),
            request_timeout_secs: std::env::var("CHAIN_REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.request_timeout_secs),
        }
    }
}

/// Counters from one sweep pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub fetched: usize,
    pub applied: usize,
    pub replayed: usize,
    pub dropped: usize,
}

pub struct ChainMonitor {
    client: Arc<dyn ChainClient>,
    pool: DbPool,
    reconciler: Arc<ReconciliationCoordinator>,
    config: MonitorConfig,
}

impl ChainMonitor {
    pub fn new(
        client: Arc<dyn ChainClient>,
        pool: DbPool,
        reconciler: Arc<ReconciliationCoordinator>,
        config: MonitorConfig,
    ) -> Self {
        info!(
            poll_interval = config.poll_interval_secs,
            "ChainMonitor initialized"
        );
        Self {
            client,
            pool,
            reconciler,
            config,
        }
    }

    /// Run the sweep loop forever. Errors are logged and the next tick
    /// retries; the dedup layer makes re-scanning always safe.
    pub async fn start(&self) {
        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_secs));
        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(stats) if stats.fetched > 0 => {
                    info!(
                        fetched = stats.fetched,
                        applied = stats.applied,
                        replayed = stats.replayed,
                        dropped = stats.dropped,
                        "Chain sweep pass complete"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Chain sweep pass failed");
                }
            }
        }
    }

    /// One collect-then-apply pass.
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        let since = db_blocking(&self.pool, ChainCheckpoint::current).await?;

        // Network first, with nothing held.
        let transfers = self.client.list_transfers(since).await?;

        let mut stats = SweepStats {
            fetched: transfers.len(),
            ..SweepStats::default()
        };
        if transfers.is_empty() {
            return Ok(stats);
        }

        let now = chrono::Utc::now().naive_utc();
        let mut max_cursor = since;

        for batch in transfers.chunks(PARALLEL_BATCH_SIZE) {
            let applications = batch.iter().map(|transfer| {
                let deposit = InboundDeposit {
                    source: DepositSource::Poll,
                    tx_hash: transfer.tx_hash.clone(),
                    sender_address: transfer.sender_address.clone(),
                    amount: transfer.amount,
                    memo: transfer.memo.clone(),
                    observed_at: now,
                };
                self.reconciler.apply_deposit(deposit)
            });

            for (transfer, result) in batch.iter().zip(join_all(applications).await) {
                max_cursor = max_cursor.max(transfer.cursor);
                match result {
                    Ok(ApplyOutcome::Applied { .. }) => stats.applied += 1,
                    Ok(ApplyOutcome::AlreadyApplied) => stats.replayed += 1,
                    Ok(ApplyOutcome::Dropped(_)) => stats.dropped += 1,
                    Err(e) => {
                        // Transient store trouble: leave the checkpoint
                        // where it was so the next pass re-delivers.
                        warn!(error = %e, "Deposit application failed during sweep");
                        return Ok(stats);
                    }
                }
            }
        }

        db_blocking(&self.pool, move |conn| {
            ChainCheckpoint::advance(conn, max_cursor)
        })
        .await?;

        Ok(stats)
    }
}
