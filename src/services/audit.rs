//! Audit service
//!
//! Centralized sink for the structured events the core emits on every state
//! transition, correlation failure and ban-guard denial. Records are
//! hash-chained; the last hash lives behind an async mutex so concurrent
//! writers chain correctly.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db::DbPool;
use crate::models::audit_event::{AuditEvent, AuditEventBuilder};

#[derive(Clone)]
pub struct AuditService {
    pool: DbPool,
    /// Last record hash for chain integrity (thread-safe)
    last_hash: Arc<Mutex<Option<String>>>,
}

impl AuditService {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            last_hash: Arc::new(Mutex::new(None)),
        }
    }

    /// Load the last hash from the store so the chain continues across
    /// restarts.
    pub async fn initialize(&self) -> Result<()> {
        let mut conn = self.pool.get().context("Failed to get DB connection")?;
        let hash = AuditEvent::get_last_hash(&mut conn)?;
        let mut last_hash = self.last_hash.lock().await;
        *last_hash = hash;
        Ok(())
    }

    /// Log an audit event with chain integrity.
    pub async fn log(&self, builder: AuditEventBuilder) -> Result<AuditEvent> {
        let mut conn = self.pool.get().context("Failed to get DB connection")?;
        let mut last_hash = self.last_hash.lock().await;

        let event = builder.build(&mut conn, last_hash.clone())?;
        *last_hash = Some(event.record_hash.clone());

        Ok(event)
    }

    /// Fire-and-forget logging for paths that must never block or fail the
    /// caller.
    pub fn log_async(&self, builder: AuditEventBuilder) {
        let pool = self.pool.clone();
        let last_hash = self.last_hash.clone();

        tokio::spawn(async move {
            let result = async {
                let mut conn = pool.get().context("Failed to get DB connection")?;
                let mut hash_guard = last_hash.lock().await;
                let event = builder.build(&mut conn, hash_guard.clone())?;
                *hash_guard = Some(event.record_hash.clone());
                Ok::<_, anyhow::Error>(())
            }
            .await;

            if let Err(e) = result {
                tracing::error!("Failed to log audit event: {}", e);
            }
        });
    }

    /// Verify the hash chain end to end.
    pub async fn verify_integrity(&self) -> Result<IntegrityReport> {
        let mut conn = self.pool.get().context("Failed to get DB connection")?;
        let broken_links = AuditEvent::verify_chain_integrity(&mut conn)?;

        Ok(IntegrityReport {
            is_valid: broken_links.is_empty(),
            broken_links,
            checked_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Audit trail for a specific resource.
    pub async fn trail_for(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<AuditEvent>> {
        let mut conn = self.pool.get().context("Failed to get DB connection")?;
        AuditEvent::find_by_resource(&mut conn, resource_type, resource_id)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IntegrityReport {
    pub is_valid: bool,
    pub broken_links: Vec<String>,
    pub checked_at: String,
}
