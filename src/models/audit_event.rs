//! Audit event model
//!
//! Tamper-evident, append-only audit trail with hash chaining. Every state
//! transition, correlation failure, ban denial, and webhook-signature
//! rejection lands here for the surrounding system to relay.
//!
//! SECURITY: never stores raw payloads or full transaction hashes in
//! metadata; callers pass sanitized values.

use anyhow::{Context, Result};
use chrono::Utc;
use diesel::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::schema::audit_events;

#[derive(Debug, Clone, Queryable, Serialize)]
#[diesel(table_name = audit_events)]
pub struct AuditEvent {
    pub id: String,
    pub event_type: String,
    pub actor_id: Option<String>,
    pub resource_type: String,
    pub resource_id: String,
    pub metadata: Option<String>,
    pub prev_hash: Option<String>,
    pub record_hash: String,
    pub created_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = audit_events)]
struct NewAuditEvent {
    id: String,
    event_type: String,
    actor_id: Option<String>,
    resource_type: String,
    resource_id: String,
    metadata: Option<String>,
    prev_hash: Option<String>,
    record_hash: String,
    created_at: String,
}

/// Builder for audit events
///
/// `event_type` uses dot notation ("trade.funded", "deposit.rejected",
/// "ban.denied").
#[derive(Debug, Clone)]
pub struct AuditEventBuilder {
    event_type: String,
    actor_id: Option<String>,
    resource_type: String,
    resource_id: String,
    metadata: serde_json::Value,
}

impl AuditEventBuilder {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            actor_id: None,
            resource_type: String::new(),
            resource_id: String::new(),
            metadata: serde_json::json!({}),
        }
    }

    pub fn actor(mut self, id: impl Into<String>) -> Self {
        self.actor_id = Some(id.into());
        self
    }

    pub fn resource(mut self, resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        self.resource_type = resource_type.into();
        self.resource_id = id.into();
        self
    }

    pub fn metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata[key] = value.into();
        self
    }

    /// Persist the event, chaining it to the previous record hash.
    pub fn build(self, conn: &mut SqliteConnection, prev_hash: Option<String>) -> Result<AuditEvent> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();
        let metadata = if self.metadata.as_object().map(|m| m.is_empty()).unwrap_or(true) {
            None
        } else {
            Some(self.metadata.to_string())
        };

        let record_hash = compute_record_hash(
            prev_hash.as_deref(),
            &id,
            &self.event_type,
            &self.resource_type,
            &self.resource_id,
            metadata.as_deref(),
            &created_at,
        );

        let row = NewAuditEvent {
            id: id.clone(),
            event_type: self.event_type,
            actor_id: self.actor_id,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            metadata,
            prev_hash,
            record_hash,
            created_at,
        };

        diesel::insert_into(audit_events::table)
            .values(&row)
            .execute(conn)
            .context("Failed to insert audit event")?;

        audit_events::table
            .filter(audit_events::id.eq(id))
            .first(conn)
            .context("Failed to retrieve created audit event")
    }
}

fn compute_record_hash(
    prev_hash: Option<&str>,
    id: &str,
    event_type: &str,
    resource_type: &str,
    resource_id: &str,
    metadata: Option<&str>,
    created_at: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.unwrap_or("genesis").as_bytes());
    hasher.update(id.as_bytes());
    hasher.update(event_type.as_bytes());
    hasher.update(resource_type.as_bytes());
    hasher.update(resource_id.as_bytes());
    hasher.update(metadata.unwrap_or("").as_bytes());
    hasher.update(created_at.as_bytes());
    hex::encode(hasher.finalize())
}

impl AuditEvent {
    /// Hash of the most recent record, for chain continuation after restart
    pub fn get_last_hash(conn: &mut SqliteConnection) -> Result<Option<String>> {
        let last: Option<AuditEvent> = audit_events::table
            .order(audit_events::created_at.desc())
            .first(conn)
            .optional()
            .context("Failed to read last audit event")?;
        Ok(last.map(|e| e.record_hash))
    }

    pub fn find_by_resource(
        conn: &mut SqliteConnection,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Vec<AuditEvent>> {
        audit_events::table
            .filter(audit_events::resource_type.eq(resource_type))
            .filter(audit_events::resource_id.eq(resource_id))
            .order(audit_events::created_at.asc())
            .load(conn)
            .context("Failed to load audit events for resource")
    }

    pub fn find_by_type(conn: &mut SqliteConnection, event_type: &str) -> Result<Vec<AuditEvent>> {
        audit_events::table
            .filter(audit_events::event_type.eq(event_type))
            .order(audit_events::created_at.asc())
            .load(conn)
            .context("Failed to load audit events by type")
    }

    /// Walk the chain and return the ids of records whose hash does not
    /// match their contents or whose prev link is broken.
    pub fn verify_chain_integrity(conn: &mut SqliteConnection) -> Result<Vec<String>> {
        let events: Vec<AuditEvent> = audit_events::table
            .order(audit_events::created_at.asc())
            .load(conn)
            .context("Failed to load audit events for verification")?;

        let mut broken = Vec::new();
        let mut expected_prev: Option<String> = None;

        for event in events {
            let recomputed = compute_record_hash(
                event.prev_hash.as_deref(),
                &event.id,
                &event.event_type,
                &event.resource_type,
                &event.resource_id,
                event.metadata.as_deref(),
                &event.created_at,
            );
            if recomputed != event.record_hash || event.prev_hash != expected_prev {
                broken.push(event.id.clone());
            }
            expected_prev = Some(event.record_hash);
        }

        Ok(broken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_hash_deterministic() {
        let a = compute_record_hash(None, "id", "trade.funded", "trade", "t1", None, "now");
        let b = compute_record_hash(None, "id", "trade.funded", "trade", "t1", None, "now");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_record_hash_chains() {
        let a = compute_record_hash(None, "id", "trade.funded", "trade", "t1", None, "now");
        let b = compute_record_hash(Some(&a), "id", "trade.funded", "trade", "t1", None, "now");
        assert_ne!(a, b);
    }
}
