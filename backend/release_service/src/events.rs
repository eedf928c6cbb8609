//! Row shape of the `audit_events` table.

use escrow_protocol::events::AuditEvent;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// An audit event as stored in / read from the database. `body` holds the
/// complete event; the remaining columns duplicate parts of it for queries.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRecord {
    pub campaign_id: i64,
    pub sequence: i64,
    pub kind: String,
    pub actor: String,
    pub recorded_at: String,
    pub prev_hash: String,
    pub hash: String,
    pub body: String,
}

impl EventRecord {
    pub fn from_event(event: &AuditEvent) -> Result<Self> {
        Ok(Self {
            campaign_id: event.campaign_id.0 as i64,
            sequence: event.sequence as i64,
            kind: event.payload.kind().to_string(),
            actor: event.actor.clone(),
            recorded_at: event.recorded_at.to_rfc3339(),
            prev_hash: event.prev_hash.clone(),
            hash: event.hash.clone(),
            body: serde_json::to_string(event)?,
        })
    }

    pub fn into_event(self) -> Result<AuditEvent> {
        Ok(serde_json::from_str(&self.body)?)
    }
}
