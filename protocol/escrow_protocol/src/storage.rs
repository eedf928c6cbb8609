//! # Storage
//!
//! The audit stream is the only durable artifact of the protocol. This
//! module defines the seam to whatever persists it:
//!
//! | Method      | Contract                                                   |
//! |-------------|------------------------------------------------------------|
//! | `append`    | Persist one sealed event; `Conflict` if `(campaign, sequence)` already exists |
//! | `load_all`  | Every persisted event, any order                           |
//!
//! Everything else (balances, milestone statuses, the verification queue) is
//! rebuilt from `load_all` at startup.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::{EscrowError, Result};
use crate::events::AuditEvent;

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: &AuditEvent) -> Result<()>;

    async fn load_all(&self) -> Result<Vec<AuditEvent>>;
}

/// Process-local store; used by tests and single-process deployments.
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. with a stream exported from another instance.
    pub fn with_events(events: Vec<AuditEvent>) -> Self {
        Self {
            events: Mutex::new(events),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<AuditEvent>>> {
        self.events
            .lock()
            .map_err(|_| EscrowError::Storage("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: &AuditEvent) -> Result<()> {
        let mut events = self.lock()?;
        let taken = events
            .iter()
            .any(|e| e.campaign_id == event.campaign_id && e.sequence == event.sequence);
        if taken {
            return Err(EscrowError::Conflict(format!(
                "sequence {} already persisted for campaign {}",
                event.sequence, event.campaign_id
            )));
        }
        events.push(event.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<AuditEvent>> {
        Ok(self.lock()?.clone())
    }
}
