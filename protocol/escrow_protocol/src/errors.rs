//! Protocol-wide error types.

use thiserror::Error;

use crate::types::{Amount, CampaignId};

#[derive(Debug, Error)]
pub enum EscrowError {
    /// Malformed or incomplete input. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authorization error: {actor} may not {action}")]
    Authorization { actor: String, action: String },

    /// Lost an optimistic-concurrency or lease race; refresh and retry.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: Amount, available: Amount },

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Campaign {campaign_id} is frozen pending reconciliation: {reason}")]
    CampaignFrozen { campaign_id: CampaignId, reason: String },

    #[error("Invariant violated on campaign {campaign_id}: {detail}")]
    InvariantViolation { campaign_id: CampaignId, detail: String },

    #[error("Audit chain broken on campaign {campaign_id} at sequence {sequence}")]
    ChainBroken { campaign_id: CampaignId, sequence: u64 },

    #[error("Event store error: {0}")]
    Storage(String),
}

impl EscrowError {
    /// `true` when the caller should refresh state and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub(crate) fn denied(actor: &str, action: impl std::fmt::Display) -> Self {
        Self::Authorization {
            actor: actor.to_string(),
            action: action.to_string(),
        }
    }
}

impl From<serde_json::Error> for EscrowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, EscrowError>;
