//! Canonical audit events.
//!
//! Every state change in the protocol is one [`AuditEvent`] appended to the
//! owning campaign's stream. Events are hash-chained per campaign: `hash`
//! covers the event's own fields plus `prev_hash`, and the first event of a
//! stream links to [`GENESIS_HASH`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{EscrowError, Result};
use crate::types::{
    Amount, CampaignId, Decision, DonationId, LedgerEntry, LedgerEntryKind, MilestoneId,
    Priority, SubmissionId,
};

pub const GENESIS_HASH: &str = "GENESIS";

/// Payload of an audit event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    CampaignCreated {
        charity_id: String,
        goal_amount: Amount,
        deadline: DateTime<Utc>,
        payout_account: String,
        parallel_release: bool,
    },
    MilestoneAdded {
        milestone_id: MilestoneId,
        sequence_index: u32,
        target_amount: Amount,
    },
    CampaignActivated,
    CampaignCancelled {
        reason: String,
    },
    CampaignCompleted,
    PledgeRecorded {
        donor_id: String,
        amount: Amount,
    },
    FundsHeld {
        donation_id: DonationId,
        donor_id: String,
        amount: Amount,
    },
    FundsRefunded {
        amount: Amount,
    },
    ProofSubmitted {
        submission_id: SubmissionId,
        milestone_id: MilestoneId,
        artifact_refs: Vec<String>,
    },
    ReviewClaimed {
        submission_id: SubmissionId,
        milestone_id: MilestoneId,
        reviewer_id: String,
        lease_expires_at: DateTime<Utc>,
    },
    ReviewUnclaimed {
        submission_id: SubmissionId,
        milestone_id: MilestoneId,
        expired: bool,
    },
    SubmissionPrioritized {
        submission_id: SubmissionId,
        milestone_id: MilestoneId,
        priority: Priority,
    },
    ProofDecided {
        submission_id: SubmissionId,
        milestone_id: MilestoneId,
        decision: Decision,
        comment: Option<String>,
    },
    ResubmissionOpened {
        milestone_id: MilestoneId,
        attempt: u32,
    },
    MilestoneEscalated {
        milestone_id: MilestoneId,
        rejections: u32,
    },
    PayoutAttempted {
        milestone_id: MilestoneId,
        attempt: u32,
        amount: Amount,
        idempotency_key: String,
    },
    PayoutAttemptFailed {
        milestone_id: MilestoneId,
        attempt: u32,
        reason: String,
        retryable: bool,
        next_eligible_at: Option<DateTime<Utc>>,
    },
    FundsReleased {
        milestone_id: MilestoneId,
        amount: Amount,
        attempt: u32,
        transaction_id: String,
    },
    ReleaseFailed {
        milestone_id: MilestoneId,
        attempts: u32,
        reason: String,
    },
    RefundCandidateRecorded {
        milestone_id: MilestoneId,
        amount: Amount,
    },
    InvariantViolated {
        detail: String,
    },
    ReconciliationCleared {
        note: String,
    },
}

impl EventPayload {
    /// Short identifier suitable for logs and storage columns.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CampaignCreated { .. } => "campaign_created",
            Self::MilestoneAdded { .. } => "milestone_added",
            Self::CampaignActivated => "campaign_activated",
            Self::CampaignCancelled { .. } => "campaign_cancelled",
            Self::CampaignCompleted => "campaign_completed",
            Self::PledgeRecorded { .. } => "pledge_recorded",
            Self::FundsHeld { .. } => "funds_held",
            Self::FundsRefunded { .. } => "funds_refunded",
            Self::ProofSubmitted { .. } => "proof_submitted",
            Self::ReviewClaimed { .. } => "review_claimed",
            Self::ReviewUnclaimed { .. } => "review_unclaimed",
            Self::SubmissionPrioritized { .. } => "submission_prioritized",
            Self::ProofDecided { .. } => "proof_decided",
            Self::ResubmissionOpened { .. } => "resubmission_opened",
            Self::MilestoneEscalated { .. } => "milestone_escalated",
            Self::PayoutAttempted { .. } => "payout_attempted",
            Self::PayoutAttemptFailed { .. } => "payout_attempt_failed",
            Self::FundsReleased { .. } => "funds_released",
            Self::ReleaseFailed { .. } => "release_failed",
            Self::RefundCandidateRecorded { .. } => "refund_candidate_recorded",
            Self::InvariantViolated { .. } => "invariant_violated",
            Self::ReconciliationCleared { .. } => "reconciliation_cleared",
        }
    }

    /// Events that may still be appended to a frozen campaign.
    pub fn allowed_while_frozen(&self) -> bool {
        matches!(
            self,
            Self::InvariantViolated { .. } | Self::ReconciliationCleared { .. }
        )
    }

    /// The ledger view of this payload, if it is a financial fact.
    fn ledger_fact(&self) -> Option<(LedgerEntryKind, Option<MilestoneId>, Amount)> {
        match self {
            Self::PledgeRecorded { amount, .. } => Some((LedgerEntryKind::Pledge, None, *amount)),
            Self::FundsHeld { amount, .. } => Some((LedgerEntryKind::Hold, None, *amount)),
            Self::FundsRefunded { amount } => Some((LedgerEntryKind::Refund, None, *amount)),
            Self::FundsReleased {
                milestone_id,
                amount,
                ..
            } => Some((LedgerEntryKind::Release, Some(*milestone_id), *amount)),
            _ => None,
        }
    }
}

/// One entry of a campaign's audit stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub campaign_id: CampaignId,
    /// Per-campaign sequence number, starting at 1.
    pub sequence: u64,
    pub actor: String,
    pub recorded_at: DateTime<Utc>,
    pub payload: EventPayload,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEvent {
    /// Build a sealed event that links to `prev_hash`.
    pub fn seal(
        campaign_id: CampaignId,
        sequence: u64,
        actor: &str,
        recorded_at: DateTime<Utc>,
        payload: EventPayload,
        prev_hash: &str,
    ) -> Result<Self> {
        let mut event = AuditEvent {
            campaign_id,
            sequence,
            actor: actor.to_string(),
            recorded_at,
            payload,
            prev_hash: prev_hash.to_string(),
            hash: String::new(),
        };
        event.hash = calculate_hash(&event)?;
        Ok(event)
    }

    /// Project this event onto the ledger, if it is a financial fact.
    pub fn ledger_entry(&self) -> Option<LedgerEntry> {
        let (kind, milestone_id, amount) = self.payload.ledger_fact()?;
        Some(LedgerEntry {
            id: format!("{}:{}", self.campaign_id, self.sequence),
            campaign_id: self.campaign_id,
            milestone_id,
            kind,
            amount,
            sequence_number: self.sequence,
            actor: self.actor.clone(),
            timestamp: self.recorded_at,
        })
    }
}

/// SHA-256 over every field except `hash`.
pub fn calculate_hash(event: &AuditEvent) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(event.campaign_id.0.to_le_bytes());
    hasher.update(event.sequence.to_le_bytes());
    hasher.update(event.prev_hash.as_bytes());
    hasher.update(event.recorded_at.to_rfc3339().as_bytes());
    hasher.update(event.actor.as_bytes());
    hasher.update(serde_json::to_vec(&event.payload)?);
    Ok(hex::encode(hasher.finalize()))
}

/// Verify that `events` form an unbroken chain for one campaign, starting at
/// sequence 1.
pub fn verify_chain(campaign_id: CampaignId, events: &[AuditEvent]) -> Result<()> {
    let mut prev_hash = GENESIS_HASH.to_string();
    for (i, event) in events.iter().enumerate() {
        let expected_sequence = i as u64 + 1;
        let broken = event.campaign_id != campaign_id
            || event.sequence != expected_sequence
            || event.prev_hash != prev_hash
            || event.hash != calculate_hash(event)?;
        if broken {
            return Err(EscrowError::ChainBroken {
                campaign_id,
                sequence: expected_sequence,
            });
        }
        prev_hash = event.hash.clone();
    }
    Ok(())
}
