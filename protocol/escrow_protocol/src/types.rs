//! # Types
//!
//! Shared data structures used across all modules of the escrow protocol.
//!
//! ## Design decisions
//!
//! ### Views, not records
//!
//! Every struct in this module except [`NewCampaign`] is a *view*: it is
//! produced by folding the campaign's audit stream (see
//! [`crate::projection`]) and is never written back anywhere. Mutating one of
//! these values has no effect on the protocol.
//!
//! ### Status as a Finite-State Machine
//!
//! [`CampaignStatus`] is forward-only:
//!
//! ```text
//! Draft ──► Active ──► Completed
//!   │          │
//!   └──────────┴──► Cancelled
//! ```
//!
//! [`MilestoneStatus`] transitions are listed in [`crate::milestone`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monetary amount in integral minor units.
pub type Amount = i64;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Campaign identifier (auto-incremented, starts at 1).
    CampaignId,
    "cmp"
);
id_type!(
    /// Milestone identifier, unique across all campaigns.
    MilestoneId,
    "ms"
);
id_type!(
    /// Proof submission identifier, unique across all campaigns.
    SubmissionId,
    "sub"
);
id_type!(
    /// Donation identifier supplied by the payment confirmation.
    DonationId,
    "don"
);

/// Lifecycle status of a campaign.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Milestones may still be added; no donations accepted.
    Draft,
    /// Accepting donations and proofs.
    Active,
    /// Every milestone has been released.
    Completed,
    /// Stopped by the charity or an administrator.
    Cancelled,
}

impl CampaignStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Lifecycle status of a milestone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    ProofSubmitted,
    InReview,
    Verified,
    Rejected,
    /// Resubmission budget exhausted; needs manual escalation.
    RejectedFinal,
    Released,
    /// Payout retries exhausted or refused; needs manual reconciliation.
    ReleaseFailed,
}

impl MilestoneStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ProofSubmitted => "proof_submitted",
            Self::InReview => "in_review",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
            Self::RejectedFinal => "rejected_final",
            Self::Released => "released",
            Self::ReleaseFailed => "release_failed",
        }
    }
}

impl fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reviewer verdict on a proof submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Verified,
    Rejected,
}

/// Verification queue priority. Escalated items are always served first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    Escalated,
}

/// Input for [`crate::EscrowProtocol::create_campaign`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewCampaign {
    pub goal_amount: Amount,
    pub deadline: DateTime<Utc>,
    /// Account the payout provider credits on release.
    pub payout_account: String,
    /// Allow milestones to release out of `sequence_index` order.
    #[serde(default)]
    pub parallel_release: bool,
    /// Milestone targets, in release order.
    #[serde(default)]
    pub milestones: Vec<Amount>,
}

/// Campaign header and balances.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub charity_id: String,
    pub goal_amount: Amount,
    pub deadline: DateTime<Utc>,
    pub payout_account: String,
    pub parallel_release: bool,
    pub status: CampaignStatus,
    /// Confirmed donations net of refunds. Released funds stay counted here.
    pub held_amount: Amount,
    pub released_amount: Amount,
    /// Unconfirmed pledges; informational only.
    pub pledged_amount: Amount,
    /// Set while an invariant violation awaits manual reconciliation.
    pub frozen: Option<String>,
}

/// Snapshot of a campaign's escrow balances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    pub held: Amount,
    pub released: Amount,
    pub pledged: Amount,
}

impl Balances {
    /// Funds held but not yet released.
    pub fn available(&self) -> Amount {
        self.held - self.released
    }
}

/// Persisted payout retry state for a milestone.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisbursementState {
    /// Number of payout attempts started so far.
    pub attempts: u32,
    /// Attempt started but not yet concluded (survives restarts).
    pub in_flight_attempt: Option<u32>,
    /// Amount requested by the in-flight attempt.
    pub in_flight_amount: Amount,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub last_failure: Option<String>,
    pub transaction_id: Option<String>,
    pub released_at: Option<DateTime<Utc>>,
    /// Amount whose release was cancelled mid-flight.
    pub refund_candidate: Option<Amount>,
}

/// A funding checkpoint within a campaign.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: MilestoneId,
    pub campaign_id: CampaignId,
    pub sequence_index: u32,
    pub target_amount: Amount,
    pub status: MilestoneStatus,
    pub released_amount: Amount,
    /// Number of rejected submissions so far.
    pub rejections: u32,
    pub active_submission: Option<SubmissionId>,
    pub disbursement: DisbursementState,
}

/// Evidence offered for a milestone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofSubmission {
    pub id: SubmissionId,
    pub milestone_id: MilestoneId,
    pub submitted_by: String,
    pub artifact_refs: Vec<String>,
    pub submitted_at: DateTime<Utc>,
    pub reviewer_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub decision: Option<Decision>,
    pub decision_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
    /// Queue priority set by an administrator; deadline escalation is
    /// computed by the queue and never stored here.
    #[serde(default)]
    pub priority: Priority,
}

impl ProofSubmission {
    /// A submission stays active until a reviewer decides on it.
    pub fn is_active(&self) -> bool {
        self.decision.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonationStatus {
    Held,
    ReleasedAgainst,
    Refunded,
}

/// A confirmed donation. `released` and `refunded` record how much of it has
/// been allocated to releases (oldest-first) and refunds (newest-first).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Donation {
    pub id: DonationId,
    pub donor_id: String,
    pub campaign_id: CampaignId,
    pub amount: Amount,
    pub timestamp: DateTime<Utc>,
    pub released: Amount,
    pub refunded: Amount,
}

impl Donation {
    /// Portion not yet allocated to a release or refund.
    pub fn unallocated(&self) -> Amount {
        self.amount - self.released - self.refunded
    }

    pub fn status(&self) -> DonationStatus {
        if self.released > 0 {
            DonationStatus::ReleasedAgainst
        } else if self.refunded == self.amount {
            DonationStatus::Refunded
        } else {
            DonationStatus::Held
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    Pledge,
    Hold,
    Release,
    Refund,
}

/// An immutable financial fact, read off the audit stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub campaign_id: CampaignId,
    pub milestone_id: Option<MilestoneId>,
    pub kind: LedgerEntryKind,
    pub amount: Amount,
    pub sequence_number: u64,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of [`crate::EscrowProtocol::disburse`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DisbursementResult {
    Released {
        milestone_id: MilestoneId,
        amount: Amount,
        transaction_id: String,
        attempts: u32,
    },
    /// Nothing payable yet; the milestone stays `verified`.
    Deferred { milestone_id: MilestoneId },
    /// A retry is already scheduled for later.
    Scheduled {
        milestone_id: MilestoneId,
        next_eligible_at: DateTime<Utc>,
    },
    Failed {
        milestone_id: MilestoneId,
        attempts: u32,
        reason: String,
    },
    /// The campaign was cancelled; `refund_candidate` was not paid out.
    Cancelled {
        milestone_id: MilestoneId,
        refund_candidate: Amount,
    },
}

/// Counters behind the administrator dashboard.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformStats {
    pub active_campaigns: usize,
    pub pending_verifications: usize,
    pub claimed_verifications: usize,
    pub awaiting_payout: usize,
    pub awaiting_payout_amount: Amount,
    pub release_failed: usize,
    pub frozen_campaigns: usize,
}
