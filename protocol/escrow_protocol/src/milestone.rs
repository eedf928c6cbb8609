//! Milestone state machine.
//!
//! ```text
//!            submit            claim              verify            release
//! Pending ──────────► ProofSubmitted ──────► InReview ──────► Verified ──────► Released
//!    ▲                      ▲   unclaim/expiry  │  │ claim (expired lease)   │
//!    │                      └───────────────────┘  └──┐                      │ fail
//!    │ reopen                                         │ reject               ▼
//!    └──────────────────────────────────── Rejected ◄─┘                ReleaseFailed
//!                                              │ escalate
//!                                              ▼
//!                                        RejectedFinal
//! ```
//!
//! The table below is the only place that decides whether a transition is
//! legal; [`crate::projection`] consults it for every status-changing event,
//! so a replayed stream can never contain a skip transition.

use crate::errors::{EscrowError, Result};
use crate::types::{MilestoneId, MilestoneStatus};

/// What is being asked of the milestone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    SubmitProof,
    Claim,
    Unclaim,
    Verify,
    Reject,
    Reopen,
    Escalate,
    Release,
    FailRelease,
}

/// Target status for `trigger` applied in `from`, or `None` if illegal.
pub fn next_status(from: MilestoneStatus, trigger: Trigger) -> Option<MilestoneStatus> {
    use MilestoneStatus::*;
    match (from, trigger) {
        (Pending, Trigger::SubmitProof) => Some(ProofSubmitted),
        (ProofSubmitted, Trigger::Claim) => Some(InReview),
        // Re-claim after the previous lease expired.
        (InReview, Trigger::Claim) => Some(InReview),
        (InReview, Trigger::Unclaim) => Some(ProofSubmitted),
        (InReview, Trigger::Verify) => Some(Verified),
        (InReview, Trigger::Reject) => Some(Rejected),
        (Rejected, Trigger::Reopen) => Some(Pending),
        (Rejected, Trigger::Escalate) => Some(RejectedFinal),
        (Verified, Trigger::Release) => Some(Released),
        (Verified, Trigger::FailRelease) => Some(ReleaseFailed),
        _ => None,
    }
}

/// Like [`next_status`] but failing with `InvalidState`.
pub fn require(id: MilestoneId, from: MilestoneStatus, trigger: Trigger) -> Result<MilestoneStatus> {
    next_status(from, trigger).ok_or_else(|| {
        EscrowError::InvalidState(format!("milestone {id} cannot {trigger:?} while {from}"))
    })
}

/// Ensure `status` is exactly `expected`.
pub fn require_status(id: MilestoneId, status: MilestoneStatus, expected: MilestoneStatus) -> Result<()> {
    if status == expected {
        Ok(())
    } else {
        Err(EscrowError::InvalidState(format!(
            "milestone {id} is {status}, expected {expected}"
        )))
    }
}

/// Terminal statuses take no further triggers.
pub fn is_terminal(status: MilestoneStatus) -> bool {
    matches!(
        status,
        MilestoneStatus::Released | MilestoneStatus::RejectedFinal | MilestoneStatus::ReleaseFailed
    )
}
