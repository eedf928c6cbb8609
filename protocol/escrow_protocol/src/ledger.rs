//! # Escrow ledger
//!
//! Per-campaign balance accounting. Nothing here mutates state: the `plan_*`
//! functions validate a requested movement against the current
//! [`CampaignView`] and return the [`EventPayload`] that records it. The
//! balance itself only changes when that payload is appended and folded
//! back into the view.
//!
//! | Movement | Event            | held      | released  |
//! |----------|------------------|-----------|-----------|
//! | pledge   | `PledgeRecorded` |           |           |
//! | hold     | `FundsHeld`      | `+amount` |           |
//! | release  | `FundsReleased`  |           | `+amount` |
//! | refund   | `FundsRefunded`  | `-amount` |           |
//!
//! `released ≤ held ≤ Σ donations` is enforced on every plan and re-checked
//! by [`crate::invariants`] after every append.

use crate::errors::{EscrowError, Result};
use crate::events::EventPayload;
use crate::projection::CampaignView;
use crate::types::{Amount, CampaignStatus, Donation, DonationId, Milestone, MilestoneId, MilestoneStatus};

fn require_positive(amount: Amount) -> Result<()> {
    if amount <= 0 {
        return Err(EscrowError::Validation(format!(
            "amount must be positive, got {amount}"
        )));
    }
    Ok(())
}

/// `current + amount`, or a validation error if the total leaves the
/// representable range.
pub fn checked_total(current: Amount, amount: Amount, what: &str) -> Result<Amount> {
    current.checked_add(amount).ok_or_else(|| {
        EscrowError::Validation(format!("{what} would exceed the maximum amount"))
    })
}

fn require_campaign_status(view: &CampaignView, allowed: &[CampaignStatus]) -> Result<()> {
    let status = view.campaign.status;
    if allowed.contains(&status) {
        Ok(())
    } else {
        Err(EscrowError::InvalidState(format!(
            "campaign {} is {:?}",
            view.campaign.id, status
        )))
    }
}

/// Funds held but neither released nor reserved by an in-flight payout of
/// any milestone other than `except`.
pub fn unreserved_available(view: &CampaignView, except: Option<MilestoneId>) -> Amount {
    let reserved: Amount = view
        .milestones
        .values()
        .filter(|m| Some(m.id) != except && m.disbursement.in_flight_attempt.is_some())
        .map(|m| m.disbursement.in_flight_amount)
        .sum();
    view.balances().available() - reserved
}

/// `min(target - already released, held - released)`, never negative.
pub fn releasable_amount(view: &CampaignView, milestone: &Milestone) -> Amount {
    let cap = milestone.target_amount - milestone.released_amount;
    cap.min(unreserved_available(view, Some(milestone.id))).max(0)
}

pub fn plan_pledge(view: &CampaignView, donor_id: &str, amount: Amount) -> Result<EventPayload> {
    require_positive(amount)?;
    require_campaign_status(view, &[CampaignStatus::Active])?;
    checked_total(view.campaign.pledged_amount, amount, "pledged total")?;
    Ok(EventPayload::PledgeRecorded {
        donor_id: donor_id.to_string(),
        amount,
    })
}

/// Plan a hold for a confirmed donation. Returns `None` when the donation is
/// already recorded, which makes replayed payment confirmations harmless.
pub fn plan_hold(
    view: &CampaignView,
    donation_id: DonationId,
    donor_id: &str,
    amount: Amount,
) -> Result<Option<EventPayload>> {
    require_positive(amount)?;
    if let Some(existing) = view.donations.iter().find(|d| d.id == donation_id) {
        if existing.amount != amount || existing.donor_id != donor_id {
            return Err(EscrowError::Validation(format!(
                "donation {donation_id} already recorded with different details"
            )));
        }
        return Ok(None);
    }
    require_campaign_status(view, &[CampaignStatus::Active])?;
    // Σ donations bounds `held`, so checking it covers both.
    checked_total(view.donations_total(), amount, "donated total")?;
    Ok(Some(EventPayload::FundsHeld {
        donation_id,
        donor_id: donor_id.to_string(),
        amount,
    }))
}

/// Plan a refund of unreleased funds. Completed campaigns stay refundable so
/// a shortfall left by an under-funded milestone can be returned.
pub fn plan_refund(view: &CampaignView, amount: Amount) -> Result<EventPayload> {
    require_positive(amount)?;
    require_campaign_status(
        view,
        &[CampaignStatus::Active, CampaignStatus::Completed, CampaignStatus::Cancelled],
    )?;
    let available = unreserved_available(view, None);
    if amount > available {
        return Err(EscrowError::InsufficientFunds {
            requested: amount,
            available,
        });
    }
    Ok(EventPayload::FundsRefunded { amount })
}

/// Plan the release entry for a payout the provider has confirmed.
pub fn plan_release(
    view: &CampaignView,
    milestone_id: MilestoneId,
    amount: Amount,
    attempt: u32,
    transaction_id: &str,
) -> Result<EventPayload> {
    require_positive(amount)?;
    let milestone = view.milestone(milestone_id)?;
    if milestone.status != MilestoneStatus::Verified {
        return Err(EscrowError::InvalidState(format!(
            "milestone {milestone_id} is {}, only verified milestones release",
            milestone.status
        )));
    }
    let cap = milestone.target_amount - milestone.released_amount;
    let available = unreserved_available(view, Some(milestone_id)).min(cap);
    if amount > available {
        return Err(EscrowError::InsufficientFunds {
            requested: amount,
            available,
        });
    }
    Ok(EventPayload::FundsReleased {
        milestone_id,
        amount,
        attempt,
        transaction_id: transaction_id.to_string(),
    })
}

/// Allocate a release against donations, oldest first.
pub(crate) fn allocate_release(donations: &mut [Donation], amount: Amount) {
    let mut left = amount;
    for donation in donations.iter_mut() {
        if left == 0 {
            break;
        }
        let take = donation.unallocated().min(left);
        donation.released += take;
        left -= take;
    }
}

/// Allocate a refund against donations, newest first.
pub(crate) fn allocate_refund(donations: &mut [Donation], amount: Amount) {
    let mut left = amount;
    for donation in donations.iter_mut().rev() {
        if left == 0 {
            break;
        }
        let take = donation.unallocated().min(left);
        donation.refunded += take;
        left -= take;
    }
}
