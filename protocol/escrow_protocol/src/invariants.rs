//! Ledger invariants, checked after every append.
//!
//! A failing check never lets the offending event into the stream: the audit
//! log records an `invariant_violated` event instead, which freezes the
//! campaign until an administrator clears it.

use std::collections::HashMap;

use crate::projection::CampaignView;
use crate::types::{Amount, MilestoneId, MilestoneStatus};

/// INV-1: `released ≤ held ≤ Σ donations`, and held equals donations net of
/// refunds.
pub fn check_balances(view: &CampaignView) -> Result<(), String> {
    let c = &view.campaign;
    let donated = view.donations_total();
    let refunded: Amount = view.donations.iter().map(|d| d.refunded).sum();
    if c.released_amount < 0 || c.released_amount > c.held_amount {
        return Err(format!(
            "released {} exceeds held {}",
            c.released_amount, c.held_amount
        ));
    }
    if c.held_amount > donated {
        return Err(format!("held {} exceeds donations {donated}", c.held_amount));
    }
    if c.held_amount != donated - refunded {
        return Err(format!(
            "held {} does not equal donations {donated} net of refunds {refunded}",
            c.held_amount
        ));
    }
    Ok(())
}

/// INV-3: per-milestone releases add up to the campaign's released amount,
/// and no milestone releases beyond its target.
pub fn check_milestone_totals(view: &CampaignView) -> Result<(), String> {
    let mut total: Amount = 0;
    for m in view.milestones.values() {
        if m.released_amount > m.target_amount {
            return Err(format!(
                "milestone {} released {} beyond target {}",
                m.id, m.released_amount, m.target_amount
            ));
        }
        total += m.released_amount;
    }
    if total != view.campaign.released_amount {
        return Err(format!(
            "milestones released {total}, campaign released {}",
            view.campaign.released_amount
        ));
    }
    Ok(())
}

/// INV-5: at most one undecided submission per milestone.
pub fn check_single_active_submission(view: &CampaignView) -> Result<(), String> {
    let mut active: HashMap<MilestoneId, usize> = HashMap::new();
    for s in view.submissions.values().filter(|s| s.is_active()) {
        let n = active.entry(s.milestone_id).or_default();
        *n += 1;
        if *n > 1 {
            return Err(format!(
                "milestone {} has more than one active submission",
                s.milestone_id
            ));
        }
    }
    Ok(())
}

/// INV-6: without parallel release, a released milestone has every
/// lower-index milestone released too.
pub fn check_release_order(view: &CampaignView) -> Result<(), String> {
    if view.campaign.parallel_release {
        return Ok(());
    }
    let mut gap: Option<MilestoneId> = None;
    for m in view.ordered_milestones() {
        match (m.status, gap) {
            (MilestoneStatus::Released, Some(unreleased)) => {
                return Err(format!(
                    "milestone {} released before milestone {unreleased}",
                    m.id
                ));
            }
            (MilestoneStatus::Released, None) => {}
            (_, None) => gap = Some(m.id),
            _ => {}
        }
    }
    Ok(())
}

/// Run every campaign invariant, reporting the first violation.
pub fn check_campaign(view: &CampaignView) -> Result<(), String> {
    check_balances(view)?;
    check_milestone_totals(view)?;
    check_single_active_submission(view)?;
    check_release_order(view)
}

/// Panicking form of [`check_campaign`] for tests.
#[cfg(test)]
pub fn assert_all_campaign_invariants(view: &CampaignView) {
    if let Err(detail) = check_campaign(view) {
        panic!("campaign {} invariant violated: {detail}", view.campaign.id);
    }
}
