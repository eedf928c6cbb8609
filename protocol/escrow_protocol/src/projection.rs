//! Campaign projection: the fold of one campaign's audit stream.
//!
//! [`CampaignView`] is the only representation of campaign state the rest of
//! the crate reads. It is rebuilt from scratch by [`CampaignView::replay`] and
//! kept current by [`CampaignView::apply`]; there is no other way to change it.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::errors::{EscrowError, Result};
use crate::events::{AuditEvent, EventPayload, GENESIS_HASH};
use crate::ledger::{allocate_refund, allocate_release};
use crate::milestone::{self, Trigger};
use crate::types::{
    Amount, Balances, Campaign, CampaignStatus, Decision, DisbursementState,
    Donation, Milestone, MilestoneId, MilestoneStatus, Priority, ProofSubmission, SubmissionId,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CampaignView {
    pub campaign: Campaign,
    pub milestones: BTreeMap<MilestoneId, Milestone>,
    pub submissions: BTreeMap<SubmissionId, ProofSubmission>,
    pub donations: Vec<Donation>,
    /// Sequence number of the last applied event.
    pub head: u64,
    pub last_hash: String,
}

impl CampaignView {
    /// Fold a complete stream, starting from its `CampaignCreated` event.
    pub fn replay(events: &[AuditEvent]) -> Result<Self> {
        let (first, rest) = events
            .split_first()
            .ok_or_else(|| EscrowError::NotFound("empty campaign stream".to_string()))?;
        let mut view = Self::genesis(first)?;
        for event in rest {
            view.apply(event)?;
        }
        Ok(view)
    }

    /// Build the initial view from a campaign's first event.
    pub fn genesis(event: &AuditEvent) -> Result<Self> {
        let EventPayload::CampaignCreated {
            charity_id,
            goal_amount,
            deadline,
            payout_account,
            parallel_release,
        } = &event.payload
        else {
            return Err(EscrowError::InvalidState(format!(
                "campaign {} stream must start with campaign_created, found {}",
                event.campaign_id,
                event.payload.kind()
            )));
        };
        if event.sequence != 1 || event.prev_hash != GENESIS_HASH {
            return Err(EscrowError::ChainBroken {
                campaign_id: event.campaign_id,
                sequence: 1,
            });
        }
        Ok(Self {
            campaign: Campaign {
                id: event.campaign_id,
                charity_id: charity_id.clone(),
                goal_amount: *goal_amount,
                deadline: *deadline,
                payout_account: payout_account.clone(),
                parallel_release: *parallel_release,
                status: CampaignStatus::Draft,
                held_amount: 0,
                released_amount: 0,
                pledged_amount: 0,
                frozen: None,
            },
            milestones: BTreeMap::new(),
            submissions: BTreeMap::new(),
            donations: Vec::new(),
            head: 1,
            last_hash: event.hash.clone(),
        })
    }

    pub fn balances(&self) -> Balances {
        Balances {
            held: self.campaign.held_amount,
            released: self.campaign.released_amount,
            pledged: self.campaign.pledged_amount,
        }
    }

    pub fn milestone(&self, id: MilestoneId) -> Result<&Milestone> {
        self.milestones
            .get(&id)
            .ok_or_else(|| EscrowError::NotFound(format!("milestone {id}")))
    }

    pub fn submission(&self, id: SubmissionId) -> Result<&ProofSubmission> {
        self.submissions
            .get(&id)
            .ok_or_else(|| EscrowError::NotFound(format!("proof submission {id}")))
    }

    /// Milestones in release order.
    pub fn ordered_milestones(&self) -> Vec<&Milestone> {
        let mut ms: Vec<&Milestone> = self.milestones.values().collect();
        ms.sort_by_key(|m| m.sequence_index);
        ms
    }

    pub fn donations_total(&self) -> Amount {
        self.donations.iter().map(|d| d.amount).sum()
    }

    pub fn all_released(&self) -> bool {
        !self.milestones.is_empty()
            && self
                .milestones
                .values()
                .all(|m| m.status == MilestoneStatus::Released)
    }

    fn milestone_mut(&mut self, id: MilestoneId) -> Result<&mut Milestone> {
        self.milestones
            .get_mut(&id)
            .ok_or_else(|| EscrowError::NotFound(format!("milestone {id}")))
    }

    fn submission_mut(&mut self, id: SubmissionId) -> Result<&mut ProofSubmission> {
        self.submissions
            .get_mut(&id)
            .ok_or_else(|| EscrowError::NotFound(format!("proof submission {id}")))
    }

    fn transition(&mut self, id: MilestoneId, trigger: Trigger) -> Result<&mut Milestone> {
        let m = self.milestone_mut(id)?;
        m.status = milestone::require(id, m.status, trigger)?;
        Ok(m)
    }

    fn set_campaign_status(&mut self, from: &[CampaignStatus], to: CampaignStatus) -> Result<()> {
        if !from.contains(&self.campaign.status) {
            return Err(EscrowError::InvalidState(format!(
                "campaign {} cannot move from {:?} to {:?}",
                self.campaign.id, self.campaign.status, to
            )));
        }
        self.campaign.status = to;
        Ok(())
    }

    /// Fold one event into the view. The event must extend the chain.
    pub fn apply(&mut self, event: &AuditEvent) -> Result<()> {
        if event.campaign_id != self.campaign.id
            || event.sequence != self.head + 1
            || event.prev_hash != self.last_hash
        {
            return Err(EscrowError::ChainBroken {
                campaign_id: self.campaign.id,
                sequence: self.head + 1,
            });
        }
        if let Some(reason) = &self.campaign.frozen {
            if !event.payload.allowed_while_frozen() {
                return Err(EscrowError::CampaignFrozen {
                    campaign_id: self.campaign.id,
                    reason: reason.clone(),
                });
            }
        }

        match &event.payload {
            EventPayload::CampaignCreated { .. } => {
                return Err(EscrowError::InvalidState(format!(
                    "campaign {} already exists",
                    self.campaign.id
                )));
            }
            EventPayload::MilestoneAdded {
                milestone_id,
                sequence_index,
                target_amount,
            } => {
                if self.milestones.contains_key(milestone_id) {
                    return Err(EscrowError::InvalidState(format!(
                        "milestone {milestone_id} already exists"
                    )));
                }
                self.milestones.insert(
                    *milestone_id,
                    Milestone {
                        id: *milestone_id,
                        campaign_id: self.campaign.id,
                        sequence_index: *sequence_index,
                        target_amount: *target_amount,
                        status: MilestoneStatus::Pending,
                        released_amount: 0,
                        rejections: 0,
                        active_submission: None,
                        disbursement: DisbursementState::default(),
                    },
                );
            }
            EventPayload::CampaignActivated => {
                self.set_campaign_status(&[CampaignStatus::Draft], CampaignStatus::Active)?;
            }
            EventPayload::CampaignCancelled { .. } => {
                self.set_campaign_status(
                    &[CampaignStatus::Draft, CampaignStatus::Active],
                    CampaignStatus::Cancelled,
                )?;
            }
            EventPayload::CampaignCompleted => {
                self.set_campaign_status(&[CampaignStatus::Active], CampaignStatus::Completed)?;
            }
            EventPayload::PledgeRecorded { amount, .. } => {
                self.campaign.pledged_amount += amount;
            }
            EventPayload::FundsHeld {
                donation_id,
                donor_id,
                amount,
            } => {
                self.donations.push(Donation {
                    id: *donation_id,
                    donor_id: donor_id.clone(),
                    campaign_id: self.campaign.id,
                    amount: *amount,
                    timestamp: event.recorded_at,
                    released: 0,
                    refunded: 0,
                });
                self.campaign.held_amount += amount;
            }
            EventPayload::FundsRefunded { amount } => {
                self.campaign.held_amount -= amount;
                allocate_refund(&mut self.donations, *amount);
            }
            EventPayload::ProofSubmitted {
                submission_id,
                milestone_id,
                artifact_refs,
            } => {
                if let Some(active) = self.milestone(*milestone_id)?.active_submission {
                    return Err(EscrowError::InvalidState(format!(
                        "milestone {milestone_id} already has active submission {active}"
                    )));
                }
                let m = self.transition(*milestone_id, Trigger::SubmitProof)?;
                m.active_submission = Some(*submission_id);
                self.submissions.insert(
                    *submission_id,
                    ProofSubmission {
                        id: *submission_id,
                        milestone_id: *milestone_id,
                        submitted_by: event.actor.clone(),
                        artifact_refs: artifact_refs.clone(),
                        submitted_at: event.recorded_at,
                        reviewer_id: None,
                        lease_expires_at: None,
                        decision: None,
                        decision_at: None,
                        comment: None,
                        priority: Priority::Normal,
                    },
                );
            }
            EventPayload::ReviewClaimed {
                submission_id,
                milestone_id,
                reviewer_id,
                lease_expires_at,
            } => {
                self.transition(*milestone_id, Trigger::Claim)?;
                let s = self.submission_mut(*submission_id)?;
                s.reviewer_id = Some(reviewer_id.clone());
                s.lease_expires_at = Some(*lease_expires_at);
            }
            EventPayload::ReviewUnclaimed {
                submission_id,
                milestone_id,
                ..
            } => {
                self.transition(*milestone_id, Trigger::Unclaim)?;
                let s = self.submission_mut(*submission_id)?;
                s.reviewer_id = None;
                s.lease_expires_at = None;
            }
            EventPayload::SubmissionPrioritized {
                submission_id,
                milestone_id,
                priority,
            } => {
                if self.milestone(*milestone_id)?.active_submission != Some(*submission_id) {
                    return Err(EscrowError::InvalidState(format!(
                        "submission {submission_id} is not awaiting review"
                    )));
                }
                self.submission_mut(*submission_id)?.priority = *priority;
            }
            EventPayload::ProofDecided {
                submission_id,
                milestone_id,
                decision,
                comment,
            } => {
                let trigger = match decision {
                    Decision::Verified => Trigger::Verify,
                    Decision::Rejected => Trigger::Reject,
                };
                let m = self.transition(*milestone_id, trigger)?;
                m.active_submission = None;
                if *decision == Decision::Rejected {
                    m.rejections += 1;
                }
                let s = self.submission_mut(*submission_id)?;
                s.reviewer_id = Some(event.actor.clone());
                s.lease_expires_at = None;
                s.decision = Some(*decision);
                s.decision_at = Some(event.recorded_at);
                s.comment = comment.clone();
            }
            EventPayload::ResubmissionOpened { milestone_id, .. } => {
                self.transition(*milestone_id, Trigger::Reopen)?;
            }
            EventPayload::MilestoneEscalated { milestone_id, .. } => {
                self.transition(*milestone_id, Trigger::Escalate)?;
            }
            EventPayload::PayoutAttempted {
                milestone_id,
                attempt,
                amount,
                ..
            } => {
                let m = self.milestone_mut(*milestone_id)?;
                milestone::require_status(*milestone_id, m.status, MilestoneStatus::Verified)?;
                let d = &mut m.disbursement;
                d.attempts = d.attempts.max(*attempt);
                d.in_flight_attempt = Some(*attempt);
                d.in_flight_amount = *amount;
                d.next_eligible_at = None;
            }
            EventPayload::PayoutAttemptFailed {
                milestone_id,
                reason,
                next_eligible_at,
                ..
            } => {
                let m = self.milestone_mut(*milestone_id)?;
                milestone::require_status(*milestone_id, m.status, MilestoneStatus::Verified)?;
                let d = &mut m.disbursement;
                d.in_flight_attempt = None;
                d.in_flight_amount = 0;
                d.last_failure = Some(reason.clone());
                d.next_eligible_at = *next_eligible_at;
            }
            EventPayload::FundsReleased {
                milestone_id,
                amount,
                attempt,
                transaction_id,
            } => {
                let m = self.transition(*milestone_id, Trigger::Release)?;
                m.released_amount += amount;
                let d = &mut m.disbursement;
                d.attempts = d.attempts.max(*attempt);
                d.in_flight_attempt = None;
                d.in_flight_amount = 0;
                d.next_eligible_at = None;
                d.transaction_id = Some(transaction_id.clone());
                d.released_at = Some(event.recorded_at);
                self.campaign.released_amount += amount;
                allocate_release(&mut self.donations, *amount);
            }
            EventPayload::ReleaseFailed {
                milestone_id,
                reason,
                ..
            } => {
                let m = self.transition(*milestone_id, Trigger::FailRelease)?;
                let d = &mut m.disbursement;
                d.in_flight_attempt = None;
                d.in_flight_amount = 0;
                d.next_eligible_at = None;
                d.last_failure = Some(reason.clone());
            }
            EventPayload::RefundCandidateRecorded {
                milestone_id,
                amount,
            } => {
                let d = &mut self.milestone_mut(*milestone_id)?.disbursement;
                d.in_flight_attempt = None;
                d.in_flight_amount = 0;
                d.next_eligible_at = None;
                d.refund_candidate = Some(*amount);
            }
            EventPayload::InvariantViolated { detail } => {
                self.campaign.frozen = Some(detail.clone());
            }
            EventPayload::ReconciliationCleared { .. } => {
                self.campaign.frozen = None;
            }
        }

        self.head = event.sequence;
        self.last_hash = event.hash.clone();
        Ok(())
    }
}
