//! Verification queue.
//!
//! Arbitrates which reviewer may act on which pending proof. The queue is an
//! in-memory index over the audit log: every claim, unclaim and decision is
//! also recorded as an event, so [`VerificationQueue::rebuild`] can restore
//! it (leases included) after a restart.
//!
//! Ordering: escalated items first, then oldest submission, then lowest id.
//! An item is escalated either explicitly or because its campaign deadline
//! falls within the configured threshold.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::errors::{EscrowError, Result};
use crate::projection::CampaignView;
use crate::types::{CampaignId, MilestoneId, MilestoneStatus, Priority, SubmissionId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub reviewer_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueItem {
    pub submission_id: SubmissionId,
    pub milestone_id: MilestoneId,
    pub campaign_id: CampaignId,
    pub submitted_at: DateTime<Utc>,
    pub campaign_deadline: DateTime<Utc>,
    pub priority: Priority,
    pub lease: Option<Lease>,
}

impl QueueItem {
    fn effective_priority(&self, now: DateTime<Utc>, threshold: Duration) -> Priority {
        if self.priority == Priority::Escalated || self.campaign_deadline - now <= threshold {
            Priority::Escalated
        } else {
            Priority::Normal
        }
    }

    fn claimable(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().map_or(true, |l| !l.is_live(now))
    }
}

/// A lease just granted, plus whatever expired lease it displaced.
#[derive(Clone, Debug)]
pub struct ClaimGrant {
    pub item: QueueItem,
    pub displaced: Option<Lease>,
}

pub struct VerificationQueue {
    items: Mutex<HashMap<SubmissionId, QueueItem>>,
    escalation_threshold: Duration,
}

impl VerificationQueue {
    pub fn new(escalation_threshold: Duration) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            escalation_threshold,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<SubmissionId, QueueItem>>> {
        self.items
            .lock()
            .map_err(|_| EscrowError::Storage("verification queue lock poisoned".to_string()))
    }

    /// Restore queue contents from campaign projections.
    pub fn rebuild<'a>(&self, views: impl IntoIterator<Item = &'a CampaignView>) -> Result<usize> {
        let mut items = self.lock()?;
        items.clear();
        for view in views {
            for m in view.milestones.values() {
                let waiting = matches!(
                    m.status,
                    MilestoneStatus::ProofSubmitted | MilestoneStatus::InReview
                );
                let Some(sub_id) = m.active_submission.filter(|_| waiting) else {
                    continue;
                };
                let sub = view.submission(sub_id)?;
                let lease = match (&sub.reviewer_id, sub.lease_expires_at) {
                    (Some(reviewer_id), Some(expires_at)) => Some(Lease {
                        reviewer_id: reviewer_id.clone(),
                        expires_at,
                    }),
                    _ => None,
                };
                items.insert(
                    sub_id,
                    QueueItem {
                        submission_id: sub_id,
                        milestone_id: m.id,
                        campaign_id: view.campaign.id,
                        submitted_at: sub.submitted_at,
                        campaign_deadline: view.campaign.deadline,
                        priority: sub.priority,
                        lease,
                    },
                );
            }
        }
        Ok(items.len())
    }

    pub fn enqueue(&self, item: QueueItem) -> Result<()> {
        self.lock()?.insert(item.submission_id, item);
        Ok(())
    }

    pub fn get(&self, submission_id: SubmissionId) -> Result<QueueItem> {
        self.lock()?
            .get(&submission_id)
            .cloned()
            .ok_or_else(|| EscrowError::NotFound(format!("queued submission {submission_id}")))
    }

    pub fn remove(&self, submission_id: SubmissionId) -> Result<Option<QueueItem>> {
        Ok(self.lock()?.remove(&submission_id))
    }

    /// Set an item's explicit priority. Deadline escalation still applies
    /// on top of `Normal`.
    pub fn set_priority(&self, submission_id: SubmissionId, priority: Priority) -> Result<()> {
        let mut items = self.lock()?;
        let item = items
            .get_mut(&submission_id)
            .ok_or_else(|| EscrowError::NotFound(format!("queued submission {submission_id}")))?;
        item.priority = priority;
        Ok(())
    }

    /// Claimable items in service order.
    pub fn claimable(&self, now: DateTime<Utc>) -> Result<Vec<QueueItem>> {
        let items = self.lock()?;
        let mut ready: Vec<QueueItem> = items.values().filter(|i| i.claimable(now)).cloned().collect();
        ready.sort_by(|a, b| {
            b.effective_priority(now, self.escalation_threshold)
                .cmp(&a.effective_priority(now, self.escalation_threshold))
                .then(a.submitted_at.cmp(&b.submitted_at))
                .then(a.submission_id.cmp(&b.submission_id))
        });
        Ok(ready)
    }

    /// Grant a lease on a specific item. A live lease, even the caller's own,
    /// is a conflict.
    pub fn try_claim(
        &self,
        submission_id: SubmissionId,
        reviewer_id: &str,
        now: DateTime<Utc>,
        lease_for: Duration,
    ) -> Result<ClaimGrant> {
        let mut items = self.lock()?;
        let item = items
            .get_mut(&submission_id)
            .ok_or_else(|| EscrowError::NotFound(format!("queued submission {submission_id}")))?;
        if let Some(lease) = item.lease.as_ref().filter(|l| l.is_live(now)) {
            return Err(EscrowError::Conflict(format!(
                "submission {submission_id} is claimed by {} until {}",
                lease.reviewer_id, lease.expires_at
            )));
        }
        let displaced = item.lease.replace(Lease {
            reviewer_id: reviewer_id.to_string(),
            expires_at: now + lease_for,
        });
        Ok(ClaimGrant {
            item: item.clone(),
            displaced,
        })
    }

    /// Lease the next claimable item, if any.
    pub fn claim_next(
        &self,
        reviewer_id: &str,
        now: DateTime<Utc>,
        lease_for: Duration,
    ) -> Result<Option<ClaimGrant>> {
        for candidate in self.claimable(now)? {
            match self.try_claim(candidate.submission_id, reviewer_id, now, lease_for) {
                Ok(grant) => return Ok(Some(grant)),
                // Lost to a concurrent claimer; try the next item.
                Err(EscrowError::Conflict(_)) | Err(EscrowError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Undo a grant whose audit event could not be recorded.
    pub fn restore(&self, submission_id: SubmissionId, lease: Option<Lease>) -> Result<()> {
        if let Some(item) = self.lock()?.get_mut(&submission_id) {
            item.lease = lease;
        }
        Ok(())
    }

    /// The live lease on `submission_id` must belong to `reviewer_id`.
    pub fn check_lease(
        &self,
        submission_id: SubmissionId,
        reviewer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QueueItem> {
        let item = self.get(submission_id)?;
        match &item.lease {
            Some(lease) if lease.reviewer_id == reviewer_id && lease.is_live(now) => Ok(item),
            _ => Err(EscrowError::denied(
                reviewer_id,
                format!("decide on {submission_id} without holding its lease"),
            )),
        }
    }

    /// Drop the caller's lease, returning the item to the pool.
    pub fn unclaim(
        &self,
        submission_id: SubmissionId,
        reviewer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QueueItem> {
        self.check_lease(submission_id, reviewer_id, now)?;
        let mut items = self.lock()?;
        let item = items
            .get_mut(&submission_id)
            .ok_or_else(|| EscrowError::NotFound(format!("queued submission {submission_id}")))?;
        item.lease = None;
        Ok(item.clone())
    }

    /// Clear every expired lease and return the affected items.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<QueueItem>> {
        let mut items = self.lock()?;
        let mut swept = Vec::new();
        for item in items.values_mut() {
            if item.lease.as_ref().is_some_and(|l| !l.is_live(now)) {
                item.lease = None;
                swept.push(item.clone());
            }
        }
        Ok(swept)
    }

    /// `(unclaimed, claimed)` counts at `now`.
    pub fn counts(&self, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let items = self.lock()?;
        let unclaimed = items.values().filter(|i| i.claimable(now)).count();
        Ok((unclaimed, items.len() - unclaimed))
    }
}
