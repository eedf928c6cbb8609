//! # Milestone Escrow Protocol
//!
//! Root crate of the escrow core. [`EscrowProtocol`] is the single facade
//! through which every actor reaches campaign state; each entry point first
//! asks [`policy::authorize`] and then records what happened as one or more
//! audit events.
//!
//! | Phase         | Entry Point(s)                                                       |
//! |---------------|----------------------------------------------------------------------|
//! | Lifecycle     | [`EscrowProtocol::create_campaign`], `add_milestone`, `activate_campaign`, `cancel_campaign` |
//! | Funding       | `record_pledge`, [`EscrowProtocol::apply_hold`], `apply_refund`      |
//! | Proof         | `store_artifact`, [`EscrowProtocol::submit_proof`], `reopen_milestone` |
//! | Verification  | `claim_next`, `claim_submission`, `release_claim`, `prioritize_submission`, [`EscrowProtocol::decide`] |
//! | Disbursement  | [`EscrowProtocol::disburse`], `resume_due_disbursements`             |
//! | Operations    | `sweep_expired_leases`, `clear_reconciliation`, `stats`              |
//! | Queries       | `campaign`, `balances`, `milestone`, `stream_from`, `ledger_entries`, `verify_chain` |
//!
//! ## Architecture
//!
//! State lives only in the [`audit_log`]. Everything else ([`projection`]
//! views, the [`queue`], the id locator) is rebuilt from it by
//! [`EscrowProtocol::open`]. Balance rules live in [`ledger`], milestone
//! transitions in [`milestone`], payout retries in [`disbursement`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod artifacts;
pub mod audit_log;
pub mod clock;
pub mod config;
pub mod disbursement;
pub mod errors;
pub mod events;
pub mod invariants;
pub mod ledger;
pub mod milestone;
pub mod notify;
pub mod policy;
pub mod projection;
pub mod queue;
pub mod storage;
pub mod types;

#[cfg(test)]
mod test_events;
#[cfg(test)]
mod test_scenarios;

use artifacts::{ArtifactStore, MemoryArtifactStore};
use audit_log::{Appended, AuditLog};
use clock::{Clock, SystemClock};
use disbursement::PayoutProvider;
use events::{AuditEvent, EventPayload};
use milestone::Trigger;
use notify::{emit, Notification, NotificationSink, NullNotifier};
use projection::CampaignView;
use queue::{ClaimGrant, QueueItem, VerificationQueue};
use storage::EventStore;

pub use config::ProtocolConfig;
pub use errors::{EscrowError, Result};
pub use policy::{authorize, Action, Principal, Resource, Role};
pub use types::*;

/// External services the protocol talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub payouts: Arc<dyn PayoutProvider>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub notifier: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// In-memory artifacts, no notifications, wall-clock time.
    pub fn new(payouts: Arc<dyn PayoutProvider>) -> Self {
        Self {
            payouts,
            artifacts: Arc::new(MemoryArtifactStore::new()),
            notifier: Arc::new(NullNotifier),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

struct IdAllocator {
    campaign: AtomicU64,
    milestone: AtomicU64,
    submission: AtomicU64,
}

impl IdAllocator {
    fn seeded<'a>(views: impl Iterator<Item = &'a CampaignView>) -> Self {
        let (mut c, mut m, mut s) = (0, 0, 0);
        for view in views {
            c = c.max(view.campaign.id.0);
            m = view.milestones.keys().map(|id| id.0).fold(m, u64::max);
            s = view.submissions.keys().map(|id| id.0).fold(s, u64::max);
        }
        Self {
            campaign: AtomicU64::new(c + 1),
            milestone: AtomicU64::new(m + 1),
            submission: AtomicU64::new(s + 1),
        }
    }
}

/// Which campaign owns a milestone or submission.
#[derive(Default)]
struct Locator {
    milestones: HashMap<MilestoneId, CampaignId>,
    submissions: HashMap<SubmissionId, CampaignId>,
}

impl Locator {
    fn index(&mut self, view: &CampaignView) {
        for id in view.milestones.keys() {
            self.milestones.insert(*id, view.campaign.id);
        }
        for id in view.submissions.keys() {
            self.submissions.insert(*id, view.campaign.id);
        }
    }
}

pub struct EscrowProtocol {
    config: ProtocolConfig,
    log: AuditLog,
    queue: VerificationQueue,
    collab: Collaborators,
    ids: IdAllocator,
    locator: RwLock<Locator>,
    cancellations: Mutex<HashMap<CampaignId, CancellationToken>>,
    in_flight: Mutex<HashSet<MilestoneId>>,
}

impl EscrowProtocol {
    /// Load every campaign from `store` and rebuild the derived indexes.
    pub async fn open(
        config: ProtocolConfig,
        store: Arc<dyn EventStore>,
        collab: Collaborators,
    ) -> Result<Self> {
        let log = AuditLog::load(store).await?;
        let views = log
            .campaign_ids()
            .into_iter()
            .map(|id| log.view(id))
            .collect::<Result<Vec<_>>>()?;

        let queue = VerificationQueue::new(config.escalation_threshold());
        let queued = queue.rebuild(views.iter().map(|v| v.as_ref()))?;
        let ids = IdAllocator::seeded(views.iter().map(|v| v.as_ref()));
        let mut locator = Locator::default();
        for view in &views {
            locator.index(view);
        }
        info!(
            "Escrow protocol ready: {} campaigns, {} queued submissions",
            views.len(),
            queued
        );

        Ok(Self {
            config,
            log,
            queue,
            collab,
            ids,
            locator: RwLock::new(locator),
            cancellations: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    fn now(&self) -> DateTime<Utc> {
        self.collab.clock.now()
    }

    // ─────────────────────────────────────────────────────────
    // Internal plumbing
    // ─────────────────────────────────────────────────────────

    fn locate_milestone(&self, id: MilestoneId) -> Result<CampaignId> {
        self.locator
            .read()
            .map_err(|_| EscrowError::Storage("locator lock poisoned".to_string()))?
            .milestones
            .get(&id)
            .copied()
            .ok_or_else(|| EscrowError::NotFound(format!("milestone {id}")))
    }

    fn locate_submission(&self, id: SubmissionId) -> Result<CampaignId> {
        self.locator
            .read()
            .map_err(|_| EscrowError::Storage("locator lock poisoned".to_string()))?
            .submissions
            .get(&id)
            .copied()
            .ok_or_else(|| EscrowError::NotFound(format!("proof submission {id}")))
    }

    fn index(&self, view: &CampaignView) -> Result<()> {
        self.locator
            .write()
            .map_err(|_| EscrowError::Storage("locator lock poisoned".to_string()))?
            .index(view);
        Ok(())
    }

    pub(crate) fn cancellation_token(&self, campaign_id: CampaignId) -> Result<CancellationToken> {
        let mut tokens = self
            .cancellations
            .lock()
            .map_err(|_| EscrowError::Storage("cancellation map poisoned".to_string()))?;
        Ok(tokens.entry(campaign_id).or_default().clone())
    }

    /// Plan against the latest view and append, retrying on lost races.
    /// A plan returning `None` means there is nothing to record.
    async fn mutate<F>(&self, campaign_id: CampaignId, actor: &str, plan: F) -> Result<Option<Appended>>
    where
        F: Fn(&CampaignView) -> Result<Option<EventPayload>>,
    {
        self.mutate_with(campaign_id, actor, false, plan).await
    }

    async fn mutate_with<F>(
        &self,
        campaign_id: CampaignId,
        actor: &str,
        allow_frozen: bool,
        plan: F,
    ) -> Result<Option<Appended>>
    where
        F: Fn(&CampaignView) -> Result<Option<EventPayload>>,
    {
        let mut retries = 0;
        loop {
            let view = self.log.view(campaign_id)?;
            if let Some(reason) = view.campaign.frozen.as_ref().filter(|_| !allow_frozen) {
                return Err(EscrowError::CampaignFrozen {
                    campaign_id,
                    reason: reason.clone(),
                });
            }
            let Some(payload) = plan(&view)? else {
                return Ok(None);
            };
            match self
                .log
                .append(campaign_id, view.head, actor, self.now(), payload)
                .await
            {
                Err(e) if e.is_retryable() && retries < self.config.conflict_retries => {
                    retries += 1;
                    warn!("campaign {campaign_id}: {e}; retry {retries}");
                }
                result => return result.map(Some),
            }
        }
    }

    /// Like [`Self::mutate`] for plans that always produce an event.
    async fn record<F>(&self, campaign_id: CampaignId, actor: &str, plan: F) -> Result<Arc<CampaignView>>
    where
        F: Fn(&CampaignView) -> Result<EventPayload>,
    {
        match self.mutate(campaign_id, actor, |v| plan(v).map(Some)).await? {
            Some(appended) => Ok(appended.view),
            None => self.log.view(campaign_id),
        }
    }

    fn require_status(view: &CampaignView, allowed: &[CampaignStatus], doing: &str) -> Result<()> {
        if allowed.contains(&view.campaign.status) {
            Ok(())
        } else {
            Err(EscrowError::InvalidState(format!(
                "cannot {doing}: campaign {} is {:?}",
                view.campaign.id, view.campaign.status
            )))
        }
    }

    // ─────────────────────────────────────────────────────────
    // Campaign lifecycle
    // ─────────────────────────────────────────────────────────

    /// Register a draft campaign owned by the calling charity.
    pub async fn create_campaign(
        &self,
        principal: &Principal,
        new: NewCampaign,
    ) -> Result<Arc<CampaignView>> {
        authorize(principal, Action::CreateCampaign, Resource::Platform)?;
        if new.goal_amount <= 0 {
            return Err(EscrowError::Validation("goal amount must be positive".to_string()));
        }
        if new.payout_account.trim().is_empty() {
            return Err(EscrowError::Validation("payout account is required".to_string()));
        }
        if new.deadline <= self.now() {
            return Err(EscrowError::Validation("deadline must be in the future".to_string()));
        }
        // Every target is checked up front so a bad one cannot leave a
        // half-built draft behind.
        let mut planned: Amount = 0;
        for target in &new.milestones {
            if *target <= 0 {
                return Err(EscrowError::Validation(
                    "milestone target must be positive".to_string(),
                ));
            }
            planned = ledger::checked_total(planned, *target, "milestone targets")?;
        }
        if planned > new.goal_amount {
            return Err(EscrowError::Validation(
                "milestone targets exceed the campaign goal".to_string(),
            ));
        }

        let campaign_id = CampaignId(self.ids.campaign.fetch_add(1, Ordering::SeqCst));
        let created = self
            .log
            .create(
                campaign_id,
                &principal.id,
                self.now(),
                EventPayload::CampaignCreated {
                    charity_id: principal.id.clone(),
                    goal_amount: new.goal_amount,
                    deadline: new.deadline,
                    payout_account: new.payout_account.trim().to_string(),
                    parallel_release: new.parallel_release,
                },
            )
            .await?;

        let mut view = created.view;
        for target in new.milestones {
            self.add_milestone(principal, campaign_id, target).await?;
            view = self.log.view(campaign_id)?;
        }
        Ok(view)
    }

    /// Append a milestone to a draft campaign.
    pub async fn add_milestone(
        &self,
        principal: &Principal,
        campaign_id: CampaignId,
        target_amount: Amount,
    ) -> Result<Milestone> {
        let view = self.log.view(campaign_id)?;
        authorize(
            principal,
            Action::ManageCampaign,
            Resource::Campaign {
                charity_id: &view.campaign.charity_id,
            },
        )?;
        if target_amount <= 0 {
            return Err(EscrowError::Validation(
                "milestone target must be positive".to_string(),
            ));
        }

        let milestone_id = MilestoneId(self.ids.milestone.fetch_add(1, Ordering::SeqCst));
        let view = self
            .record(campaign_id, &principal.id, |v| {
                Self::require_status(v, &[CampaignStatus::Draft], "add milestones")?;
                let planned: Amount = v.milestones.values().map(|m| m.target_amount).sum();
                let planned = ledger::checked_total(planned, target_amount, "milestone targets")?;
                if planned > v.campaign.goal_amount {
                    return Err(EscrowError::Validation(format!(
                        "milestone targets {planned} would exceed goal {}",
                        v.campaign.goal_amount
                    )));
                }
                Ok(EventPayload::MilestoneAdded {
                    milestone_id,
                    sequence_index: v.milestones.len() as u32,
                    target_amount,
                })
            })
            .await?;
        self.index(&view)?;
        Ok(view.milestone(milestone_id)?.clone())
    }

    /// Open a draft campaign for donations.
    pub async fn activate_campaign(
        &self,
        principal: &Principal,
        campaign_id: CampaignId,
    ) -> Result<Arc<CampaignView>> {
        let view = self.log.view(campaign_id)?;
        authorize(
            principal,
            Action::ManageCampaign,
            Resource::Campaign {
                charity_id: &view.campaign.charity_id,
            },
        )?;
        let view = self
            .record(campaign_id, &principal.id, |v| {
                Self::require_status(v, &[CampaignStatus::Draft], "activate")?;
                if v.milestones.is_empty() {
                    return Err(EscrowError::Validation(
                        "a campaign needs at least one milestone".to_string(),
                    ));
                }
                let planned: Amount = v.milestones.values().map(|m| m.target_amount).sum();
                if planned != v.campaign.goal_amount {
                    return Err(EscrowError::Validation(format!(
                        "milestone targets {planned} must add up to goal {}",
                        v.campaign.goal_amount
                    )));
                }
                Ok(EventPayload::CampaignActivated)
            })
            .await?;
        info!("campaign {campaign_id} activated");
        Ok(view)
    }

    /// Stop a campaign. In-flight payouts are cancelled and recorded as
    /// refund candidates; queued proofs are withdrawn.
    pub async fn cancel_campaign(
        &self,
        principal: &Principal,
        campaign_id: CampaignId,
        reason: &str,
    ) -> Result<Arc<CampaignView>> {
        let view = self.log.view(campaign_id)?;
        authorize(
            principal,
            Action::ManageCampaign,
            Resource::Campaign {
                charity_id: &view.campaign.charity_id,
            },
        )?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EscrowError::Validation("a cancellation reason is required".to_string()));
        }
        let view = self
            .record(campaign_id, &principal.id, |v| {
                Self::require_status(v, &[CampaignStatus::Draft, CampaignStatus::Active], "cancel")?;
                Ok(EventPayload::CampaignCancelled {
                    reason: reason.to_string(),
                })
            })
            .await?;

        self.cancellation_token(campaign_id)?.cancel();
        for m in view.milestones.values() {
            if let Some(sub) = m.active_submission {
                self.queue.remove(sub)?;
            }
        }
        info!("campaign {campaign_id} cancelled: {reason}");
        emit(
            self.collab.notifier.as_ref(),
            Notification::CampaignCancelled {
                campaign_id,
                reason: reason.to_string(),
            },
        )
        .await;
        Ok(view)
    }

    // ─────────────────────────────────────────────────────────
    // Funding
    // ─────────────────────────────────────────────────────────

    /// Record an unconfirmed pledge. Balances do not move.
    pub async fn record_pledge(
        &self,
        principal: &Principal,
        campaign_id: CampaignId,
        amount: Amount,
    ) -> Result<Balances> {
        authorize(principal, Action::Pledge, Resource::Platform)?;
        let view = self
            .record(campaign_id, &principal.id, |v| {
                ledger::plan_pledge(v, &principal.id, amount)
            })
            .await?;
        Ok(view.balances())
    }

    /// Hold a confirmed donation in escrow. Replaying the same confirmation
    /// is a no-op.
    pub async fn apply_hold(
        &self,
        principal: &Principal,
        campaign_id: CampaignId,
        donation_id: DonationId,
        amount: Amount,
    ) -> Result<Balances> {
        authorize(principal, Action::Donate, Resource::Platform)?;
        let appended = self
            .mutate(campaign_id, &principal.id, |v| {
                ledger::plan_hold(v, donation_id, &principal.id, amount)
            })
            .await?;
        match appended {
            Some(a) => {
                info!("campaign {campaign_id}: held {amount} from donation {donation_id}");
                Ok(a.view.balances())
            }
            None => {
                debug!("campaign {campaign_id}: donation {donation_id} already held");
                Ok(self.log.view(campaign_id)?.balances())
            }
        }
    }

    /// Return unreleased funds to donors.
    pub async fn apply_refund(
        &self,
        principal: &Principal,
        campaign_id: CampaignId,
        amount: Amount,
    ) -> Result<Balances> {
        authorize(principal, Action::Refund, Resource::Platform)?;
        let view = self
            .record(campaign_id, &principal.id, |v| ledger::plan_refund(v, amount))
            .await?;
        info!("campaign {campaign_id}: refunded {amount}");
        Ok(view.balances())
    }

    /// Record a confirmed payout. Only the disbursement engine calls this.
    pub(crate) async fn apply_release(
        &self,
        actor: &str,
        campaign_id: CampaignId,
        milestone_id: MilestoneId,
        amount: Amount,
        attempt: u32,
        transaction_id: &str,
    ) -> Result<Arc<CampaignView>> {
        self.record(campaign_id, actor, |v| {
            ledger::plan_release(v, milestone_id, amount, attempt, transaction_id)
        })
        .await
    }

    // ─────────────────────────────────────────────────────────
    // Proof submission
    // ─────────────────────────────────────────────────────────

    pub async fn store_artifact(
        &self,
        principal: &Principal,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<String> {
        authorize(principal, Action::UploadArtifact, Resource::Platform)?;
        if bytes.is_empty() {
            return Err(EscrowError::Validation("artifact is empty".to_string()));
        }
        self.collab.artifacts.store(file_name, bytes).await
    }

    /// Submit evidence for a pending milestone and queue it for review.
    pub async fn submit_proof(
        &self,
        principal: &Principal,
        milestone_id: MilestoneId,
        artifact_refs: Vec<String>,
    ) -> Result<ProofSubmission> {
        let campaign_id = self.locate_milestone(milestone_id)?;
        let view = self.log.view(campaign_id)?;
        authorize(
            principal,
            Action::SubmitProof,
            Resource::Campaign {
                charity_id: &view.campaign.charity_id,
            },
        )?;
        let refs: Vec<String> = artifact_refs
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if refs.is_empty() {
            return Err(EscrowError::Validation(
                "a proof needs at least one artifact reference".to_string(),
            ));
        }
        Self::require_status(&view, &[CampaignStatus::Active], "submit proof")?;
        for r in &refs {
            self.collab.artifacts.resolve(r).await?;
        }

        let submission_id = SubmissionId(self.ids.submission.fetch_add(1, Ordering::SeqCst));
        let view = self
            .record(campaign_id, &principal.id, |v| {
                Self::require_status(v, &[CampaignStatus::Active], "submit proof")?;
                milestone::require(milestone_id, v.milestone(milestone_id)?.status, Trigger::SubmitProof)?;
                Ok(EventPayload::ProofSubmitted {
                    submission_id,
                    milestone_id,
                    artifact_refs: refs.clone(),
                })
            })
            .await?;
        self.index(&view)?;

        let submission = view.submission(submission_id)?.clone();
        self.queue.enqueue(QueueItem {
            submission_id,
            milestone_id,
            campaign_id,
            submitted_at: submission.submitted_at,
            campaign_deadline: view.campaign.deadline,
            priority: Priority::Normal,
            lease: None,
        })?;
        info!("milestone {milestone_id}: proof {submission_id} submitted");
        Ok(submission)
    }

    /// Reopen a rejected milestone for a new submission. Once the
    /// resubmission budget is spent the milestone becomes `rejected_final`
    /// instead, and that status is returned.
    pub async fn reopen_milestone(
        &self,
        principal: &Principal,
        milestone_id: MilestoneId,
    ) -> Result<MilestoneStatus> {
        let campaign_id = self.locate_milestone(milestone_id)?;
        let view = self.log.view(campaign_id)?;
        authorize(
            principal,
            Action::SubmitProof,
            Resource::Campaign {
                charity_id: &view.campaign.charity_id,
            },
        )?;
        let max = self.config.max_resubmissions;
        let view = self
            .record(campaign_id, &principal.id, |v| {
                Self::require_status(v, &[CampaignStatus::Active], "resubmit proof")?;
                let m = v.milestone(milestone_id)?;
                milestone::require_status(milestone_id, m.status, MilestoneStatus::Rejected)?;
                if m.rejections <= max {
                    Ok(EventPayload::ResubmissionOpened {
                        milestone_id,
                        attempt: m.rejections + 1,
                    })
                } else {
                    Ok(EventPayload::MilestoneEscalated {
                        milestone_id,
                        rejections: m.rejections,
                    })
                }
            })
            .await?;
        let status = view.milestone(milestone_id)?.status;
        if status == MilestoneStatus::RejectedFinal {
            warn!("milestone {milestone_id}: resubmission budget exhausted, escalated");
        }
        Ok(status)
    }

    // ─────────────────────────────────────────────────────────
    // Verification
    // ─────────────────────────────────────────────────────────

    async fn record_claim(&self, reviewer: &str, grant: ClaimGrant) -> Result<ProofSubmission> {
        let item = &grant.item;
        let Some(lease) = item.lease.clone() else {
            return Err(EscrowError::InvalidState(format!(
                "submission {} was granted without a lease",
                item.submission_id
            )));
        };
        if let Some(prev) = &grant.displaced {
            warn!(
                "submission {}: lease of {} expired at {}, reassigned to {reviewer}",
                item.submission_id, prev.reviewer_id, prev.expires_at
            );
        }
        let submission_id = item.submission_id;
        let milestone_id = item.milestone_id;
        let recorded = self
            .record(item.campaign_id, reviewer, |v| {
                if !v.submission(submission_id)?.is_active() {
                    return Err(EscrowError::InvalidState(format!(
                        "submission {submission_id} is already decided"
                    )));
                }
                Ok(EventPayload::ReviewClaimed {
                    submission_id,
                    milestone_id,
                    reviewer_id: lease.reviewer_id.clone(),
                    lease_expires_at: lease.expires_at,
                })
            })
            .await;
        match recorded {
            Ok(view) => {
                info!("submission {submission_id} claimed by {reviewer}");
                Ok(view.submission(submission_id)?.clone())
            }
            Err(e) => {
                self.queue.restore(submission_id, grant.displaced.clone())?;
                Err(e)
            }
        }
    }

    /// Lease the next submission in queue order.
    pub async fn claim_next(&self, principal: &Principal) -> Result<Option<ProofSubmission>> {
        authorize(principal, Action::Review, Resource::Platform)?;
        let grant = self
            .queue
            .claim_next(&principal.id, self.now(), self.config.lease_duration())?;
        match grant {
            Some(grant) => self.record_claim(&principal.id, grant).await.map(Some),
            None => Ok(None),
        }
    }

    /// Lease a specific submission.
    pub async fn claim_submission(
        &self,
        principal: &Principal,
        submission_id: SubmissionId,
    ) -> Result<ProofSubmission> {
        authorize(principal, Action::Review, Resource::Platform)?;
        let grant = self.queue.try_claim(
            submission_id,
            &principal.id,
            self.now(),
            self.config.lease_duration(),
        )?;
        self.record_claim(&principal.id, grant).await
    }

    /// Give up a lease so another reviewer can take the submission.
    pub async fn release_claim(&self, principal: &Principal, submission_id: SubmissionId) -> Result<()> {
        authorize(principal, Action::Review, Resource::Platform)?;
        let held = self.queue.get(submission_id)?.lease;
        let item = self.queue.unclaim(submission_id, &principal.id, self.now())?;
        let recorded = self
            .record(item.campaign_id, &principal.id, |_| {
                Ok(EventPayload::ReviewUnclaimed {
                    submission_id,
                    milestone_id: item.milestone_id,
                    expired: false,
                })
            })
            .await;
        if let Err(e) = recorded {
            self.queue.restore(submission_id, held)?;
            return Err(e);
        }
        info!("submission {submission_id} released by {}", principal.id);
        Ok(())
    }

    /// Move a pending submission up (or back down) the review queue. The
    /// choice is recorded, so it survives a restart.
    pub async fn prioritize_submission(
        &self,
        principal: &Principal,
        submission_id: SubmissionId,
        priority: Priority,
    ) -> Result<ProofSubmission> {
        authorize(principal, Action::Prioritize, Resource::Platform)?;
        let item = self.queue.get(submission_id)?;
        let view = self
            .record(item.campaign_id, &principal.id, |v| {
                if !v.submission(submission_id)?.is_active() {
                    return Err(EscrowError::InvalidState(format!(
                        "submission {submission_id} is already decided"
                    )));
                }
                Ok(EventPayload::SubmissionPrioritized {
                    submission_id,
                    milestone_id: item.milestone_id,
                    priority,
                })
            })
            .await?;
        self.queue.set_priority(submission_id, priority)?;
        info!("submission {submission_id} set to {priority:?} by {}", principal.id);
        Ok(view.submission(submission_id)?.clone())
    }

    /// Verify or reject a submission. The caller must hold its lease, and a
    /// rejection must say why.
    pub async fn decide(
        &self,
        principal: &Principal,
        submission_id: SubmissionId,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<Milestone> {
        authorize(principal, Action::Review, Resource::Platform)?;
        let comment = comment
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if decision == Decision::Rejected && comment.is_none() {
            return Err(EscrowError::Validation(
                "a rejection requires a comment".to_string(),
            ));
        }
        let item = self.queue.check_lease(submission_id, &principal.id, self.now())?;
        let milestone_id = item.milestone_id;

        let view = self
            .record(item.campaign_id, &principal.id, |v| {
                milestone::require_status(
                    milestone_id,
                    v.milestone(milestone_id)?.status,
                    MilestoneStatus::InReview,
                )?;
                // The lease may have changed hands while this append waited.
                let s = v.submission(submission_id)?;
                let holds_lease = s.reviewer_id.as_deref() == Some(principal.id.as_str())
                    && s.lease_expires_at.is_some_and(|at| at > self.now());
                if !holds_lease {
                    return Err(EscrowError::denied(
                        &principal.id,
                        format!("decide {submission_id} without holding its lease"),
                    ));
                }
                Ok(EventPayload::ProofDecided {
                    submission_id,
                    milestone_id,
                    decision,
                    comment: comment.clone(),
                })
            })
            .await?;
        self.queue.remove(submission_id)?;

        let notification = match decision {
            Decision::Verified => Notification::MilestoneVerified {
                campaign_id: item.campaign_id,
                milestone_id,
                submission_id,
            },
            Decision::Rejected => Notification::MilestoneRejected {
                campaign_id: item.campaign_id,
                milestone_id,
                submission_id,
                comment: comment.clone().unwrap_or_default(),
            },
        };
        info!("submission {submission_id}: {decision:?} by {}", principal.id);
        emit(self.collab.notifier.as_ref(), notification).await;
        Ok(view.milestone(milestone_id)?.clone())
    }

    /// Return every expired lease to the pool, recording each expiry.
    pub async fn sweep_expired_leases(&self) -> Result<usize> {
        let swept = self.queue.sweep_expired(self.now())?;
        let mut recorded = 0;
        for item in swept {
            let submission_id = item.submission_id;
            let result = self
                .mutate(item.campaign_id, disbursement::SCHEDULER_ACTOR, |v| {
                    // Already decided or re-claimed since the sweep began.
                    let s = v.submission(submission_id)?;
                    if !s.is_active() || s.lease_expires_at.map_or(true, |at| at > self.now()) {
                        return Ok(None);
                    }
                    Ok(Some(EventPayload::ReviewUnclaimed {
                        submission_id,
                        milestone_id: item.milestone_id,
                        expired: true,
                    }))
                })
                .await;
            match result {
                Ok(Some(_)) => {
                    warn!("submission {submission_id}: lease expired, returned to queue");
                    recorded += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("submission {submission_id}: could not record lease expiry: {e}"),
            }
        }
        Ok(recorded)
    }

    // ─────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────

    /// Unfreeze a campaign after manual reconciliation.
    pub async fn clear_reconciliation(
        &self,
        principal: &Principal,
        campaign_id: CampaignId,
        note: &str,
    ) -> Result<Arc<CampaignView>> {
        authorize(principal, Action::Reconcile, Resource::Platform)?;
        let note = note.trim();
        if note.is_empty() {
            return Err(EscrowError::Validation("a reconciliation note is required".to_string()));
        }
        let appended = self
            .mutate_with(campaign_id, &principal.id, true, |v| {
                if v.campaign.frozen.is_none() {
                    return Err(EscrowError::InvalidState(format!(
                        "campaign {campaign_id} is not frozen"
                    )));
                }
                Ok(Some(EventPayload::ReconciliationCleared {
                    note: note.to_string(),
                }))
            })
            .await?;
        info!("campaign {campaign_id} reconciled by {}", principal.id);
        match appended {
            Some(a) => Ok(a.view),
            None => self.log.view(campaign_id),
        }
    }

    /// Counters for the administrator dashboard.
    pub fn stats(&self, principal: &Principal) -> Result<PlatformStats> {
        authorize(principal, Action::ViewStats, Resource::Platform)?;
        let (pending, claimed) = self.queue.counts(self.now())?;
        let mut stats = PlatformStats {
            pending_verifications: pending,
            claimed_verifications: claimed,
            ..PlatformStats::default()
        };
        for id in self.log.campaign_ids() {
            let view = self.log.view(id)?;
            if view.campaign.status == CampaignStatus::Active {
                stats.active_campaigns += 1;
            }
            if view.campaign.frozen.is_some() {
                stats.frozen_campaigns += 1;
            }
            for m in view.milestones.values() {
                match m.status {
                    MilestoneStatus::Verified => {
                        stats.awaiting_payout += 1;
                        stats.awaiting_payout_amount = stats
                            .awaiting_payout_amount
                            .saturating_add(ledger::releasable_amount(&view, m));
                    }
                    MilestoneStatus::ReleaseFailed => stats.release_failed += 1,
                    _ => {}
                }
            }
        }
        Ok(stats)
    }

    // ─────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────

    pub fn campaign_ids(&self) -> Vec<CampaignId> {
        self.log.campaign_ids()
    }

    pub fn campaign(&self, campaign_id: CampaignId) -> Result<Arc<CampaignView>> {
        self.log.view(campaign_id)
    }

    pub fn balances(&self, campaign_id: CampaignId) -> Result<Balances> {
        Ok(self.log.view(campaign_id)?.balances())
    }

    pub fn milestone(&self, milestone_id: MilestoneId) -> Result<Milestone> {
        let view = self.log.view(self.locate_milestone(milestone_id)?)?;
        Ok(view.milestone(milestone_id)?.clone())
    }

    pub fn submission(&self, submission_id: SubmissionId) -> Result<ProofSubmission> {
        let view = self.log.view(self.locate_submission(submission_id)?)?;
        Ok(view.submission(submission_id)?.clone())
    }

    pub fn stream_from(&self, campaign_id: CampaignId, since: u64) -> Result<Vec<AuditEvent>> {
        self.log.stream_from(campaign_id, since)
    }

    pub fn ledger_entries(&self, campaign_id: CampaignId) -> Result<Vec<LedgerEntry>> {
        self.log.ledger_entries(campaign_id)
    }

    pub fn verify_chain(&self, campaign_id: CampaignId) -> Result<()> {
        self.log.verify_chain(campaign_id)
    }
}
