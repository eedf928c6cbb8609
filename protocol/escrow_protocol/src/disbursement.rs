//! # Disbursement engine
//!
//! Pays verified milestones out through a [`PayoutProvider`].
//!
//! ## Attempts
//!
//! Every attempt is announced with a `payout_attempted` event *before* the
//! provider is called, carrying the attempt number and the amount reserved
//! for it. The provider sees an idempotency key derived from
//! `(milestone, attempt)`, so an attempt interrupted by a restart is resumed
//! with the very same key rather than issued again under a new one.
//!
//! ```text
//! verified ──attempt──► success ─────────────────────────► released
//!    ▲                    │
//!    │                 failure ── retryable, attempts left ─► backoff ─┐
//!    │                    │                                            │
//!    └────────────────────┼────────────────────────────────────────────┘
//!                         └── otherwise ─────────────────────► release_failed
//! ```
//!
//! Backoff is `base · 2^(attempt-1)`, capped, plus random jitter. The next
//! eligible time is persisted so the scheduler can pick the retry up after a
//! restart.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::ProtocolConfig;
use crate::errors::{EscrowError, Result};
use crate::events::EventPayload;
use crate::ledger;
use crate::notify::{emit, Notification};
use crate::policy::{authorize, Action, Principal, Resource};
use crate::types::{
    Amount, CampaignId, CampaignStatus, DisbursementResult, Milestone, MilestoneId,
    MilestoneStatus,
};
use crate::EscrowProtocol;

/// Actor recorded for work the protocol does on its own behalf.
pub const SCHEDULER_ACTOR: &str = "system:scheduler";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub destination_account: String,
    pub amount: Amount,
    pub idempotency_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PayoutOutcome {
    Success { transaction_id: String },
    Failure { reason: String, retryable: bool },
}

/// The external payment rail. An `Err` means the provider could not be
/// reached at all and is treated as a retryable failure.
#[async_trait]
pub trait PayoutProvider: Send + Sync {
    async fn payout(&self, request: &PayoutRequest) -> Result<PayoutOutcome>;
}

pub fn idempotency_key(milestone_id: MilestoneId, attempt: u32) -> String {
    format!("payout:{milestone_id}:attempt-{attempt}")
}

/// Delay before retrying after the failure of `attempt` (1-based).
pub fn backoff_delay(config: &ProtocolConfig, attempt: u32) -> StdDuration {
    let exp = attempt.saturating_sub(1).min(20);
    let base = config.backoff_base_ms.saturating_mul(1u64 << exp);
    let capped = base.min(config.backoff_max_ms);
    let jitter = if config.backoff_jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=config.backoff_jitter_ms)
    } else {
        0
    };
    StdDuration::from_millis(capped + jitter)
}

/// Marks a milestone as having a payout in progress in this process.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<MilestoneId>>,
    milestone_id: MilestoneId,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<MilestoneId>>, milestone_id: MilestoneId) -> Result<Self> {
        let inserted = set
            .lock()
            .map_err(|_| EscrowError::Storage("in-flight set poisoned".to_string()))?
            .insert(milestone_id);
        if !inserted {
            return Err(EscrowError::Conflict(format!(
                "a payout for milestone {milestone_id} is already in progress"
            )));
        }
        Ok(Self { set, milestone_id })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.milestone_id);
    }
}

/// Prior outcome for a milestone whose disbursement has concluded.
fn concluded(m: &Milestone) -> Option<DisbursementResult> {
    let d = &m.disbursement;
    match m.status {
        MilestoneStatus::Released => Some(DisbursementResult::Released {
            milestone_id: m.id,
            amount: m.released_amount,
            transaction_id: d.transaction_id.clone().unwrap_or_default(),
            attempts: d.attempts,
        }),
        MilestoneStatus::ReleaseFailed => Some(DisbursementResult::Failed {
            milestone_id: m.id,
            attempts: d.attempts,
            reason: d.last_failure.clone().unwrap_or_default(),
        }),
        _ => d.refund_candidate.map(|amount| DisbursementResult::Cancelled {
            milestone_id: m.id,
            refund_candidate: amount,
        }),
    }
}

impl EscrowProtocol {
    /// Pay out a verified milestone.
    ///
    /// Calling this again on a milestone that already concluded returns the
    /// earlier result and records nothing.
    pub async fn disburse(
        &self,
        principal: &Principal,
        milestone_id: MilestoneId,
    ) -> Result<DisbursementResult> {
        authorize(principal, Action::Disburse, Resource::Platform)?;
        let _guard = InFlightGuard::acquire(&self.in_flight, milestone_id)?;
        self.run_disbursement(&principal.id, milestone_id, true).await
    }

    /// Resume interrupted attempts and retries whose backoff has elapsed.
    ///
    /// Each due milestone gets one attempt. A retryable failure comes back as
    /// [`DisbursementResult::Scheduled`] and the next pass picks it up.
    pub async fn resume_due_disbursements(&self) -> Result<Vec<DisbursementResult>> {
        let now = self.now();
        let mut due = Vec::new();
        for campaign_id in self.campaign_ids() {
            let view = self.campaign(campaign_id)?;
            if view.campaign.frozen.is_some() {
                continue;
            }
            for m in view.milestones.values() {
                let d = &m.disbursement;
                let resumable = m.status == MilestoneStatus::Verified
                    && d.refund_candidate.is_none()
                    && (d.in_flight_attempt.is_some()
                        || d.next_eligible_at.is_some_and(|at| at <= now));
                if resumable {
                    due.push(m.id);
                }
            }
        }

        let mut results = Vec::with_capacity(due.len());
        for milestone_id in due {
            let Ok(_guard) = InFlightGuard::acquire(&self.in_flight, milestone_id) else {
                continue;
            };
            match self.run_disbursement(SCHEDULER_ACTOR, milestone_id, false).await {
                Ok(result) => results.push(result),
                Err(e) => error!("milestone {milestone_id}: resumed disbursement failed: {e}"),
            }
        }
        Ok(results)
    }

    /// With `retry_inline`, retryable failures are retried here after their
    /// backoff; otherwise the first one ends the run as `Scheduled`.
    async fn run_disbursement(
        &self,
        actor: &str,
        milestone_id: MilestoneId,
        retry_inline: bool,
    ) -> Result<DisbursementResult> {
        let campaign_id = self.locate_milestone(milestone_id)?;
        let token = self.cancellation_token(campaign_id)?;
        let mut waited = false;

        loop {
            let view = self.campaign(campaign_id)?;
            let m = view.milestone(milestone_id)?.clone();
            if let Some(done) = concluded(&m) {
                return Ok(done);
            }
            if m.status != MilestoneStatus::Verified {
                return Err(EscrowError::InvalidState(format!(
                    "milestone {milestone_id} is {}, only verified milestones disburse",
                    m.status
                )));
            }
            if let Some(reason) = &view.campaign.frozen {
                return Err(EscrowError::CampaignFrozen {
                    campaign_id,
                    reason: reason.clone(),
                });
            }

            let d = &m.disbursement;
            if view.campaign.status == CampaignStatus::Cancelled || token.is_cancelled() {
                return match d.in_flight_attempt {
                    Some(_) => {
                        self.record_refund_candidate(actor, campaign_id, milestone_id, d.in_flight_amount)
                            .await
                    }
                    None => Err(EscrowError::InvalidState(format!(
                        "campaign {campaign_id} is cancelled"
                    ))),
                };
            }

            let (attempt, amount) = match d.in_flight_attempt {
                Some(attempt) => {
                    info!("milestone {milestone_id}: resuming payout attempt {attempt}");
                    (attempt, d.in_flight_amount)
                }
                None => {
                    if let Some(at) = d.next_eligible_at.filter(|at| !waited && *at > self.now()) {
                        return Ok(DisbursementResult::Scheduled {
                            milestone_id,
                            next_eligible_at: at,
                        });
                    }
                    if !view.campaign.parallel_release {
                        if let Some(blocker) = view
                            .ordered_milestones()
                            .into_iter()
                            .find(|o| o.sequence_index < m.sequence_index && o.status != MilestoneStatus::Released)
                        {
                            return Err(EscrowError::InvalidState(format!(
                                "milestone {} must be released before {milestone_id}",
                                blocker.id
                            )));
                        }
                    }
                    let payable = ledger::releasable_amount(&view, &m);
                    if payable == 0 {
                        info!("milestone {milestone_id}: nothing payable yet, deferred");
                        return Ok(DisbursementResult::Deferred { milestone_id });
                    }
                    let attempt = d.attempts + 1;
                    self.start_attempt(actor, campaign_id, milestone_id, attempt, payable)
                        .await?;
                    (attempt, payable)
                }
            };

            let request = PayoutRequest {
                destination_account: view.campaign.payout_account.clone(),
                amount,
                idempotency_key: idempotency_key(milestone_id, attempt),
            };
            let outcome = tokio::select! {
                _ = token.cancelled() => {
                    warn!("milestone {milestone_id}: campaign cancelled during payout attempt {attempt}");
                    return self.record_refund_candidate(actor, campaign_id, milestone_id, amount).await;
                }
                called = tokio::time::timeout(
                    self.config.payout_timeout(),
                    self.collab.payouts.payout(&request),
                ) => match called {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => PayoutOutcome::Failure { reason: e.to_string(), retryable: true },
                    Err(_) => PayoutOutcome::Failure {
                        reason: format!("payout timed out after {} ms", self.config.payout_timeout_ms),
                        retryable: true,
                    },
                },
            };

            match outcome {
                PayoutOutcome::Success { transaction_id } => {
                    return self
                        .conclude_release(actor, campaign_id, milestone_id, amount, attempt, transaction_id)
                        .await;
                }
                PayoutOutcome::Failure { reason, retryable } => {
                    if !retryable || attempt >= self.config.max_payout_attempts {
                        return self
                            .conclude_failure(actor, campaign_id, milestone_id, attempt, reason, retryable)
                            .await;
                    }
                    let delay = backoff_delay(&self.config, attempt);
                    let next_eligible_at =
                        self.now() + Duration::milliseconds(delay.as_millis() as i64);
                    self.record(campaign_id, actor, |_| {
                        Ok(EventPayload::PayoutAttemptFailed {
                            milestone_id,
                            attempt,
                            reason: reason.clone(),
                            retryable: true,
                            next_eligible_at: Some(next_eligible_at),
                        })
                    })
                    .await?;
                    warn!(
                        "milestone {milestone_id}: payout attempt {attempt} failed ({reason}), retrying in {} ms",
                        delay.as_millis()
                    );
                    if !retry_inline {
                        return Ok(DisbursementResult::Scheduled {
                            milestone_id,
                            next_eligible_at,
                        });
                    }
                    tokio::select! {
                        _ = token.cancelled() => {
                            return self.record_refund_candidate(actor, campaign_id, milestone_id, amount).await;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    waited = true;
                }
            }
        }
    }

    async fn start_attempt(
        &self,
        actor: &str,
        campaign_id: CampaignId,
        milestone_id: MilestoneId,
        attempt: u32,
        amount: Amount,
    ) -> Result<()> {
        self.record(campaign_id, actor, |v| {
            let m = v.milestone(milestone_id)?;
            if m.disbursement.in_flight_attempt.is_some() || m.disbursement.attempts >= attempt {
                return Err(EscrowError::Conflict(format!(
                    "payout attempt {attempt} for milestone {milestone_id} already started"
                )));
            }
            Ok(EventPayload::PayoutAttempted {
                milestone_id,
                attempt,
                amount,
                idempotency_key: idempotency_key(milestone_id, attempt),
            })
        })
        .await?;
        info!("milestone {milestone_id}: payout attempt {attempt} for {amount}");
        Ok(())
    }

    async fn conclude_release(
        &self,
        actor: &str,
        campaign_id: CampaignId,
        milestone_id: MilestoneId,
        amount: Amount,
        attempt: u32,
        transaction_id: String,
    ) -> Result<DisbursementResult> {
        let view = self
            .apply_release(actor, campaign_id, milestone_id, amount, attempt, &transaction_id)
            .await?;
        info!("milestone {milestone_id}: released {amount} ({transaction_id})");

        if view.all_released() && view.campaign.status == CampaignStatus::Active {
            self.record(campaign_id, actor, |v| {
                if v.campaign.status != CampaignStatus::Active {
                    return Err(EscrowError::InvalidState(format!(
                        "campaign {campaign_id} is no longer active"
                    )));
                }
                Ok(EventPayload::CampaignCompleted)
            })
            .await?;
            info!("campaign {campaign_id} completed");
        }

        emit(
            self.collab.notifier.as_ref(),
            Notification::MilestoneReleased {
                campaign_id,
                milestone_id,
                amount,
                transaction_id: transaction_id.clone(),
            },
        )
        .await;
        Ok(DisbursementResult::Released {
            milestone_id,
            amount,
            transaction_id,
            attempts: attempt,
        })
    }

    async fn conclude_failure(
        &self,
        actor: &str,
        campaign_id: CampaignId,
        milestone_id: MilestoneId,
        attempt: u32,
        reason: String,
        retryable: bool,
    ) -> Result<DisbursementResult> {
        self.record(campaign_id, actor, |_| {
            Ok(EventPayload::PayoutAttemptFailed {
                milestone_id,
                attempt,
                reason: reason.clone(),
                retryable,
                next_eligible_at: None,
            })
        })
        .await?;
        self.record(campaign_id, actor, |_| {
            Ok(EventPayload::ReleaseFailed {
                milestone_id,
                attempts: attempt,
                reason: reason.clone(),
            })
        })
        .await?;
        error!("milestone {milestone_id}: release failed after {attempt} attempts: {reason}");
        emit(
            self.collab.notifier.as_ref(),
            Notification::ReleaseFailed {
                campaign_id,
                milestone_id,
                reason: reason.clone(),
            },
        )
        .await;
        Ok(DisbursementResult::Failed {
            milestone_id,
            attempts: attempt,
            reason,
        })
    }

    async fn record_refund_candidate(
        &self,
        actor: &str,
        campaign_id: CampaignId,
        milestone_id: MilestoneId,
        amount: Amount,
    ) -> Result<DisbursementResult> {
        self.record(campaign_id, actor, |_| {
            Ok(EventPayload::RefundCandidateRecorded {
                milestone_id,
                amount,
            })
        })
        .await?;
        warn!("milestone {milestone_id}: release of {amount} abandoned, recorded as refund candidate");
        Ok(DisbursementResult::Cancelled {
            milestone_id,
            refund_candidate: amount,
        })
    }
}
