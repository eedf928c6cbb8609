use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use crate::events::EventPayload;
use crate::invariants::assert_all_campaign_invariants;
use crate::projection::CampaignView;
use crate::testutils::{admin, charity, donor, system, test_config, Harness, Step};
use crate::{
    CampaignStatus, Decision, DisbursementResult, DonationId, EscrowError, LedgerEntryKind,
    MilestoneStatus, NewCampaign, Principal, Priority, ProtocolConfig, Role,
};

fn release_entries(h: &Harness, campaign_id: crate::CampaignId) -> usize {
    h.protocol
        .ledger_entries(campaign_id)
        .unwrap()
        .iter()
        .filter(|e| e.kind == LedgerEntryKind::Release)
        .count()
}

// ─────────────────────────────────────────────────────────
// Fully funded campaign releases everything
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fully_funded_campaign_releases_every_milestone() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[60_000, 40_000], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 70_000).await;
    h.donate(cid, 2, 30_000).await;

    h.verify(ms[0]).await;
    let first = h.protocol.disburse(&system(), ms[0]).await.unwrap();
    assert!(matches!(first, DisbursementResult::Released { amount: 60_000, .. }));

    h.verify(ms[1]).await;
    let second = h.protocol.disburse(&system(), ms[1]).await.unwrap();
    assert!(matches!(second, DisbursementResult::Released { amount: 40_000, .. }));

    let view = h.protocol.campaign(cid).unwrap();
    assert_eq!(view.campaign.held_amount, 100_000);
    assert_eq!(view.campaign.released_amount, 100_000);
    assert_eq!(view.campaign.status, CampaignStatus::Completed);
    assert!(view.donations.iter().all(|d| d.unallocated() == 0));
    assert_all_campaign_invariants(&view);
}

// ─────────────────────────────────────────────────────────
// Under-raised campaign releases only what it holds
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_under_raised_campaign_defers_unfunded_milestone() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[60_000, 40_000], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 50_000).await;

    h.verify(ms[0]).await;
    let first = h.protocol.disburse(&system(), ms[0]).await.unwrap();
    assert!(matches!(first, DisbursementResult::Released { amount: 50_000, .. }));

    h.verify(ms[1]).await;
    let second = h.protocol.disburse(&system(), ms[1]).await.unwrap();
    assert_eq!(second, DisbursementResult::Deferred { milestone_id: ms[1] });
    assert_eq!(h.protocol.milestone(ms[1]).unwrap().status, MilestoneStatus::Verified);
    assert!(h.payouts.requests().len() == 1);

    // Later funds make the milestone payable.
    h.donate(cid, 2, 50_000).await;
    let third = h.protocol.disburse(&system(), ms[1]).await.unwrap();
    assert!(matches!(third, DisbursementResult::Released { amount: 40_000, .. }));
    let b = h.protocol.balances(cid).unwrap();
    assert_eq!((b.held, b.released), (100_000, 90_000));
}

#[tokio::test]
async fn test_completed_campaign_refunds_its_shortfall() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[60_000, 40_000], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 50_000).await;
    h.verify(ms[0]).await;
    h.protocol.disburse(&system(), ms[0]).await.unwrap();
    h.donate(cid, 2, 50_000).await;
    h.verify(ms[1]).await;
    h.protocol.disburse(&system(), ms[1]).await.unwrap();

    let view = h.protocol.campaign(cid).unwrap();
    assert_eq!(view.campaign.status, CampaignStatus::Completed);
    assert_eq!((view.campaign.held_amount, view.campaign.released_amount), (100_000, 90_000));

    let b = h.protocol.apply_refund(&admin(1), cid, 10_000).await.unwrap();
    assert_eq!((b.held, b.released), (90_000, 90_000));
    let err = h.protocol.apply_refund(&admin(1), cid, 1).await.unwrap_err();
    assert!(matches!(err, EscrowError::InsufficientFunds { available: 0, .. }));
    assert_all_campaign_invariants(&h.protocol.campaign(cid).unwrap());
}

// ─────────────────────────────────────────────────────────
// Concurrent reviewers and ledger writers
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_claims_admit_exactly_one_reviewer() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[1_000], false).await;
    let ms = h.milestone_ids(cid);
    let proof = h.protocol.store_artifact(&charity(), "photo.jpg", b"jpeg").await.unwrap();
    let sub = h.protocol.submit_proof(&charity(), ms[0], vec![proof]).await.unwrap();

    let (a, b) = (admin(1), admin(2));
    let (ra, rb) = tokio::join!(
        h.protocol.claim_submission(&a, sub.id),
        h.protocol.claim_submission(&b, sub.id)
    );
    assert!(ra.is_ok() ^ rb.is_ok());
    let loser = if ra.is_ok() { rb } else { ra };
    assert!(matches!(loser, Err(EscrowError::Conflict(_))));
    assert_eq!(h.protocol.milestone(ms[0]).unwrap().status, MilestoneStatus::InReview);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_holds_racing_a_release_keep_the_ledger_consistent() {
    let config = ProtocolConfig {
        conflict_retries: 50,
        ..test_config()
    };
    let h = Harness::with_config(config, &[]).await;
    let cid = h.active_campaign(&[600, 400], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 600).await;
    h.verify(ms[0]).await;

    let mut holds = Vec::new();
    for n in 2..12u64 {
        let protocol = h.protocol.clone();
        holds.push(tokio::spawn(async move {
            protocol.apply_hold(&donor(n as u32), cid, DonationId(n), 40).await
        }));
    }
    let protocol = h.protocol.clone();
    let milestone = ms[0];
    let release = tokio::spawn(async move { protocol.disburse(&admin(1), milestone).await });

    for hold in holds {
        hold.await.unwrap().unwrap();
    }
    let released = release.await.unwrap().unwrap();
    assert!(matches!(released, DisbursementResult::Released { amount: 600, .. }));

    let view = h.protocol.campaign(cid).unwrap();
    assert_eq!(view.campaign.held_amount, 1_000);
    assert_eq!(view.campaign.released_amount, 600);
    assert_eq!(view.donations.len(), 11);
    assert_eq!(release_entries(&h, cid), 1);
    assert_all_campaign_invariants(&view);
    h.protocol.verify_chain(cid).unwrap();
}

// ─────────────────────────────────────────────────────────
// Lease expiry and queue order
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_expired_lease_lets_another_admin_decide() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[1_000], false).await;
    let ms = h.milestone_ids(cid);
    let proof = h.protocol.store_artifact(&charity(), "photo.jpg", b"jpeg").await.unwrap();
    let sub = h.protocol.submit_proof(&charity(), ms[0], vec![proof]).await.unwrap();

    let (first, second) = (admin(1), admin(2));
    assert_eq!(h.protocol.claim_next(&first).await.unwrap().unwrap().id, sub.id);
    assert!(h.protocol.claim_next(&second).await.unwrap().is_none());

    h.clock.advance(Duration::minutes(16));
    let claimed = h.protocol.claim_next(&second).await.unwrap().unwrap();
    assert_eq!(claimed.reviewer_id.as_deref(), Some("admin-2"));

    let stale = h
        .protocol
        .decide(&first, sub.id, Decision::Verified, None)
        .await
        .unwrap_err();
    assert!(matches!(stale, EscrowError::Authorization { .. }));

    let m = h
        .protocol
        .decide(&second, sub.id, Decision::Verified, None)
        .await
        .unwrap();
    assert_eq!(m.status, MilestoneStatus::Verified);
    assert_eq!(
        h.protocol.submission(sub.id).unwrap().reviewer_id.as_deref(),
        Some("admin-2")
    );
}

#[tokio::test]
async fn test_decision_is_refused_once_the_recorded_lease_moved_on() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[1_000], false).await;
    let ms = h.milestone_ids(cid);
    let proof = h.protocol.store_artifact(&charity(), "photo.jpg", b"jpeg").await.unwrap();
    let sub = h.protocol.submit_proof(&charity(), ms[0], vec![proof]).await.unwrap();
    h.protocol.claim_submission(&admin(1), sub.id).await.unwrap();

    // The stream hands the lease to admin-2 while the queue still shows admin-1.
    let head = h.protocol.campaign(cid).unwrap().head;
    h.protocol
        .log
        .append(
            cid,
            head,
            "admin-2",
            h.clock_now(),
            EventPayload::ReviewClaimed {
                submission_id: sub.id,
                milestone_id: ms[0],
                reviewer_id: "admin-2".to_string(),
                lease_expires_at: h.clock_now() + Duration::minutes(15),
            },
        )
        .await
        .unwrap();

    let err = h
        .protocol
        .decide(&admin(1), sub.id, Decision::Verified, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::Authorization { .. }));
    assert!(h.protocol.submission(sub.id).unwrap().is_active());
    assert_eq!(h.protocol.milestone(ms[0]).unwrap().status, MilestoneStatus::InReview);
}

#[tokio::test]
async fn test_escalated_submission_is_served_first_across_restarts() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[500, 500], true).await;
    let ms = h.milestone_ids(cid);
    let proof = h.protocol.store_artifact(&charity(), "a.pdf", b"x").await.unwrap();
    let older = h.protocol.submit_proof(&charity(), ms[0], vec![proof.clone()]).await.unwrap();
    h.clock.advance(Duration::minutes(1));
    let newer = h.protocol.submit_proof(&charity(), ms[1], vec![proof]).await.unwrap();

    let reviewer = Principal::new("rev-1", &[Role::Reviewer]);
    let denied = h
        .protocol
        .prioritize_submission(&reviewer, newer.id, Priority::Escalated)
        .await
        .unwrap_err();
    assert!(matches!(denied, EscrowError::Authorization { .. }));

    let escalated = h
        .protocol
        .prioritize_submission(&admin(1), newer.id, Priority::Escalated)
        .await
        .unwrap();
    assert_eq!(escalated.priority, Priority::Escalated);
    assert_eq!(h.protocol.submission(older.id).unwrap().priority, Priority::Normal);

    let restarted = h.restart(&[]).await;
    let first = restarted.protocol.claim_next(&admin(2)).await.unwrap().unwrap();
    assert_eq!(first.id, newer.id);
    let second = restarted.protocol.claim_next(&admin(3)).await.unwrap().unwrap();
    assert_eq!(second.id, older.id);

    restarted
        .protocol
        .decide(&admin(2), newer.id, Decision::Verified, None)
        .await
        .unwrap();
    let decided = restarted
        .protocol
        .prioritize_submission(&admin(1), newer.id, Priority::Normal)
        .await;
    assert!(decided.is_err());
}

#[tokio::test]
async fn test_sweep_records_lease_expiry() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[1_000], false).await;
    let ms = h.milestone_ids(cid);
    let proof = h.protocol.store_artifact(&charity(), "a.pdf", b"x").await.unwrap();
    let sub = h.protocol.submit_proof(&charity(), ms[0], vec![proof]).await.unwrap();
    h.protocol.claim_submission(&admin(1), sub.id).await.unwrap();

    assert_eq!(h.protocol.sweep_expired_leases().await.unwrap(), 0);
    h.clock.advance(Duration::minutes(20));
    assert_eq!(h.protocol.sweep_expired_leases().await.unwrap(), 1);

    assert_eq!(h.protocol.milestone(ms[0]).unwrap().status, MilestoneStatus::ProofSubmitted);
    let last = h.protocol.stream_from(cid, 0).unwrap().pop().unwrap();
    assert!(matches!(last.payload, EventPayload::ReviewUnclaimed { expired: true, .. }));
}

// ─────────────────────────────────────────────────────────
// Transient payout failures
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_retryable_failures_then_success() {
    let h = Harness::new(&[
        Step::Retryable("gateway busy"),
        Step::Unreachable,
        Step::Succeed("tx-final"),
    ])
    .await;
    let cid = h.active_campaign(&[5_000], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 5_000).await;
    h.verify(ms[0]).await;

    let result = h.protocol.disburse(&system(), ms[0]).await.unwrap();
    assert_eq!(
        result,
        DisbursementResult::Released {
            milestone_id: ms[0],
            amount: 5_000,
            transaction_id: "tx-final".to_string(),
            attempts: 3,
        }
    );
    assert_eq!(release_entries(&h, cid), 1);

    let keys: Vec<String> = h.payouts.requests().into_iter().map(|r| r.idempotency_key).collect();
    assert_eq!(keys.len(), 3);
    assert_ne!(keys[0], keys[1]);
    assert_ne!(keys[1], keys[2]);

    let m = h.protocol.milestone(ms[0]).unwrap();
    assert_eq!(m.disbursement.transaction_id.as_deref(), Some("tx-final"));
    assert_eq!(m.disbursement.attempts, 3);
}

#[tokio::test]
async fn test_disburse_twice_returns_prior_result() {
    let h = Harness::new(&[Step::Succeed("tx-1")]).await;
    let cid = h.active_campaign(&[2_000], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 2_000).await;
    h.verify(ms[0]).await;

    let first = h.protocol.disburse(&system(), ms[0]).await.unwrap();
    let head = h.protocol.campaign(cid).unwrap().head;
    let again = h.protocol.disburse(&admin(1), ms[0]).await.unwrap();

    assert_eq!(first, again);
    assert_eq!(h.protocol.campaign(cid).unwrap().head, head);
    assert_eq!(h.payouts.requests().len(), 1);
    assert_eq!(release_entries(&h, cid), 1);
}

#[tokio::test]
async fn test_non_retryable_failure_marks_release_failed() {
    let h = Harness::new(&[Step::Fatal("account closed")]).await;
    let cid = h.active_campaign(&[2_000], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 2_000).await;
    h.verify(ms[0]).await;

    let result = h.protocol.disburse(&system(), ms[0]).await.unwrap();
    assert!(matches!(result, DisbursementResult::Failed { attempts: 1, .. }));
    let m = h.protocol.milestone(ms[0]).unwrap();
    assert_eq!(m.status, MilestoneStatus::ReleaseFailed);
    assert_eq!(m.disbursement.last_failure.as_deref(), Some("account closed"));
    assert_eq!(h.protocol.balances(cid).unwrap().released, 0);
}

#[tokio::test]
async fn test_retries_stop_at_attempt_cap() {
    let config = ProtocolConfig {
        max_payout_attempts: 3,
        ..test_config()
    };
    let h = Harness::with_config(
        config,
        &[Step::Retryable("a"), Step::Retryable("b"), Step::Retryable("c"), Step::Succeed("late")],
    )
    .await;
    let cid = h.active_campaign(&[2_000], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 2_000).await;
    h.verify(ms[0]).await;

    let result = h.protocol.disburse(&system(), ms[0]).await.unwrap();
    assert!(matches!(result, DisbursementResult::Failed { attempts: 3, .. }));
    assert_eq!(h.payouts.requests().len(), 3);
}

#[tokio::test]
async fn test_timed_out_payout_is_retried() {
    let h = Harness::new(&[Step::Hang, Step::Succeed("tx-after-timeout")]).await;
    let cid = h.active_campaign(&[2_000], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 2_000).await;
    h.verify(ms[0]).await;

    let result = h.protocol.disburse(&system(), ms[0]).await.unwrap();
    assert!(matches!(result, DisbursementResult::Released { attempts: 2, .. }));
}

// ─────────────────────────────────────────────────────────
// Release preconditions
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unverified_milestone_never_releases() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[1_000], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 1_000).await;

    let err = h.protocol.disburse(&system(), ms[0]).await.unwrap_err();
    assert!(matches!(err, EscrowError::InvalidState(_)));
    assert!(h.payouts.requests().is_empty());
    assert_eq!(release_entries(&h, cid), 0);
}

#[tokio::test]
async fn test_sequential_release_waits_for_earlier_milestones() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[500, 500], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 1_000).await;
    h.verify(ms[1]).await;

    let err = h.protocol.disburse(&system(), ms[1]).await.unwrap_err();
    assert!(matches!(err, EscrowError::InvalidState(_)));
}

#[tokio::test]
async fn test_parallel_release_ignores_order() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[500, 500], true).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 1_000).await;
    h.verify(ms[1]).await;

    let result = h.protocol.disburse(&system(), ms[1]).await.unwrap();
    assert!(matches!(result, DisbursementResult::Released { amount: 500, .. }));
}

#[tokio::test]
async fn test_only_admin_or_system_disburses() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[500], false).await;
    let ms = h.milestone_ids(cid);
    let err = h.protocol.disburse(&charity(), ms[0]).await.unwrap_err();
    assert!(matches!(err, EscrowError::Authorization { .. }));
}

// ─────────────────────────────────────────────────────────
// Cancellation and restarts
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancellation_mid_payout_records_refund_candidate() {
    let config = ProtocolConfig {
        payout_timeout_ms: 60_000,
        ..test_config()
    };
    let h = Harness::with_config(config, &[Step::Hang]).await;
    let cid = h.active_campaign(&[3_000], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 3_000).await;
    h.verify(ms[0]).await;

    let protocol = h.protocol.clone();
    let milestone = ms[0];
    let task = tokio::spawn(async move { protocol.disburse(&system(), milestone).await });
    while h.payouts.requests().is_empty() {
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }

    h.protocol.cancel_campaign(&charity(), cid, "charity closed").await.unwrap();
    let result = task.await.unwrap().unwrap();
    assert_eq!(
        result,
        DisbursementResult::Cancelled {
            milestone_id: ms[0],
            refund_candidate: 3_000,
        }
    );

    let m = h.protocol.milestone(ms[0]).unwrap();
    assert_ne!(m.status, MilestoneStatus::Released);
    assert_eq!(m.disbursement.refund_candidate, Some(3_000));
    assert_eq!(m.disbursement.in_flight_attempt, None);

    // The abandoned amount is refundable once the reservation is gone.
    let b = h.protocol.apply_refund(&admin(1), cid, 3_000).await.unwrap();
    assert_eq!(b.held, 0);
    assert_all_campaign_invariants(&h.protocol.campaign(cid).unwrap());
}

#[tokio::test]
async fn test_interrupted_attempt_resumes_with_same_key() {
    let config = ProtocolConfig {
        payout_timeout_ms: 60_000,
        ..test_config()
    };
    let h = Harness::with_config(config, &[Step::Hang]).await;
    let cid = h.active_campaign(&[3_000], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 3_000).await;
    h.verify(ms[0]).await;

    let protocol = h.protocol.clone();
    let milestone = ms[0];
    let task = tokio::spawn(async move { protocol.disburse(&system(), milestone).await });
    while h.payouts.requests().is_empty() {
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    task.abort();
    let _ = task.await;
    let key = h.payouts.requests()[0].idempotency_key.clone();

    let restarted = h.restart(&[]).await;
    assert_eq!(
        restarted.protocol.milestone(ms[0]).unwrap().disbursement.in_flight_attempt,
        Some(1)
    );
    let results = restarted.protocol.resume_due_disbursements().await.unwrap();
    assert!(matches!(results[..], [DisbursementResult::Released { attempts: 1, .. }]));
    assert_eq!(restarted.payouts.requests()[0].idempotency_key, key);
}

#[tokio::test]
async fn test_persisted_backoff_survives_restart() {
    let config = ProtocolConfig {
        backoff_base_ms: 60_000,
        backoff_max_ms: 60_000,
        ..test_config()
    };
    let h = Harness::with_config(config, &[Step::Retryable("busy")]).await;
    let cid = h.active_campaign(&[3_000], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 3_000).await;
    h.verify(ms[0]).await;

    let protocol = h.protocol.clone();
    let milestone = ms[0];
    let task = tokio::spawn(async move { protocol.disburse(&system(), milestone).await });
    while h.protocol.milestone(ms[0]).unwrap().disbursement.next_eligible_at.is_none() {
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    task.abort();
    let _ = task.await;

    let restarted = h.restart(&[]).await;
    let early = restarted.protocol.disburse(&system(), ms[0]).await.unwrap();
    assert!(matches!(early, DisbursementResult::Scheduled { .. }));
    assert!(restarted.protocol.resume_due_disbursements().await.unwrap().is_empty());

    h.clock.advance(Duration::minutes(2));
    let results = restarted.protocol.resume_due_disbursements().await.unwrap();
    assert!(matches!(results[..], [DisbursementResult::Released { attempts: 2, .. }]));
}

#[tokio::test]
async fn test_scheduler_pass_makes_one_attempt_per_milestone() {
    let config = ProtocolConfig {
        payout_timeout_ms: 60_000,
        ..test_config()
    };
    let h = Harness::with_config(config, &[Step::Hang]).await;
    let cid = h.active_campaign(&[3_000], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 3_000).await;
    h.verify(ms[0]).await;

    let protocol = h.protocol.clone();
    let milestone = ms[0];
    let task = tokio::spawn(async move { protocol.disburse(&system(), milestone).await });
    while h.payouts.requests().is_empty() {
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    task.abort();
    let _ = task.await;

    let restarted = h.restart(&[Step::Retryable("busy"), Step::Succeed("tx-next-pass")]).await;
    let first = restarted.protocol.resume_due_disbursements().await.unwrap();
    assert!(matches!(first[..], [DisbursementResult::Scheduled { .. }]));
    assert_eq!(restarted.payouts.requests().len(), 1);

    // Backoff runs on the manual clock, so nothing is due until it moves.
    assert!(restarted.protocol.resume_due_disbursements().await.unwrap().is_empty());
    h.clock.advance(Duration::seconds(1));
    let second = restarted.protocol.resume_due_disbursements().await.unwrap();
    assert!(matches!(second[..], [DisbursementResult::Released { attempts: 2, .. }]));
    assert_eq!(restarted.payouts.requests().len(), 2);
}

#[tokio::test]
async fn test_replay_reproduces_campaign_state() {
    let h = Harness::new(&[Step::Retryable("busy")]).await;
    let cid = h.active_campaign(&[600, 400], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 700).await;
    h.protocol.record_pledge(&donor(2), cid, 250).await.unwrap();
    h.verify(ms[0]).await;
    h.protocol.disburse(&system(), ms[0]).await.unwrap();
    h.protocol.apply_refund(&admin(1), cid, 50).await.unwrap();

    let live = h.protocol.campaign(cid).unwrap();
    let replayed = CampaignView::replay(&h.protocol.stream_from(cid, 0).unwrap()).unwrap();
    assert_eq!(*live, replayed);

    let restarted = h.restart(&[]).await;
    assert_eq!(*restarted.protocol.campaign(cid).unwrap(), *live);
    restarted.protocol.verify_chain(cid).unwrap();
}

// ─────────────────────────────────────────────────────────
// Review loop
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rejection_requires_comment_and_resubmissions_are_bounded() {
    let config = ProtocolConfig {
        max_resubmissions: 1,
        ..test_config()
    };
    let h = Harness::with_config(config, &[]).await;
    let cid = h.active_campaign(&[1_000], false).await;
    let ms = h.milestone_ids(cid);
    let reviewer = admin(1);

    for round in 0..2 {
        let proof = h.protocol.store_artifact(&charity(), "p.pdf", &[round]).await.unwrap();
        let sub = h.protocol.submit_proof(&charity(), ms[0], vec![proof]).await.unwrap();
        h.protocol.claim_submission(&reviewer, sub.id).await.unwrap();
        let err = h
            .protocol
            .decide(&reviewer, sub.id, Decision::Rejected, Some("  ".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
        let m = h
            .protocol
            .decide(&reviewer, sub.id, Decision::Rejected, Some("blurry photo".to_string()))
            .await
            .unwrap();
        assert_eq!(m.status, MilestoneStatus::Rejected);

        let reopened = h.protocol.reopen_milestone(&charity(), ms[0]).await.unwrap();
        if round == 0 {
            assert_eq!(reopened, MilestoneStatus::Pending);
        } else {
            assert_eq!(reopened, MilestoneStatus::RejectedFinal);
        }
    }

    let proof = h.protocol.store_artifact(&charity(), "p.pdf", b"late").await.unwrap();
    let err = h.protocol.submit_proof(&charity(), ms[0], vec![proof]).await.unwrap_err();
    assert!(matches!(err, EscrowError::InvalidState(_)));
}

#[tokio::test]
async fn test_proof_rules() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[1_000], false).await;
    let ms = h.milestone_ids(cid);

    let empty = h.protocol.submit_proof(&charity(), ms[0], vec![]).await.unwrap_err();
    assert!(matches!(empty, EscrowError::Validation(_)));

    let unknown = h
        .protocol
        .submit_proof(&charity(), ms[0], vec!["sha256:00/missing.pdf".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(unknown, EscrowError::Validation(_)));

    let proof = h.protocol.store_artifact(&charity(), "a.pdf", b"x").await.unwrap();
    let stranger = Principal::new("charity-2", &[Role::Charity]);
    let denied = h
        .protocol
        .submit_proof(&stranger, ms[0], vec![proof.clone()])
        .await
        .unwrap_err();
    assert!(matches!(denied, EscrowError::Authorization { .. }));

    h.protocol.submit_proof(&charity(), ms[0], vec![proof.clone()]).await.unwrap();
    let twice = h.protocol.submit_proof(&charity(), ms[0], vec![proof]).await.unwrap_err();
    assert!(matches!(twice, EscrowError::InvalidState(_)));
}

#[tokio::test]
async fn test_no_proof_on_cancelled_campaign() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[1_000], false).await;
    let ms = h.milestone_ids(cid);
    let proof = h.protocol.store_artifact(&charity(), "a.pdf", b"x").await.unwrap();
    h.protocol.cancel_campaign(&admin(1), cid, "fraud report").await.unwrap();

    let err = h.protocol.submit_proof(&charity(), ms[0], vec![proof]).await.unwrap_err();
    assert!(matches!(err, EscrowError::InvalidState(_)));
}

// ─────────────────────────────────────────────────────────
// Lifecycle and ledger rules
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_activation_requires_targets_matching_goal() {
    let h = Harness::new(&[]).await;
    let view = h
        .protocol
        .create_campaign(
            &charity(),
            NewCampaign {
                goal_amount: 1_000,
                deadline: Utc::now() + Duration::days(10),
                payout_account: "acct".to_string(),
                parallel_release: false,
                milestones: vec![400],
            },
        )
        .await
        .unwrap();
    let cid = view.campaign.id;
    assert_eq!(view.campaign.status, CampaignStatus::Draft);

    let err = h.protocol.activate_campaign(&charity(), cid).await.unwrap_err();
    assert!(matches!(err, EscrowError::Validation(_)));
    let hold = h
        .protocol
        .apply_hold(&donor(1), cid, DonationId(1), 10)
        .await
        .unwrap_err();
    assert!(matches!(hold, EscrowError::InvalidState(_)));

    h.protocol.add_milestone(&charity(), cid, 600).await.unwrap();
    let over = h.protocol.add_milestone(&charity(), cid, 1).await.unwrap_err();
    assert!(matches!(over, EscrowError::Validation(_)));
    h.protocol.activate_campaign(&charity(), cid).await.unwrap();

    let late = h.protocol.add_milestone(&charity(), cid, 1).await.unwrap_err();
    assert!(matches!(late, EscrowError::InvalidState(_)));
}

#[tokio::test]
async fn test_invalid_milestone_leaves_no_draft_behind() {
    let h = Harness::new(&[]).await;
    let err = h
        .protocol
        .create_campaign(
            &charity(),
            NewCampaign {
                goal_amount: 1_000,
                deadline: Utc::now() + Duration::days(10),
                payout_account: "acct".to_string(),
                parallel_release: false,
                milestones: vec![500, 0],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::Validation(_)));
    assert!(h.protocol.campaign_ids().is_empty());
}

#[tokio::test]
async fn test_amounts_past_the_representable_range_are_rejected() {
    let h = Harness::new(&[]).await;
    let err = h
        .protocol
        .create_campaign(
            &charity(),
            NewCampaign {
                goal_amount: i64::MAX,
                deadline: Utc::now() + Duration::days(10),
                payout_account: "acct".to_string(),
                parallel_release: false,
                milestones: vec![i64::MAX, 1],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::Validation(_)));

    let cid = h.active_campaign(&[1_000], false).await;
    h.donate(cid, 1, i64::MAX).await;
    let err = h
        .protocol
        .apply_hold(&donor(1), cid, DonationId(2), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::Validation(_)));
    assert_eq!(h.protocol.balances(cid).unwrap().held, i64::MAX);
}

#[tokio::test]
async fn test_only_charities_create_campaigns() {
    let h = Harness::new(&[]).await;
    let err = h
        .protocol
        .create_campaign(
            &donor(1),
            NewCampaign {
                goal_amount: 100,
                deadline: Utc::now() + Duration::days(1),
                payout_account: "acct".to_string(),
                parallel_release: false,
                milestones: vec![100],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::Authorization { .. }));
}

#[tokio::test]
async fn test_duplicate_donation_confirmation_is_idempotent() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[1_000], false).await;
    h.donate(cid, 7, 300).await;
    h.donate(cid, 7, 300).await;
    assert_eq!(h.protocol.balances(cid).unwrap().held, 300);

    let mismatch = h
        .protocol
        .apply_hold(&donor(1), cid, DonationId(7), 301)
        .await
        .unwrap_err();
    assert!(matches!(mismatch, EscrowError::Validation(_)));
}

#[tokio::test]
async fn test_refund_cannot_exceed_unreleased_funds() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[600, 400], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 1_000).await;
    h.verify(ms[0]).await;
    h.protocol.disburse(&system(), ms[0]).await.unwrap();

    let err = h.protocol.apply_refund(&admin(1), cid, 401).await.unwrap_err();
    assert!(matches!(
        err,
        EscrowError::InsufficientFunds {
            requested: 401,
            available: 400
        }
    ));
    let b = h.protocol.apply_refund(&admin(1), cid, 400).await.unwrap();
    assert_eq!((b.held, b.released), (600, 600));
}

#[tokio::test]
async fn test_frozen_campaign_refuses_mutations_until_reconciled() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[1_000], false).await;
    h.donate(cid, 1, 100).await;

    // Bypass the ledger planner to force an inconsistent event.
    let head = h.protocol.campaign(cid).unwrap().head;
    let err = h
        .protocol
        .log
        .append(cid, head, "admin-1", Utc::now(), EventPayload::FundsRefunded { amount: 500 })
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::InvariantViolation { .. }));

    let refused = h.protocol.apply_hold(&donor(1), cid, DonationId(2), 10).await.unwrap_err();
    assert!(matches!(refused, EscrowError::CampaignFrozen { .. }));
    assert_eq!(h.protocol.stats(&admin(1)).unwrap().frozen_campaigns, 1);
    assert_eq!(h.protocol.balances(cid).unwrap().held, 100);

    let denied = h
        .protocol
        .clear_reconciliation(&charity(), cid, "looked fine")
        .await
        .unwrap_err();
    assert!(matches!(denied, EscrowError::Authorization { .. }));

    h.protocol
        .clear_reconciliation(&admin(1), cid, "bad import reverted")
        .await
        .unwrap();
    h.protocol.apply_hold(&donor(1), cid, DonationId(2), 10).await.unwrap();
    assert_eq!(h.protocol.balances(cid).unwrap().held, 110);
}

#[tokio::test]
async fn test_dashboard_stats() {
    let h = Harness::new(&[Step::Fatal("closed")]).await;
    let cid = h.active_campaign(&[300, 300, 400], true).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 1_000).await;

    h.verify(ms[0]).await;
    h.protocol.disburse(&system(), ms[0]).await.unwrap();
    h.verify(ms[1]).await;
    let proof = h.protocol.store_artifact(&charity(), "p.pdf", b"p").await.unwrap();
    h.protocol.submit_proof(&charity(), ms[2], vec![proof]).await.unwrap();

    let stats = h.protocol.stats(&admin(1)).unwrap();
    assert_eq!(stats.active_campaigns, 1);
    assert_eq!(stats.pending_verifications, 1);
    assert_eq!(stats.claimed_verifications, 0);
    assert_eq!(stats.awaiting_payout, 1);
    assert_eq!(stats.awaiting_payout_amount, 300);
    assert_eq!(stats.release_failed, 1);

    let forbidden = h.protocol.stats(&donor(1)).unwrap_err();
    assert!(matches!(forbidden, EscrowError::Authorization { .. }));
}
