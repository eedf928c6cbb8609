use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::events::{self, EventPayload};
use crate::notify::{BroadcastNotifier, Notification};
use crate::storage::MemoryEventStore;
use crate::testutils::{admin, charity, system, test_config, FailingNotifier, Harness, ScriptedPayouts, Step};
use crate::{
    Collaborators, Decision, DisbursementResult, DonationId, EscrowError, EscrowProtocol,
    LedgerEntryKind, NewCampaign,
};

#[tokio::test]
async fn test_review_and_release_notifications() {
    let h = Harness::new(&[Step::Succeed("tx-9")]).await;
    let cid = h.active_campaign(&[400, 600], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 1_000).await;

    let reviewer = admin(1);
    let proof = h.protocol.store_artifact(&charity(), "r.pdf", b"r").await.unwrap();
    let sub = h.protocol.submit_proof(&charity(), ms[0], vec![proof]).await.unwrap();
    h.protocol.claim_submission(&reviewer, sub.id).await.unwrap();
    h.protocol
        .decide(&reviewer, sub.id, Decision::Rejected, Some("missing receipt".to_string()))
        .await
        .unwrap();
    h.protocol.reopen_milestone(&charity(), ms[0]).await.unwrap();
    h.verify(ms[0]).await;
    h.protocol.disburse(&system(), ms[0]).await.unwrap();

    let seen = h.notifier.seen();
    assert_eq!(seen.len(), 3);
    assert!(matches!(
        &seen[0],
        Notification::MilestoneRejected { comment, .. } if comment == "missing receipt"
    ));
    assert!(matches!(seen[1], Notification::MilestoneVerified { .. }));
    assert!(matches!(
        &seen[2],
        Notification::MilestoneReleased { amount: 400, transaction_id, .. } if transaction_id == "tx-9"
    ));
}

#[tokio::test]
async fn test_release_failure_and_cancellation_notify() {
    let h = Harness::new(&[Step::Fatal("frozen account")]).await;
    let cid = h.active_campaign(&[400], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 400).await;
    h.verify(ms[0]).await;
    h.protocol.disburse(&system(), ms[0]).await.unwrap();
    h.protocol.cancel_campaign(&charity(), cid, "wound down").await.unwrap();

    let seen = h.notifier.seen();
    assert!(seen.iter().any(|n| matches!(n, Notification::ReleaseFailed { .. })));
    assert!(matches!(
        seen.last(),
        Some(Notification::CampaignCancelled { reason, .. }) if reason == "wound down"
    ));
}

#[tokio::test]
async fn test_notification_failure_never_rolls_back() {
    let payouts = ScriptedPayouts::new(&[]);
    let collab = Collaborators::new(payouts).with_notifier(Arc::new(FailingNotifier));
    let protocol = EscrowProtocol::open(test_config(), Arc::new(MemoryEventStore::new()), collab)
        .await
        .unwrap();

    let view = protocol
        .create_campaign(
            &charity(),
            NewCampaign {
                goal_amount: 100,
                deadline: Utc::now() + Duration::days(5),
                payout_account: "acct".to_string(),
                parallel_release: false,
                milestones: vec![100],
            },
        )
        .await
        .unwrap();
    let cid = view.campaign.id;
    protocol.activate_campaign(&charity(), cid).await.unwrap();
    protocol.cancel_campaign(&charity(), cid, "stop").await.unwrap();
    assert_eq!(
        protocol.campaign(cid).unwrap().campaign.status,
        crate::CampaignStatus::Cancelled
    );
}

#[tokio::test]
async fn test_broadcast_notifier_fans_out() {
    let notifier = Arc::new(BroadcastNotifier::new(16));
    let mut rx = notifier.subscribe();
    let payouts = ScriptedPayouts::new(&[]);
    let collab = Collaborators::new(payouts).with_notifier(notifier.clone());
    let protocol = EscrowProtocol::open(test_config(), Arc::new(MemoryEventStore::new()), collab)
        .await
        .unwrap();
    let view = protocol
        .create_campaign(
            &charity(),
            NewCampaign {
                goal_amount: 100,
                deadline: Utc::now() + Duration::days(5),
                payout_account: "acct".to_string(),
                parallel_release: false,
                milestones: vec![100],
            },
        )
        .await
        .unwrap();
    protocol
        .cancel_campaign(&charity(), view.campaign.id, "draft abandoned")
        .await
        .unwrap();
    let got = rx.recv().await.unwrap();
    assert!(matches!(got, Notification::CampaignCancelled { .. }));
}

#[tokio::test]
async fn test_stream_is_ordered_and_chained() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[500], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 500).await;
    h.verify(ms[0]).await;
    let result = h.protocol.disburse(&system(), ms[0]).await.unwrap();
    assert!(matches!(result, DisbursementResult::Released { .. }));

    let stream = h.protocol.stream_from(cid, 0).unwrap();
    for (i, e) in stream.iter().enumerate() {
        assert_eq!(e.sequence, i as u64 + 1);
        if i > 0 {
            assert_eq!(e.prev_hash, stream[i - 1].hash);
        }
    }
    assert_eq!(stream[0].prev_hash, events::GENESIS_HASH);
    assert!(matches!(stream.last().unwrap().payload, EventPayload::CampaignCompleted));

    let kinds: Vec<LedgerEntryKind> = h
        .protocol
        .ledger_entries(cid)
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![LedgerEntryKind::Hold, LedgerEntryKind::Release]);

    let tail = h.protocol.stream_from(cid, stream.len() as u64 - 2).unwrap();
    assert_eq!(tail.len(), 2);
}

#[tokio::test]
async fn test_tampered_stream_is_refused_on_load() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[500], false).await;
    h.donate(cid, 1, 500).await;

    let mut stream = h.protocol.stream_from(cid, 0).unwrap();
    for e in stream.iter_mut() {
        if let EventPayload::FundsHeld { amount, .. } = &mut e.payload {
            *amount = 5_000;
        }
    }
    let err = events::verify_chain(cid, &stream).unwrap_err();
    assert!(matches!(err, EscrowError::ChainBroken { .. }));

    let store = Arc::new(MemoryEventStore::with_events(stream));
    let reopened = EscrowProtocol::open(
        test_config(),
        store,
        Collaborators::new(ScriptedPayouts::new(&[])),
    )
    .await;
    assert!(matches!(reopened, Err(EscrowError::ChainBroken { .. })));
}

#[tokio::test]
async fn test_restart_rebuilds_queue_and_ids() {
    let h = Harness::new(&[]).await;
    let cid = h.active_campaign(&[500, 500], false).await;
    let ms = h.milestone_ids(cid);
    h.donate(cid, 1, 1_000).await;
    let proof = h.protocol.store_artifact(&charity(), "q.pdf", b"q").await.unwrap();
    let sub = h.protocol.submit_proof(&charity(), ms[0], vec![proof]).await.unwrap();
    h.protocol.claim_submission(&admin(1), sub.id).await.unwrap();

    let restarted = h.restart(&[]).await;
    let stats = restarted.protocol.stats(&admin(1)).unwrap();
    assert_eq!((stats.pending_verifications, stats.claimed_verifications), (0, 1));

    // The lease survived the restart.
    let err = restarted.protocol.claim_submission(&admin(2), sub.id).await.unwrap_err();
    assert!(err.is_retryable());
    restarted
        .protocol
        .decide(&admin(1), sub.id, Decision::Verified, None)
        .await
        .unwrap();

    let second = restarted
        .protocol
        .create_campaign(
            &charity(),
            NewCampaign {
                goal_amount: 10,
                deadline: Utc::now() + Duration::days(5),
                payout_account: "acct".to_string(),
                parallel_release: false,
                milestones: vec![10],
            },
        )
        .await
        .unwrap();
    assert!(second.campaign.id > cid);
    assert!(second.milestones.keys().all(|id| !ms.contains(id)));

    restarted
        .protocol
        .apply_hold(&crate::testutils::donor(1), cid, DonationId(1), 1_000)
        .await
        .unwrap();
    assert_eq!(restarted.protocol.balances(cid).unwrap().held, 1_000);
}
