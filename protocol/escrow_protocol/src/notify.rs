//! Domain notifications.
//!
//! Notifications are emitted after the corresponding event is committed and
//! are strictly fire-and-forget: a sink failure is logged and never undoes a
//! ledger mutation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::types::{Amount, CampaignId, MilestoneId, SubmissionId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    MilestoneVerified {
        campaign_id: CampaignId,
        milestone_id: MilestoneId,
        submission_id: SubmissionId,
    },
    MilestoneRejected {
        campaign_id: CampaignId,
        milestone_id: MilestoneId,
        submission_id: SubmissionId,
        comment: String,
    },
    MilestoneReleased {
        campaign_id: CampaignId,
        milestone_id: MilestoneId,
        amount: Amount,
        transaction_id: String,
    },
    ReleaseFailed {
        campaign_id: CampaignId,
        milestone_id: MilestoneId,
        reason: String,
    },
    CampaignCancelled {
        campaign_id: CampaignId,
        reason: String,
    },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), String>;
}

/// Sink that discards everything.
pub struct NullNotifier;

#[async_trait]
impl NotificationSink for NullNotifier {
    async fn notify(&self, _notification: Notification) -> Result<(), String> {
        Ok(())
    }
}

/// Fans notifications out over a broadcast channel. Having no subscribers is
/// not an error.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl NotificationSink for BroadcastNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), String> {
        let _ = self.tx.send(notification);
        Ok(())
    }
}

/// Deliver without letting a failure propagate.
pub(crate) async fn emit(sink: &dyn NotificationSink, notification: Notification) {
    if let Err(e) = sink.notify(notification).await {
        warn!("notification delivery failed: {e}");
    }
}
