//! Append-only audit log with per-campaign optimistic concurrency.
//!
//! Each campaign owns an independent stream guarded by its own writer lock,
//! so appends to unrelated campaigns never wait on each other. Readers take
//! a cheap `Arc` snapshot of the latest committed [`CampaignView`] and never
//! hold a lock while the writer is persisting.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::errors::{EscrowError, Result};
use crate::events::{self, AuditEvent, EventPayload, GENESIS_HASH};
use crate::invariants;
use crate::projection::CampaignView;
use crate::storage::EventStore;
use crate::types::{CampaignId, LedgerEntry};

struct StreamState {
    events: Vec<AuditEvent>,
    view: Arc<CampaignView>,
}

struct CampaignStream {
    /// Serializes appends; held across the store write.
    writer: tokio::sync::Mutex<()>,
    state: RwLock<StreamState>,
}

impl CampaignStream {
    fn new(events: Vec<AuditEvent>, view: CampaignView) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(()),
            state: RwLock::new(StreamState {
                events,
                view: Arc::new(view),
            }),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, StreamState>> {
        self.state
            .read()
            .map_err(|_| EscrowError::Storage("stream lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, StreamState>> {
        self.state
            .write()
            .map_err(|_| EscrowError::Storage("stream lock poisoned".to_string()))
    }
}

/// Result of a successful append.
#[derive(Clone, Debug)]
pub struct Appended {
    pub sequence: u64,
    pub view: Arc<CampaignView>,
}

pub struct AuditLog {
    store: Arc<dyn EventStore>,
    streams: RwLock<HashMap<CampaignId, Arc<CampaignStream>>>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild every campaign stream from the store, verifying each chain.
    pub async fn load(store: Arc<dyn EventStore>) -> Result<Self> {
        let mut by_campaign: HashMap<CampaignId, Vec<AuditEvent>> = HashMap::new();
        for event in store.load_all().await? {
            by_campaign.entry(event.campaign_id).or_default().push(event);
        }

        let mut streams = HashMap::with_capacity(by_campaign.len());
        for (campaign_id, mut events) in by_campaign {
            events.sort_by_key(|e| e.sequence);
            events::verify_chain(campaign_id, &events)?;
            let view = CampaignView::replay(&events)?;
            streams.insert(campaign_id, Arc::new(CampaignStream::new(events, view)));
        }
        info!("Audit log loaded: {} campaign streams", streams.len());

        Ok(Self {
            store,
            streams: RwLock::new(streams),
        })
    }

    fn stream(&self, campaign_id: CampaignId) -> Result<Arc<CampaignStream>> {
        self.streams
            .read()
            .map_err(|_| EscrowError::Storage("stream map lock poisoned".to_string()))?
            .get(&campaign_id)
            .cloned()
            .ok_or_else(|| EscrowError::NotFound(format!("campaign {campaign_id}")))
    }

    pub fn campaign_ids(&self) -> Vec<CampaignId> {
        let mut ids: Vec<CampaignId> = self
            .streams
            .read()
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Latest committed view of a campaign.
    pub fn view(&self, campaign_id: CampaignId) -> Result<Arc<CampaignView>> {
        let stream = self.stream(campaign_id)?;
        let view = stream.read()?.view.clone();
        Ok(view)
    }

    /// Events with `sequence > since`, in order.
    pub fn stream_from(&self, campaign_id: CampaignId, since: u64) -> Result<Vec<AuditEvent>> {
        let stream = self.stream(campaign_id)?;
        let state = stream.read()?;
        Ok(state
            .events
            .iter()
            .filter(|e| e.sequence > since)
            .cloned()
            .collect())
    }

    /// Financial facts of a campaign in sequence order.
    pub fn ledger_entries(&self, campaign_id: CampaignId) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .stream_from(campaign_id, 0)?
            .iter()
            .filter_map(AuditEvent::ledger_entry)
            .collect())
    }

    pub fn verify_chain(&self, campaign_id: CampaignId) -> Result<()> {
        let events = self.stream_from(campaign_id, 0)?;
        events::verify_chain(campaign_id, &events)
    }

    /// Open a new stream with its `CampaignCreated` event (sequence 1).
    pub async fn create(
        &self,
        campaign_id: CampaignId,
        actor: &str,
        at: DateTime<Utc>,
        payload: EventPayload,
    ) -> Result<Appended> {
        let event = AuditEvent::seal(campaign_id, 1, actor, at, payload, GENESIS_HASH)?;
        let view = CampaignView::genesis(&event)?;

        if self.stream(campaign_id).is_ok() {
            return Err(EscrowError::Conflict(format!(
                "campaign {campaign_id} already exists"
            )));
        }
        self.store.append(&event).await?;

        let stream = Arc::new(CampaignStream::new(vec![event], view));
        let view = stream.read()?.view.clone();
        let mut streams = self
            .streams
            .write()
            .map_err(|_| EscrowError::Storage("stream map lock poisoned".to_string()))?;
        if streams.contains_key(&campaign_id) {
            return Err(EscrowError::Conflict(format!(
                "campaign {campaign_id} already exists"
            )));
        }
        streams.insert(campaign_id, stream);
        info!("campaign {campaign_id} created");
        Ok(Appended { sequence: 1, view })
    }

    /// Append one event, provided the stream head is still `expected_head`.
    ///
    /// The event is folded into a copy of the view and checked against every
    /// invariant before it is persisted. A violating event is replaced by an
    /// `invariant_violated` event that freezes the campaign.
    pub async fn append(
        &self,
        campaign_id: CampaignId,
        expected_head: u64,
        actor: &str,
        at: DateTime<Utc>,
        payload: EventPayload,
    ) -> Result<Appended> {
        let stream = self.stream(campaign_id)?;
        let _writer = stream.writer.lock().await;

        let current = stream.read()?.view.clone();
        if current.head != expected_head {
            return Err(EscrowError::Conflict(format!(
                "campaign {campaign_id} head is {}, expected {expected_head}",
                current.head
            )));
        }

        let sequence = current.head + 1;
        let kind = payload.kind();
        let event = AuditEvent::seal(campaign_id, sequence, actor, at, payload, &current.last_hash)?;
        let mut next = (*current).clone();
        next.apply(&event)?;

        if let Err(detail) = invariants::check_campaign(&next) {
            error!("campaign {campaign_id}: {kind} would violate an invariant: {detail}");
            let freeze = AuditEvent::seal(
                campaign_id,
                sequence,
                actor,
                at,
                EventPayload::InvariantViolated {
                    detail: detail.clone(),
                },
                &current.last_hash,
            )?;
            let mut frozen = (*current).clone();
            frozen.apply(&freeze)?;
            self.commit(&stream, freeze, frozen).await?;
            return Err(EscrowError::InvariantViolation {
                campaign_id,
                detail,
            });
        }

        let view = self.commit(&stream, event, next).await?;
        debug!("campaign {campaign_id}: appended {kind} at {sequence}");
        Ok(Appended { sequence, view })
    }

    async fn commit(
        &self,
        stream: &CampaignStream,
        event: AuditEvent,
        view: CampaignView,
    ) -> Result<Arc<CampaignView>> {
        self.store.append(&event).await?;
        let view = Arc::new(view);
        let mut state = stream.write()?;
        state.events.push(event);
        state.view = view.clone();
        Ok(view)
    }
}
