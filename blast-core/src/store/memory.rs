use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{ClaimRequest, InsertOutcome, Store};
use crate::error::{StoreError, StoreResult};
use crate::types::{
    BroadcastMessage, Campaign, CampaignStatus, ContactId, ContactStatus, DedupeKey, Device,
    MessageId, MessageStatus, NewBroadcastMessage, NewSequenceContact, QueueStats, Recipient,
    Sequence, SequenceContact, SequencePlan, SequenceStep, TriggerId,
};

/// In-memory store for local development and unit tests.
///
/// Semantics:
/// - every operation runs under one table-wide lock, which stands in for the
///   row locks and conditional updates of the Postgres store
/// - unique indexes are checked explicitly on insert and activation
/// - [`MemoryStore::fail_next`] makes selected operations return an error,
///   so tests can interrupt multi-step flows halfway
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    messages: BTreeMap<MessageId, BroadcastMessage>,
    contacts: BTreeMap<ContactId, SequenceContact>,
    sequences: BTreeMap<i64, Sequence>,
    steps: BTreeMap<i64, SequenceStep>,
    campaigns: BTreeMap<i64, Campaign>,
    devices: BTreeMap<String, Device>,
    recipients: BTreeMap<i64, Recipient>,
    faults: HashMap<FaultPoint, usize>,
}

/// Store operations that can be told to fail in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    InsertMessage,
    InsertContacts,
    FindContact,
    ClaimMessages,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn reserve_id(&mut self, id: i64) {
        self.next_id = self.next_id.max(id);
    }

    fn take_fault(&mut self, point: FaultPoint) -> StoreResult<()> {
        match self.faults.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::Pool(format!("injected {:?} failure", point)))
            }
            _ => Ok(()),
        }
    }

    fn has_message_for_contact(&self, contact: &SequenceContact) -> bool {
        self.messages.values().any(|m| {
            m.target.sequence_step_id() == Some(contact.sequence_step_id)
                && m.recipient_address == contact.recipient_address
                && m.device_id == contact.assigned_device_id
        })
    }

    /// True once the recipient has contacts in a sequence whose entry point
    /// carries `trigger`.
    fn enrolled_by_trigger(&self, trigger: &TriggerId, address: &str) -> bool {
        self.steps
            .values()
            .filter(|step| {
                step.is_entry_point
                    && TriggerId::new(&step.trigger).as_ref() == Some(trigger)
            })
            .any(|entry| {
                self.contacts
                    .values()
                    .any(|c| c.sequence_id == entry.sequence_id && c.recipient_address == address)
            })
    }

    fn has_active_contact(&self, sequence_id: i64, recipient_address: &str) -> bool {
        self.contacts.values().any(|c| {
            c.sequence_id == sequence_id
                && c.recipient_address == recipient_address
                && c.status == ContactStatus::Active
        })
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_device(&self, device: Device) {
        let mut state = self.state.lock().await;
        state.devices.insert(device.id.clone(), device);
    }

    pub async fn insert_recipient(&self, mut recipient: Recipient) -> i64 {
        let mut state = self.state.lock().await;
        if recipient.id == 0 {
            recipient.id = state.allocate_id();
        } else {
            state.reserve_id(recipient.id);
        }
        let id = recipient.id;
        state.recipients.insert(id, recipient);
        id
    }

    pub async fn insert_sequence(&self, sequence: Sequence, steps: Vec<SequenceStep>) {
        let mut state = self.state.lock().await;
        state.reserve_id(sequence.id);
        for step in steps {
            state.reserve_id(step.id);
            state.steps.insert(step.id, step);
        }
        state.sequences.insert(sequence.id, sequence);
    }

    pub async fn insert_campaign(&self, campaign: Campaign) {
        let mut state = self.state.lock().await;
        state.reserve_id(campaign.id);
        state.campaigns.insert(campaign.id, campaign);
    }

    /// Snapshot of every message row, ordered by id (primarily for tests).
    pub async fn messages(&self) -> Vec<BroadcastMessage> {
        self.state.lock().await.messages.values().cloned().collect()
    }

    /// Snapshot of every contact row, ordered by id (primarily for tests).
    pub async fn contacts(&self) -> Vec<SequenceContact> {
        self.state.lock().await.contacts.values().cloned().collect()
    }

    pub async fn campaign(&self, id: i64) -> Option<Campaign> {
        self.state.lock().await.campaigns.get(&id).cloned()
    }

    /// The next `times` calls to `point` fail with a pool error.
    pub async fn fail_next(&self, point: FaultPoint, times: usize) {
        self.state.lock().await.faults.insert(point, times);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn message_exists(&self, key: &DedupeKey) -> StoreResult<bool> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .values()
            .any(|m| m.status != MessageStatus::Cancelled && &m.dedupe_key() == key))
    }

    async fn insert_message(
        &self,
        message: &NewBroadcastMessage,
        now: DateTime<Utc>,
    ) -> StoreResult<InsertOutcome> {
        let mut state = self.state.lock().await;
        state.take_fault(FaultPoint::InsertMessage)?;
        let key = message.dedupe_key();
        let duplicate = state
            .messages
            .values()
            .any(|m| m.status != MessageStatus::Cancelled && m.dedupe_key() == key);
        if duplicate {
            return Ok(InsertOutcome::Duplicate);
        }

        let id = state.allocate_id();
        state.messages.insert(
            id,
            BroadcastMessage {
                id,
                account_id: message.account_id.clone(),
                device_id: message.device_id.clone(),
                target: message.target,
                recipient_address: message.recipient_address.clone(),
                recipient_name: message.recipient_name.clone(),
                message_kind: message.message_kind,
                content: message.content.clone(),
                media_url: message.media_url.clone(),
                min_delay_seconds: message.min_delay_seconds,
                max_delay_seconds: message.max_delay_seconds,
                status: MessageStatus::Pending,
                scheduled_at: Some(message.scheduled_at),
                processing_worker_id: None,
                processing_started_at: None,
                sent_at: None,
                error_message: None,
                created_at: now,
            },
        );
        Ok(InsertOutcome::Inserted(id))
    }

    async fn get_message(&self, id: MessageId) -> StoreResult<Option<BroadcastMessage>> {
        Ok(self.state.lock().await.messages.get(&id).cloned())
    }

    async fn claim_messages(&self, request: &ClaimRequest) -> StoreResult<Vec<BroadcastMessage>> {
        let mut state = self.state.lock().await;
        state.take_fault(FaultPoint::ClaimMessages)?;

        let mut eligible: Vec<(DateTime<Utc>, MessageId)> = state
            .messages
            .values()
            .filter(|m| {
                m.device_id == request.device_id
                    && m.status == MessageStatus::Pending
                    && m.processing_worker_id.is_none()
            })
            .filter_map(|m| {
                m.scheduled_at
                    .filter(|at| request.window.contains(*at))
                    .map(|at| (at, m.id))
            })
            .collect();
        eligible.sort();
        eligible.truncate(request.limit);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, id) in eligible {
            if let Some(message) = state.messages.get_mut(&id) {
                message.status = MessageStatus::Processing;
                message.processing_worker_id = Some(request.worker_id.clone());
                message.processing_started_at = Some(request.now);
                claimed.push(message.clone());
            }
        }
        Ok(claimed)
    }

    async fn resolve_message(
        &self,
        id: MessageId,
        worker_id: &str,
        status: MessageStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<BroadcastMessage>> {
        if !status.is_delivery_outcome() {
            return Err(StoreError::InvalidInput(format!(
                "cannot resolve a message to {}",
                status
            )));
        }

        let mut state = self.state.lock().await;
        let Some(message) = state.messages.get_mut(&id) else {
            return Ok(None);
        };
        if message.status != MessageStatus::Processing
            || message.processing_worker_id.as_deref() != Some(worker_id)
        {
            return Ok(None);
        }

        message.status = status;
        if status == MessageStatus::Sent {
            message.sent_at = Some(now);
        }
        message.error_message = error_message;
        Ok(Some(message.clone()))
    }

    async fn requeue_message(
        &self,
        id: MessageId,
        _now: DateTime<Utc>,
    ) -> StoreResult<Option<BroadcastMessage>> {
        let mut state = self.state.lock().await;
        let Some(message) = state.messages.get_mut(&id) else {
            return Ok(None);
        };
        if !matches!(message.status, MessageStatus::Processing | MessageStatus::Failed) {
            return Ok(None);
        }

        message.status = MessageStatus::Pending;
        message.processing_worker_id = None;
        message.processing_started_at = None;
        message.sent_at = None;
        message.error_message = None;
        Ok(Some(message.clone()))
    }

    async fn cancel_message(
        &self,
        id: MessageId,
        _now: DateTime<Utc>,
    ) -> StoreResult<Option<BroadcastMessage>> {
        let mut state = self.state.lock().await;
        let Some(message) = state.messages.get_mut(&id) else {
            return Ok(None);
        };
        if !matches!(message.status, MessageStatus::Pending | MessageStatus::Processing) {
            return Ok(None);
        }

        message.status = MessageStatus::Cancelled;
        message.processing_worker_id = None;
        message.processing_started_at = None;
        Ok(Some(message.clone()))
    }

    async fn stale_pending_messages(
        &self,
        scheduled_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<BroadcastMessage>> {
        let state = self.state.lock().await;
        let mut stale: Vec<BroadcastMessage> = state
            .messages
            .values()
            .filter(|m| {
                m.status == MessageStatus::Pending
                    && m.scheduled_at.is_some_and(|at| at < scheduled_before)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|m| (m.scheduled_at, m.id));
        stale.truncate(limit);
        Ok(stale)
    }

    async fn stuck_processing_messages(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<BroadcastMessage>> {
        let state = self.state.lock().await;
        let mut stuck: Vec<BroadcastMessage> = state
            .messages
            .values()
            .filter(|m| {
                m.status == MessageStatus::Processing
                    && m.processing_started_at.is_some_and(|at| at < started_before)
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|m| (m.processing_started_at, m.id));
        stuck.truncate(limit);
        Ok(stuck)
    }

    async fn queue_stats(&self, device_id: Option<&str>) -> StoreResult<QueueStats> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for message in state.messages.values() {
            if device_id.is_some_and(|d| d != message.device_id) {
                continue;
            }
            stats.record(message.status, 1);
        }
        Ok(stats)
    }

    async fn step_message(
        &self,
        sequence_step_id: i64,
        recipient_address: &str,
    ) -> StoreResult<Option<BroadcastMessage>> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .values()
            .find(|m| {
                m.status != MessageStatus::Cancelled
                    && m.target.sequence_step_id() == Some(sequence_step_id)
                    && m.recipient_address == recipient_address
            })
            .cloned())
    }

    async fn open_campaign_messages(&self, campaign_id: i64) -> StoreResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .values()
            .filter(|m| {
                m.target.campaign_id() == Some(campaign_id)
                    && matches!(m.status, MessageStatus::Pending | MessageStatus::Processing)
            })
            .count() as i64)
    }

    async fn active_sequences(&self) -> StoreResult<Vec<SequencePlan>> {
        let state = self.state.lock().await;
        Ok(state
            .sequences
            .values()
            .filter(|s| s.is_active)
            .map(|sequence| {
                let mut steps: Vec<SequenceStep> = state
                    .steps
                    .values()
                    .filter(|step| step.sequence_id == sequence.id)
                    .cloned()
                    .collect();
                steps.sort_by_key(|step| (step.day_number, step.id));
                SequencePlan {
                    sequence: sequence.clone(),
                    steps,
                }
            })
            .collect())
    }

    async fn is_enrolled(&self, sequence_id: i64, recipient_address: &str) -> StoreResult<bool> {
        let state = self.state.lock().await;
        Ok(state
            .contacts
            .values()
            .any(|c| c.sequence_id == sequence_id && c.recipient_address == recipient_address))
    }

    async fn insert_contacts(
        &self,
        contacts: &[NewSequenceContact],
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let mut state = self.state.lock().await;
        state.take_fault(FaultPoint::InsertContacts)?;
        let mut inserted = 0;
        for contact in contacts {
            let exists = state.contacts.values().any(|c| {
                c.sequence_id == contact.sequence_id
                    && c.recipient_address == contact.recipient_address
                    && c.sequence_step_id == contact.sequence_step_id
            });
            if exists {
                continue;
            }
            let id = state.allocate_id();
            state.contacts.insert(
                id,
                SequenceContact {
                    id,
                    sequence_id: contact.sequence_id,
                    recipient_address: contact.recipient_address.clone(),
                    recipient_name: contact.recipient_name.clone(),
                    current_step: contact.current_step,
                    current_trigger: contact.current_trigger.clone(),
                    status: ContactStatus::Pending,
                    next_trigger_time: contact.next_trigger_time,
                    assigned_device_id: contact.assigned_device_id.clone(),
                    sequence_step_id: contact.sequence_step_id,
                    activated_at: None,
                    completed_at: None,
                    created_at: now,
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn get_contact(&self, id: ContactId) -> StoreResult<Option<SequenceContact>> {
        Ok(self.state.lock().await.contacts.get(&id).cloned())
    }

    async fn find_contact(
        &self,
        sequence_id: i64,
        recipient_address: &str,
        sequence_step_id: i64,
    ) -> StoreResult<Option<SequenceContact>> {
        let mut state = self.state.lock().await;
        state.take_fault(FaultPoint::FindContact)?;
        Ok(state
            .contacts
            .values()
            .find(|c| {
                c.sequence_id == sequence_id
                    && c.recipient_address == recipient_address
                    && c.sequence_step_id == sequence_step_id
            })
            .cloned())
    }

    async fn recipient_contacts(
        &self,
        sequence_id: i64,
        recipient_address: &str,
    ) -> StoreResult<Vec<SequenceContact>> {
        let state = self.state.lock().await;
        let mut contacts: Vec<SequenceContact> = state
            .contacts
            .values()
            .filter(|c| c.sequence_id == sequence_id && c.recipient_address == recipient_address)
            .cloned()
            .collect();
        contacts.sort_by_key(|c| (c.current_step, c.id));
        Ok(contacts)
    }

    async fn finish_active_contact(
        &self,
        id: ContactId,
        status: ContactStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SequenceContact>> {
        if !matches!(status, ContactStatus::Completed | ContactStatus::Failed) {
            return Err(StoreError::InvalidInput(format!(
                "cannot finish a contact as {}",
                status
            )));
        }

        let mut state = self.state.lock().await;
        let Some(contact) = state.contacts.get_mut(&id) else {
            return Ok(None);
        };
        if contact.status != ContactStatus::Active {
            return Ok(None);
        }
        contact.status = status;
        contact.completed_at = Some(now);
        Ok(Some(contact.clone()))
    }

    async fn activate_next_contact(
        &self,
        sequence_id: i64,
        recipient_address: &str,
        due_by: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SequenceContact>> {
        let mut state = self.state.lock().await;
        if state.has_active_contact(sequence_id, recipient_address) {
            return Ok(None);
        }

        let next = state
            .contacts
            .values()
            .filter(|c| {
                c.sequence_id == sequence_id
                    && c.recipient_address == recipient_address
                    && c.status == ContactStatus::Pending
                    && c.next_trigger_time <= due_by
            })
            .min_by_key(|c| (c.next_trigger_time, c.current_step, c.id))
            .map(|c| c.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(contact) = state.contacts.get_mut(&id) else {
            return Ok(None);
        };
        contact.status = ContactStatus::Active;
        contact.activated_at = Some(now);
        Ok(Some(contact.clone()))
    }

    async fn recipients_awaiting_activation(
        &self,
        due_by: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<(i64, String)>> {
        let state = self.state.lock().await;
        let mut pairs = BTreeSet::new();
        for contact in state.contacts.values() {
            if contact.status == ContactStatus::Pending
                && contact.next_trigger_time <= due_by
                && !state.has_active_contact(contact.sequence_id, &contact.recipient_address)
            {
                pairs.insert((contact.sequence_id, contact.recipient_address.clone()));
            }
        }
        Ok(pairs.into_iter().take(limit).collect())
    }

    async fn settled_active_contacts(&self, limit: usize) -> StoreResult<Vec<SequenceContact>> {
        let state = self.state.lock().await;
        Ok(state
            .contacts
            .values()
            .filter(|c| c.status == ContactStatus::Active)
            .filter(|c| {
                state.messages.values().any(|m| {
                    m.target.sequence_step_id() == Some(c.sequence_step_id)
                        && m.recipient_address == c.recipient_address
                        && matches!(
                            m.status,
                            MessageStatus::Sent | MessageStatus::Skipped | MessageStatus::Failed
                        )
                })
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn orphaned_contacts(&self, limit: usize) -> StoreResult<Vec<SequenceContact>> {
        let state = self.state.lock().await;
        Ok(state
            .contacts
            .values()
            .filter(|c| matches!(c.status, ContactStatus::Pending | ContactStatus::Active))
            .filter(|c| !state.has_message_for_contact(c))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn recipients_to_enroll(&self, after_id: i64, limit: usize) -> StoreResult<Vec<Recipient>> {
        let state = self.state.lock().await;
        Ok(state
            .recipients
            .range(after_id + 1..)
            .map(|(_, r)| r)
            .filter(|r| match r.entry_trigger.trigger_id() {
                Some(trigger) => !state.enrolled_by_trigger(trigger, &r.address),
                None => false,
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn campaign_recipients(
        &self,
        account_id: &str,
        niche: &str,
        status: &str,
    ) -> StoreResult<Vec<Recipient>> {
        let state = self.state.lock().await;
        Ok(state
            .recipients
            .values()
            .filter(|r| r.account_id == account_id && r.niche == niche && r.status == status)
            .cloned()
            .collect())
    }

    async fn get_device(&self, id: &str) -> StoreResult<Option<Device>> {
        Ok(self.state.lock().await.devices.get(id).cloned())
    }

    async fn list_devices(&self) -> StoreResult<Vec<Device>> {
        Ok(self.state.lock().await.devices.values().cloned().collect())
    }

    async fn due_campaigns(&self, due_by: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Campaign>> {
        let state = self.state.lock().await;
        let mut due: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|c| c.status == CampaignStatus::Pending && c.scheduled_at <= due_by)
            .cloned()
            .collect();
        due.sort_by_key(|c| (c.scheduled_at, c.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn campaigns_with_status(
        &self,
        status: CampaignStatus,
        limit: usize,
    ) -> StoreResult<Vec<Campaign>> {
        let state = self.state.lock().await;
        Ok(state
            .campaigns
            .values()
            .filter(|c| c.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn campaigns_awaiting_fan_out(&self, limit: usize) -> StoreResult<Vec<Campaign>> {
        let state = self.state.lock().await;
        Ok(state
            .campaigns
            .values()
            .filter(|c| c.status == CampaignStatus::Triggered && c.fanned_out_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_campaign_fanned_out(&self, id: i64, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.campaigns.get_mut(&id) {
            Some(campaign) if campaign.fanned_out_at.is_none() => {
                campaign.fanned_out_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition_campaign(
        &self,
        id: i64,
        from: CampaignStatus,
        to: CampaignStatus,
        _now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.campaigns.get_mut(&id) {
            Some(campaign) if campaign.status == from => {
                campaign.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
