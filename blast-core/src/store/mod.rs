//! Persistence seam for the queue and the sequence ledger.
//!
//! Every method that changes state is a single conditional operation, so the
//! claim and progression invariants hold no matter how many worker processes
//! share the store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::ClaimWindow;
use crate::error::StoreResult;
use crate::types::{
    BroadcastMessage, Campaign, CampaignStatus, ContactId, ContactStatus, DedupeKey, Device,
    MessageId, MessageStatus, NewBroadcastMessage, NewSequenceContact, QueueStats, Recipient,
    SequenceContact, SequencePlan,
};

pub mod memory;
pub mod postgres;

pub use memory::{FaultPoint, MemoryStore};
pub use postgres::PgStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(MessageId),
    /// A live row with the same dedupe key already exists (or won the race).
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub worker_id: String,
    pub device_id: String,
    pub window: ClaimWindow,
    pub limit: usize,
    pub now: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // Broadcast queue

    /// True if a non-cancelled row with this key exists.
    async fn message_exists(&self, key: &DedupeKey) -> StoreResult<bool>;

    /// Insert a pending row. Unique-key collisions come back as
    /// [`InsertOutcome::Duplicate`], never as an error.
    async fn insert_message(
        &self,
        message: &NewBroadcastMessage,
        now: DateTime<Utc>,
    ) -> StoreResult<InsertOutcome>;

    async fn get_message(&self, id: MessageId) -> StoreResult<Option<BroadcastMessage>>;

    /// Atomically move up to `limit` eligible pending rows of one device to
    /// `processing` for `worker_id`. Two concurrent calls never share a row.
    async fn claim_messages(&self, request: &ClaimRequest) -> StoreResult<Vec<BroadcastMessage>>;

    /// processing -> sent/failed/skipped, only for the owning worker.
    async fn resolve_message(
        &self,
        id: MessageId,
        worker_id: &str,
        status: MessageStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<BroadcastMessage>>;

    /// processing/failed -> pending, clearing the worker. Operator action.
    async fn requeue_message(
        &self,
        id: MessageId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<BroadcastMessage>>;

    /// pending/processing -> cancelled, releasing the worker.
    async fn cancel_message(
        &self,
        id: MessageId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<BroadcastMessage>>;

    async fn stale_pending_messages(
        &self,
        scheduled_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<BroadcastMessage>>;

    async fn stuck_processing_messages(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<BroadcastMessage>>;

    async fn queue_stats(&self, device_id: Option<&str>) -> StoreResult<QueueStats>;

    /// The live (non-cancelled) message of one sequence step for a recipient.
    async fn step_message(
        &self,
        sequence_step_id: i64,
        recipient_address: &str,
    ) -> StoreResult<Option<BroadcastMessage>>;

    /// Pending plus processing rows of a campaign.
    async fn open_campaign_messages(&self, campaign_id: i64) -> StoreResult<i64>;

    // Sequence ledger

    async fn active_sequences(&self) -> StoreResult<Vec<SequencePlan>>;

    async fn is_enrolled(&self, sequence_id: i64, recipient_address: &str) -> StoreResult<bool>;

    /// Insert pending contact rows, skipping ones that already exist.
    /// Returns how many were inserted.
    async fn insert_contacts(
        &self,
        contacts: &[NewSequenceContact],
        now: DateTime<Utc>,
    ) -> StoreResult<usize>;

    async fn get_contact(&self, id: ContactId) -> StoreResult<Option<SequenceContact>>;

    async fn find_contact(
        &self,
        sequence_id: i64,
        recipient_address: &str,
        sequence_step_id: i64,
    ) -> StoreResult<Option<SequenceContact>>;

    async fn recipient_contacts(
        &self,
        sequence_id: i64,
        recipient_address: &str,
    ) -> StoreResult<Vec<SequenceContact>>;

    /// active -> completed/failed. `None` when the row was not active.
    async fn finish_active_contact(
        &self,
        id: ContactId,
        status: ContactStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SequenceContact>>;

    /// Activate the earliest due pending row (ties on the lowest step) if
    /// the recipient has no active row. `None` when nothing is due or another
    /// caller got there first.
    async fn activate_next_contact(
        &self,
        sequence_id: i64,
        recipient_address: &str,
        due_by: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SequenceContact>>;

    /// `(sequence_id, recipient_address)` pairs with a due pending row and
    /// no active row.
    async fn recipients_awaiting_activation(
        &self,
        due_by: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<(i64, String)>>;

    /// Active contacts whose step message already reached sent, skipped or
    /// failed, i.e. the resolution never made it into the ledger.
    async fn settled_active_contacts(&self, limit: usize) -> StoreResult<Vec<SequenceContact>>;

    /// Pending or active contacts whose step message was never enqueued,
    /// e.g. enrollment failed between writing the ledger and the queue.
    async fn orphaned_contacts(&self, limit: usize) -> StoreResult<Vec<SequenceContact>>;

    // Collaborator tables

    /// Recipients after `after_id` (by id) with an entry trigger and no
    /// contact rows yet in a sequence whose entry point carries that trigger.
    async fn recipients_to_enroll(&self, after_id: i64, limit: usize) -> StoreResult<Vec<Recipient>>;

    async fn campaign_recipients(
        &self,
        account_id: &str,
        niche: &str,
        status: &str,
    ) -> StoreResult<Vec<Recipient>>;

    async fn get_device(&self, id: &str) -> StoreResult<Option<Device>>;

    async fn list_devices(&self) -> StoreResult<Vec<Device>>;

    // Campaigns

    async fn due_campaigns(&self, due_by: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Campaign>>;

    async fn campaigns_with_status(
        &self,
        status: CampaignStatus,
        limit: usize,
    ) -> StoreResult<Vec<Campaign>>;

    /// Triggered campaigns whose fan-out has not been recorded as complete.
    async fn campaigns_awaiting_fan_out(&self, limit: usize) -> StoreResult<Vec<Campaign>>;

    async fn mark_campaign_fanned_out(&self, id: i64, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Compare-and-set on the campaign status.
    async fn transition_campaign(
        &self,
        id: i64,
        from: CampaignStatus,
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;
}
