use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{BigInt, Text, Timestamptz};
use diesel_async::RunQueryDsl;

use super::{ClaimRequest, InsertOutcome, Store};
use crate::db::{DbConnection, DbPool};
use crate::error::{StoreError, StoreResult};
use crate::schema::{
    broadcast_messages, campaigns, devices, recipients, sequence_contacts, sequence_steps,
    sequences,
};
use crate::types::{
    ApiPlatform, BroadcastMessage, Campaign, CampaignStatus, ContactId, ContactStatus, DedupeKey,
    DedupeTarget, Device, DeviceKind, EntryTrigger, MessageId, MessageStatus,
    MessageTarget, NewBroadcastMessage, NewSequenceContact, QueueStats, Recipient, Sequence,
    SequenceContact, SequencePlan, SequenceStep,
};

/// Claims rows with `FOR UPDATE SKIP LOCKED` so concurrent workers never
/// block on each other and never see the same row.
const CLAIM_SQL: &str = r#"
UPDATE broadcast_messages
SET status = 'processing',
    processing_worker_id = $1,
    processing_started_at = $2,
    updated_at = $2
WHERE id IN (
    SELECT id FROM broadcast_messages
    WHERE device_id = $3
      AND status = 'pending'
      AND processing_worker_id IS NULL
      AND scheduled_at IS NOT NULL
      AND scheduled_at >= $4
      AND scheduled_at <= $5
    ORDER BY scheduled_at, id
    LIMIT $6
    FOR UPDATE SKIP LOCKED
)
RETURNING *
"#;

const ACTIVATE_NEXT_SQL: &str = r#"
UPDATE sequence_contacts
SET status = 'active', activated_at = $4
WHERE id = (
    SELECT id FROM sequence_contacts
    WHERE sequence_id = $1
      AND recipient_address = $2
      AND status = 'pending'
      AND next_trigger_time <= $3
      AND NOT EXISTS (
          SELECT 1 FROM sequence_contacts active
          WHERE active.sequence_id = $1
            AND active.recipient_address = $2
            AND active.status = 'active'
      )
    ORDER BY next_trigger_time, current_step, id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
RETURNING *
"#;

const AWAITING_ACTIVATION_SQL: &str = r#"
SELECT DISTINCT pending.sequence_id, pending.recipient_address
FROM sequence_contacts pending
WHERE pending.status = 'pending'
  AND pending.next_trigger_time <= $1
  AND NOT EXISTS (
      SELECT 1 FROM sequence_contacts active
      WHERE active.sequence_id = pending.sequence_id
        AND active.recipient_address = pending.recipient_address
        AND active.status = 'active'
  )
ORDER BY pending.sequence_id, pending.recipient_address
LIMIT $2
"#;

/// Active contacts whose step message is already terminal.
const SETTLED_ACTIVE_SQL: &str = r#"
SELECT c.id, c.sequence_id, c.recipient_address, c.recipient_name, c.current_step,
       c.current_trigger, c.status, c.next_trigger_time, c.assigned_device_id,
       c.sequence_step_id, c.activated_at, c.completed_at, c.created_at
FROM sequence_contacts c
WHERE c.status = 'active'
  AND EXISTS (
      SELECT 1 FROM broadcast_messages m
      WHERE m.sequence_step_id = c.sequence_step_id
        AND m.recipient_address = c.recipient_address
        AND m.status IN ('sent', 'skipped', 'failed')
  )
ORDER BY c.id
LIMIT $1
"#;

/// Live contacts with no queue row of any status for their step and device.
const ORPHANED_CONTACTS_SQL: &str = r#"
SELECT c.id, c.sequence_id, c.recipient_address, c.recipient_name, c.current_step,
       c.current_trigger, c.status, c.next_trigger_time, c.assigned_device_id,
       c.sequence_step_id, c.activated_at, c.completed_at, c.created_at
FROM sequence_contacts c
WHERE c.status IN ('pending', 'active')
  AND NOT EXISTS (
      SELECT 1 FROM broadcast_messages m
      WHERE m.sequence_step_id = c.sequence_step_id
        AND m.recipient_address = c.recipient_address
        AND m.device_id = c.assigned_device_id
  )
ORDER BY c.id
LIMIT $1
"#;

/// Recipients with an entry trigger that are not yet enrolled in any
/// sequence whose entry point carries the same trigger.
const RECIPIENTS_TO_ENROLL_SQL: &str = r#"
SELECT r.id, r.account_id, r.device_id, r.address, r.name, r.niche, r.status, r.entry_trigger
FROM recipients r
WHERE r.id > $1
  AND r.entry_trigger IS NOT NULL
  AND btrim(r.entry_trigger) <> ''
  AND NOT EXISTS (
      SELECT 1
      FROM sequence_steps entry
      JOIN sequence_contacts c ON c.sequence_id = entry.sequence_id
      WHERE entry.is_entry_point
        AND btrim(entry.trigger) = btrim(r.entry_trigger)
        AND c.recipient_address = r.address
  )
ORDER BY r.id
LIMIT $2
"#;

#[derive(Debug, Queryable, QueryableByName, Selectable)]
#[diesel(table_name = broadcast_messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct MessageRow {
    id: i64,
    account_id: String,
    device_id: String,
    campaign_id: Option<i64>,
    sequence_id: Option<i64>,
    sequence_step_id: Option<i64>,
    recipient_address: String,
    recipient_name: String,
    message_kind: String,
    content: String,
    media_url: Option<String>,
    min_delay_seconds: i32,
    max_delay_seconds: i32,
    status: String,
    scheduled_at: Option<DateTime<Utc>>,
    processing_worker_id: Option<String>,
    processing_started_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for BroadcastMessage {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(BroadcastMessage {
            target: MessageTarget::from_columns(
                row.id,
                row.campaign_id,
                row.sequence_id,
                row.sequence_step_id,
            )?,
            message_kind: row.message_kind.parse()?,
            status: row.status.parse()?,
            id: row.id,
            account_id: row.account_id,
            device_id: row.device_id,
            recipient_address: row.recipient_address,
            recipient_name: row.recipient_name,
            content: row.content,
            media_url: row.media_url,
            min_delay_seconds: row.min_delay_seconds,
            max_delay_seconds: row.max_delay_seconds,
            scheduled_at: row.scheduled_at,
            processing_worker_id: row.processing_worker_id,
            processing_started_at: row.processing_started_at,
            sent_at: row.sent_at,
            error_message: row.error_message,
            created_at: row.created_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = broadcast_messages)]
struct NewMessageRow<'a> {
    account_id: &'a str,
    device_id: &'a str,
    campaign_id: Option<i64>,
    sequence_id: Option<i64>,
    sequence_step_id: Option<i64>,
    recipient_address: &'a str,
    recipient_name: &'a str,
    message_kind: &'static str,
    content: &'a str,
    media_url: Option<&'a str>,
    min_delay_seconds: i32,
    max_delay_seconds: i32,
    status: &'static str,
    scheduled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Queryable, QueryableByName, Selectable)]
#[diesel(table_name = sequence_contacts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ContactRow {
    id: i64,
    sequence_id: i64,
    recipient_address: String,
    recipient_name: String,
    current_step: i32,
    current_trigger: String,
    status: String,
    next_trigger_time: DateTime<Utc>,
    assigned_device_id: String,
    sequence_step_id: i64,
    activated_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ContactRow> for SequenceContact {
    type Error = StoreError;

    fn try_from(row: ContactRow) -> Result<Self, Self::Error> {
        Ok(SequenceContact {
            status: row.status.parse()?,
            id: row.id,
            sequence_id: row.sequence_id,
            recipient_address: row.recipient_address,
            recipient_name: row.recipient_name,
            current_step: row.current_step,
            current_trigger: row.current_trigger,
            next_trigger_time: row.next_trigger_time,
            assigned_device_id: row.assigned_device_id,
            sequence_step_id: row.sequence_step_id,
            activated_at: row.activated_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = sequence_contacts)]
struct NewContactRow<'a> {
    sequence_id: i64,
    recipient_address: &'a str,
    recipient_name: &'a str,
    current_step: i32,
    current_trigger: &'a str,
    status: &'static str,
    next_trigger_time: DateTime<Utc>,
    assigned_device_id: &'a str,
    sequence_step_id: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = sequences)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct SequenceRow {
    id: i64,
    account_id: String,
    device_id: String,
    name: String,
    is_active: bool,
    min_delay_seconds: i32,
    max_delay_seconds: i32,
}

impl From<SequenceRow> for Sequence {
    fn from(row: SequenceRow) -> Self {
        Sequence {
            id: row.id,
            account_id: row.account_id,
            device_id: row.device_id,
            name: row.name,
            is_active: row.is_active,
            min_delay_seconds: row.min_delay_seconds,
            max_delay_seconds: row.max_delay_seconds,
        }
    }
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = sequence_steps)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct StepRow {
    id: i64,
    sequence_id: i64,
    day_number: i32,
    trigger: String,
    next_trigger: Option<String>,
    trigger_delay_hours: i32,
    min_delay_seconds: Option<i32>,
    max_delay_seconds: Option<i32>,
    message_kind: String,
    content: String,
    media_url: Option<String>,
    is_entry_point: bool,
}

impl TryFrom<StepRow> for SequenceStep {
    type Error = StoreError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        Ok(SequenceStep {
            message_kind: row.message_kind.parse()?,
            id: row.id,
            sequence_id: row.sequence_id,
            day_number: row.day_number,
            trigger: row.trigger,
            next_trigger: row.next_trigger,
            trigger_delay_hours: row.trigger_delay_hours,
            min_delay_seconds: row.min_delay_seconds,
            max_delay_seconds: row.max_delay_seconds,
            content: row.content,
            media_url: row.media_url,
            is_entry_point: row.is_entry_point,
        })
    }
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = campaigns)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct CampaignRow {
    id: i64,
    account_id: String,
    title: String,
    message_kind: String,
    content: String,
    media_url: Option<String>,
    niche: String,
    target_status: Option<String>,
    scheduled_at: DateTime<Utc>,
    min_delay_seconds: i32,
    max_delay_seconds: i32,
    status: String,
    fanned_out_at: Option<DateTime<Utc>>,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = StoreError;

    fn try_from(row: CampaignRow) -> Result<Self, Self::Error> {
        Ok(Campaign {
            message_kind: row.message_kind.parse()?,
            status: row.status.parse()?,
            id: row.id,
            account_id: row.account_id,
            title: row.title,
            content: row.content,
            media_url: row.media_url,
            niche: row.niche,
            target_status: row.target_status,
            scheduled_at: row.scheduled_at,
            min_delay_seconds: row.min_delay_seconds,
            max_delay_seconds: row.max_delay_seconds,
            fanned_out_at: row.fanned_out_at,
        })
    }
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = devices)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct DeviceRow {
    id: String,
    account_id: String,
    name: String,
    kind: String,
    platform: Option<String>,
    api_token: Option<String>,
}

impl TryFrom<DeviceRow> for Device {
    type Error = StoreError;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        let kind = match (row.kind.as_str(), row.platform.as_deref()) {
            ("interactive", _) => DeviceKind::Interactive,
            ("api", Some(platform)) => DeviceKind::Api(platform.parse::<ApiPlatform>()?),
            ("api", None) => {
                return Err(StoreError::CorruptRow {
                    table: "devices",
                    id: 0,
                    reason: format!("api device {} has no platform", row.id),
                })
            }
            (other, _) => return Err(StoreError::unknown_variant("device kind", other)),
        };
        Ok(Device {
            id: row.id,
            account_id: row.account_id,
            name: row.name,
            kind,
            api_token: row.api_token,
        })
    }
}

#[derive(Debug, Queryable, QueryableByName, Selectable)]
#[diesel(table_name = recipients)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct RecipientRow {
    id: i64,
    account_id: String,
    device_id: Option<String>,
    address: String,
    name: String,
    niche: String,
    status: String,
    entry_trigger: Option<String>,
}

impl From<RecipientRow> for Recipient {
    fn from(row: RecipientRow) -> Self {
        Recipient {
            entry_trigger: EntryTrigger::from_column(row.entry_trigger.as_deref()),
            id: row.id,
            account_id: row.account_id,
            device_id: row.device_id,
            address: row.address,
            name: row.name,
            niche: row.niche,
            status: row.status,
        }
    }
}

#[derive(QueryableByName)]
struct AwaitingRow {
    #[diesel(sql_type = BigInt)]
    sequence_id: i64,
    #[diesel(sql_type = Text)]
    recipient_address: String,
}

fn is_unique_violation(err: &DieselError) -> bool {
    matches!(err, DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _))
}

fn convert_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Postgres-backed store over the diesel-async deadpool.
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<DbPool>,
}

impl PgStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> StoreResult<DbConnection> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn message_exists(&self, key: &DedupeKey) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let mut query = broadcast_messages::table
            .filter(broadcast_messages::recipient_address.eq(&key.recipient_address))
            .filter(broadcast_messages::device_id.eq(&key.device_id))
            .filter(broadcast_messages::status.ne(MessageStatus::Cancelled.as_str()))
            .select(broadcast_messages::id)
            .into_boxed();
        query = match key.target {
            DedupeTarget::Campaign(id) => query.filter(broadcast_messages::campaign_id.eq(id)),
            DedupeTarget::Step(id) => query.filter(broadcast_messages::sequence_step_id.eq(id)),
        };

        let found: Option<i64> = query.first(&mut conn).await.optional()?;
        Ok(found.is_some())
    }

    async fn insert_message(
        &self,
        message: &NewBroadcastMessage,
        now: DateTime<Utc>,
    ) -> StoreResult<InsertOutcome> {
        let mut conn = self.conn().await?;
        let row = NewMessageRow {
            account_id: &message.account_id,
            device_id: &message.device_id,
            campaign_id: message.target.campaign_id(),
            sequence_id: message.target.sequence_id(),
            sequence_step_id: message.target.sequence_step_id(),
            recipient_address: &message.recipient_address,
            recipient_name: &message.recipient_name,
            message_kind: message.message_kind.as_str(),
            content: &message.content,
            media_url: message.media_url.as_deref(),
            min_delay_seconds: message.min_delay_seconds,
            max_delay_seconds: message.max_delay_seconds,
            status: MessageStatus::Pending.as_str(),
            scheduled_at: Some(message.scheduled_at),
            created_at: now,
            updated_at: now,
        };

        let inserted: Result<i64, DieselError> = diesel::insert_into(broadcast_messages::table)
            .values(&row)
            .returning(broadcast_messages::id)
            .get_result(&mut conn)
            .await;

        match inserted {
            Ok(id) => Ok(InsertOutcome::Inserted(id)),
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_message(&self, id: MessageId) -> StoreResult<Option<BroadcastMessage>> {
        let mut conn = self.conn().await?;
        let row: Option<MessageRow> = broadcast_messages::table
            .find(id)
            .select(MessageRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(BroadcastMessage::try_from).transpose()
    }

    async fn claim_messages(&self, request: &ClaimRequest) -> StoreResult<Vec<BroadcastMessage>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let rows: Vec<MessageRow> = diesel::sql_query(CLAIM_SQL)
            .bind::<Text, _>(&request.worker_id)
            .bind::<Timestamptz, _>(request.now)
            .bind::<Text, _>(&request.device_id)
            .bind::<Timestamptz, _>(request.window.earliest)
            .bind::<Timestamptz, _>(request.window.latest)
            .bind::<BigInt, _>(to_limit(request.limit))
            .load(&mut conn)
            .await?;

        // RETURNING does not preserve the subquery order.
        let mut claimed: Vec<BroadcastMessage> = convert_all(rows)?;
        claimed.sort_by_key(|m| (m.scheduled_at, m.id));
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

        let mut conn = self.conn().await?;
        let sent_at = (status == MessageStatus::Sent).then_some(now);
        let row: Option<MessageRow> = diesel::update(
            broadcast_messages::table
                .filter(broadcast_messages::id.eq(id))
                .filter(broadcast_messages::status.eq(MessageStatus::Processing.as_str()))
                .filter(broadcast_messages::processing_worker_id.eq(worker_id)),
        )
        .set((
            broadcast_messages::status.eq(status.as_str()),
            broadcast_messages::sent_at.eq(sent_at),
            broadcast_messages::error_message.eq(error_message),
            broadcast_messages::updated_at.eq(now),
        ))
        .returning(MessageRow::as_returning())
        .get_result(&mut conn)
        .await
        .optional()?;
        row.map(BroadcastMessage::try_from).transpose()
    }

    async fn requeue_message(
        &self,
        id: MessageId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<BroadcastMessage>> {
        let mut conn = self.conn().await?;
        let row: Option<MessageRow> = diesel::update(
            broadcast_messages::table
                .filter(broadcast_messages::id.eq(id))
                .filter(broadcast_messages::status.eq_any([
                    MessageStatus::Processing.as_str(),
                    MessageStatus::Failed.as_str(),
                ])),
        )
        .set((
            broadcast_messages::status.eq(MessageStatus::Pending.as_str()),
            broadcast_messages::processing_worker_id.eq(None::<String>),
            broadcast_messages::processing_started_at.eq(None::<DateTime<Utc>>),
            broadcast_messages::sent_at.eq(None::<DateTime<Utc>>),
            broadcast_messages::error_message.eq(None::<String>),
            broadcast_messages::updated_at.eq(now),
        ))
        .returning(MessageRow::as_returning())
        .get_result(&mut conn)
        .await
        .optional()?;
        row.map(BroadcastMessage::try_from).transpose()
    }

    async fn cancel_message(
        &self,
        id: MessageId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<BroadcastMessage>> {
        let mut conn = self.conn().await?;
        let row: Option<MessageRow> = diesel::update(
            broadcast_messages::table
                .filter(broadcast_messages::id.eq(id))
                .filter(broadcast_messages::status.eq_any([
                    MessageStatus::Pending.as_str(),
                    MessageStatus::Processing.as_str(),
                ])),
        )
        .set((
            broadcast_messages::status.eq(MessageStatus::Cancelled.as_str()),
            broadcast_messages::processing_worker_id.eq(None::<String>),
            broadcast_messages::processing_started_at.eq(None::<DateTime<Utc>>),
            broadcast_messages::updated_at.eq(now),
        ))
        .returning(MessageRow::as_returning())
        .get_result(&mut conn)
        .await
        .optional()?;
        row.map(BroadcastMessage::try_from).transpose()
    }

    async fn stale_pending_messages(
        &self,
        scheduled_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<BroadcastMessage>> {
        let mut conn = self.conn().await?;
        let rows: Vec<MessageRow> = broadcast_messages::table
            .filter(broadcast_messages::status.eq(MessageStatus::Pending.as_str()))
            .filter(broadcast_messages::scheduled_at.lt(scheduled_before))
            .order((broadcast_messages::scheduled_at.asc(), broadcast_messages::id.asc()))
            .limit(to_limit(limit))
            .select(MessageRow::as_select())
            .load(&mut conn)
            .await?;
        convert_all(rows)
    }

    async fn stuck_processing_messages(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<BroadcastMessage>> {
        let mut conn = self.conn().await?;
        let rows: Vec<MessageRow> = broadcast_messages::table
            .filter(broadcast_messages::status.eq(MessageStatus::Processing.as_str()))
            .filter(broadcast_messages::processing_started_at.lt(started_before))
            .order((
                broadcast_messages::processing_started_at.asc(),
                broadcast_messages::id.asc(),
            ))
            .limit(to_limit(limit))
            .select(MessageRow::as_select())
            .load(&mut conn)
            .await?;
        convert_all(rows)
    }

    async fn queue_stats(&self, device_id: Option<&str>) -> StoreResult<QueueStats> {
        let mut conn = self.conn().await?;
        let counts: Vec<(String, i64)> = match device_id {
            Some(device_id) => {
                broadcast_messages::table
                    .filter(broadcast_messages::device_id.eq(device_id))
                    .group_by(broadcast_messages::status)
                    .select((broadcast_messages::status, diesel::dsl::count_star()))
                    .load(&mut conn)
                    .await?
            }
            None => {
                broadcast_messages::table
                    .group_by(broadcast_messages::status)
                    .select((broadcast_messages::status, diesel::dsl::count_star()))
                    .load(&mut conn)
                    .await?
            }
        };

        let mut stats = QueueStats::default();
        for (status, count) in counts {
            stats.record(status.parse()?, count);
        }
        Ok(stats)
    }

    async fn step_message(
        &self,
        sequence_step_id: i64,
        recipient_address: &str,
    ) -> StoreResult<Option<BroadcastMessage>> {
        let mut conn = self.conn().await?;
        let row: Option<MessageRow> = broadcast_messages::table
            .filter(broadcast_messages::sequence_step_id.eq(sequence_step_id))
            .filter(broadcast_messages::recipient_address.eq(recipient_address))
            .filter(broadcast_messages::status.ne(MessageStatus::Cancelled.as_str()))
            .select(MessageRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(BroadcastMessage::try_from).transpose()
    }

    async fn open_campaign_messages(&self, campaign_id: i64) -> StoreResult<i64> {
        let mut conn = self.conn().await?;
        let open: i64 = broadcast_messages::table
            .filter(broadcast_messages::campaign_id.eq(campaign_id))
            .filter(broadcast_messages::status.eq_any([
                MessageStatus::Pending.as_str(),
                MessageStatus::Processing.as_str(),
            ]))
            .count()
            .get_result(&mut conn)
            .await?;
        Ok(open)
    }

    async fn active_sequences(&self) -> StoreResult<Vec<SequencePlan>> {
        let mut conn = self.conn().await?;
        let sequence_rows: Vec<SequenceRow> = sequences::table
            .filter(sequences::is_active.eq(true))
            .order(sequences::id.asc())
            .select(SequenceRow::as_select())
            .load(&mut conn)
            .await?;
        if sequence_rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = sequence_rows.iter().map(|s| s.id).collect();
        let step_rows: Vec<StepRow> = sequence_steps::table
            .filter(sequence_steps::sequence_id.eq_any(&ids))
            .order((
                sequence_steps::sequence_id.asc(),
                sequence_steps::day_number.asc(),
                sequence_steps::id.asc(),
            ))
            .select(StepRow::as_select())
            .load(&mut conn)
            .await?;

        let mut steps_by_sequence: BTreeMap<i64, Vec<SequenceStep>> = BTreeMap::new();
        for row in step_rows {
            let step = SequenceStep::try_from(row)?;
            steps_by_sequence.entry(step.sequence_id).or_default().push(step);
        }

        Ok(sequence_rows
            .into_iter()
            .map(|row| {
                let steps = steps_by_sequence.remove(&row.id).unwrap_or_default();
                SequencePlan {
                    sequence: row.into(),
                    steps,
                }
            })
            .collect())
    }

    async fn is_enrolled(&self, sequence_id: i64, recipient_address: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let found: Option<i64> = sequence_contacts::table
            .filter(sequence_contacts::sequence_id.eq(sequence_id))
            .filter(sequence_contacts::recipient_address.eq(recipient_address))
            .select(sequence_contacts::id)
            .first(&mut conn)
            .await
            .optional()?;
        Ok(found.is_some())
    }

    async fn insert_contacts(
        &self,
        contacts: &[NewSequenceContact],
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        if contacts.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn().await?;
        let rows: Vec<NewContactRow<'_>> = contacts
            .iter()
            .map(|c| NewContactRow {
                sequence_id: c.sequence_id,
                recipient_address: &c.recipient_address,
                recipient_name: &c.recipient_name,
                current_step: c.current_step,
                current_trigger: &c.current_trigger,
                status: ContactStatus::Pending.as_str(),
                next_trigger_time: c.next_trigger_time,
                assigned_device_id: &c.assigned_device_id,
                sequence_step_id: c.sequence_step_id,
                created_at: now,
            })
            .collect();

        let inserted = diesel::insert_into(sequence_contacts::table)
            .values(&rows)
            .on_conflict((
                sequence_contacts::sequence_id,
                sequence_contacts::recipient_address,
                sequence_contacts::sequence_step_id,
            ))
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(inserted)
    }

    async fn get_contact(&self, id: ContactId) -> StoreResult<Option<SequenceContact>> {
        let mut conn = self.conn().await?;
        let row: Option<ContactRow> = sequence_contacts::table
            .find(id)
            .select(ContactRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(SequenceContact::try_from).transpose()
    }

    async fn find_contact(
        &self,
        sequence_id: i64,
        recipient_address: &str,
        sequence_step_id: i64,
    ) -> StoreResult<Option<SequenceContact>> {
        let mut conn = self.conn().await?;
        let row: Option<ContactRow> = sequence_contacts::table
            .filter(sequence_contacts::sequence_id.eq(sequence_id))
            .filter(sequence_contacts::recipient_address.eq(recipient_address))
            .filter(sequence_contacts::sequence_step_id.eq(sequence_step_id))
            .select(ContactRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(SequenceContact::try_from).transpose()
    }

    async fn recipient_contacts(
        &self,
        sequence_id: i64,
        recipient_address: &str,
    ) -> StoreResult<Vec<SequenceContact>> {
        let mut conn = self.conn().await?;
        let rows: Vec<ContactRow> = sequence_contacts::table
            .filter(sequence_contacts::sequence_id.eq(sequence_id))
            .filter(sequence_contacts::recipient_address.eq(recipient_address))
            .order((sequence_contacts::current_step.asc(), sequence_contacts::id.asc()))
            .select(ContactRow::as_select())
            .load(&mut conn)
            .await?;
        convert_all(rows)
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

        let mut conn = self.conn().await?;
        let row: Option<ContactRow> = diesel::update(
            sequence_contacts::table
                .filter(sequence_contacts::id.eq(id))
                .filter(sequence_contacts::status.eq(ContactStatus::Active.as_str())),
        )
        .set((
            sequence_contacts::status.eq(status.as_str()),
            sequence_contacts::completed_at.eq(Some(now)),
        ))
        .returning(ContactRow::as_returning())
        .get_result(&mut conn)
        .await
        .optional()?;
        row.map(SequenceContact::try_from).transpose()
    }

    async fn activate_next_contact(
        &self,
        sequence_id: i64,
        recipient_address: &str,
        due_by: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SequenceContact>> {
        let mut conn = self.conn().await?;
        let activated: Result<Vec<ContactRow>, DieselError> = diesel::sql_query(ACTIVATE_NEXT_SQL)
            .bind::<BigInt, _>(sequence_id)
            .bind::<Text, _>(recipient_address)
            .bind::<Timestamptz, _>(due_by)
            .bind::<Timestamptz, _>(now)
            .load(&mut conn)
            .await;

        match activated {
            Ok(rows) => rows.into_iter().next().map(SequenceContact::try_from).transpose(),
            // A concurrent activation won the one-active index.
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn recipients_awaiting_activation(
        &self,
        due_by: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<(i64, String)>> {
        let mut conn = self.conn().await?;
        let rows: Vec<AwaitingRow> = diesel::sql_query(AWAITING_ACTIVATION_SQL)
            .bind::<Timestamptz, _>(due_by)
            .bind::<BigInt, _>(to_limit(limit))
            .load(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.sequence_id, r.recipient_address))
            .collect())
    }

    async fn settled_active_contacts(&self, limit: usize) -> StoreResult<Vec<SequenceContact>> {
        let mut conn = self.conn().await?;
        let rows: Vec<ContactRow> = diesel::sql_query(SETTLED_ACTIVE_SQL)
            .bind::<BigInt, _>(to_limit(limit))
            .load(&mut conn)
            .await?;
        convert_all(rows)
    }

    async fn orphaned_contacts(&self, limit: usize) -> StoreResult<Vec<SequenceContact>> {
        let mut conn = self.conn().await?;
        let rows: Vec<ContactRow> = diesel::sql_query(ORPHANED_CONTACTS_SQL)
            .bind::<BigInt, _>(to_limit(limit))
            .load(&mut conn)
            .await?;
        convert_all(rows)
    }

    async fn recipients_to_enroll(&self, after_id: i64, limit: usize) -> StoreResult<Vec<Recipient>> {
        let mut conn = self.conn().await?;
        let rows: Vec<RecipientRow> = diesel::sql_query(RECIPIENTS_TO_ENROLL_SQL)
            .bind::<BigInt, _>(after_id)
            .bind::<BigInt, _>(to_limit(limit))
            .load(&mut conn)
            .await?;
        Ok(rows.into_iter().map(Recipient::from).collect())
    }

    async fn campaign_recipients(
        &self,
        account_id: &str,
        niche: &str,
        status: &str,
    ) -> StoreResult<Vec<Recipient>> {
        let mut conn = self.conn().await?;
        let rows: Vec<RecipientRow> = recipients::table
            .filter(recipients::account_id.eq(account_id))
            .filter(recipients::niche.eq(niche))
            .filter(recipients::status.eq(status))
            .order(recipients::id.asc())
            .select(RecipientRow::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows.into_iter().map(Recipient::from).collect())
    }

    async fn get_device(&self, id: &str) -> StoreResult<Option<Device>> {
        let mut conn = self.conn().await?;
        let row: Option<DeviceRow> = devices::table
            .find(id)
            .select(DeviceRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(Device::try_from).transpose()
    }

    async fn list_devices(&self) -> StoreResult<Vec<Device>> {
        let mut conn = self.conn().await?;
        let rows: Vec<DeviceRow> = devices::table
            .order(devices::id.asc())
            .select(DeviceRow::as_select())
            .load(&mut conn)
            .await?;
        convert_all(rows)
    }

    async fn due_campaigns(&self, due_by: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Campaign>> {
        let mut conn = self.conn().await?;
        let rows: Vec<CampaignRow> = campaigns::table
            .filter(campaigns::status.eq(CampaignStatus::Pending.as_str()))
            .filter(campaigns::scheduled_at.le(due_by))
            .order((campaigns::scheduled_at.asc(), campaigns::id.asc()))
            .limit(to_limit(limit))
            .select(CampaignRow::as_select())
            .load(&mut conn)
            .await?;
        convert_all(rows)
    }

    async fn campaigns_with_status(
        &self,
        status: CampaignStatus,
        limit: usize,
    ) -> StoreResult<Vec<Campaign>> {
        let mut conn = self.conn().await?;
        let rows: Vec<CampaignRow> = campaigns::table
            .filter(campaigns::status.eq(status.as_str()))
            .order(campaigns::id.asc())
            .limit(to_limit(limit))
            .select(CampaignRow::as_select())
            .load(&mut conn)
            .await?;
        convert_all(rows)
    }

    async fn campaigns_awaiting_fan_out(&self, limit: usize) -> StoreResult<Vec<Campaign>> {
        let mut conn = self.conn().await?;
        let rows: Vec<CampaignRow> = campaigns::table
            .filter(campaigns::status.eq(CampaignStatus::Triggered.as_str()))
            .filter(campaigns::fanned_out_at.is_null())
            .order(campaigns::id.asc())
            .limit(to_limit(limit))
            .select(CampaignRow::as_select())
            .load(&mut conn)
            .await?;
        convert_all(rows)
    }

    async fn mark_campaign_fanned_out(&self, id: i64, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            campaigns::table
                .filter(campaigns::id.eq(id))
                .filter(campaigns::fanned_out_at.is_null()),
        )
        .set((
            campaigns::fanned_out_at.eq(Some(now)),
            campaigns::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?;
        Ok(updated == 1)
    }

    async fn transition_campaign(
        &self,
        id: i64,
        from: CampaignStatus,
        to: CampaignStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            campaigns::table
                .filter(campaigns::id.eq(id))
                .filter(campaigns::status.eq(from.as_str())),
        )
        .set((
            campaigns::status.eq(to.as_str()),
            campaigns::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?;
        Ok(updated == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_row(kind: &str, platform: Option<&str>) -> DeviceRow {
        DeviceRow {
            id: "dev-1".into(),
            account_id: "acct".into(),
            name: "front desk".into(),
            kind: kind.into(),
            platform: platform.map(str::to_string),
            api_token: None,
        }
    }

    #[test]
    fn device_rows_map_to_kinds() {
        let interactive = Device::try_from(device_row("interactive", None)).unwrap();
        assert_eq!(interactive.kind, DeviceKind::Interactive);

        let api = Device::try_from(device_row("api", Some("whacenter"))).unwrap();
        assert_eq!(api.kind, DeviceKind::Api(ApiPlatform::Whacenter));

        assert!(Device::try_from(device_row("api", None)).is_err());
        assert!(Device::try_from(device_row("api", Some("telegram"))).is_err());
        assert!(Device::try_from(device_row("bluetooth", None)).is_err());
    }

    #[test]
    fn message_rows_reject_unknown_status() {
        let row = MessageRow {
            id: 9,
            account_id: "acct".into(),
            device_id: "dev-1".into(),
            campaign_id: Some(3),
            sequence_id: None,
            sequence_step_id: None,
            recipient_address: "6011".into(),
            recipient_name: String::new(),
            message_kind: "text".into(),
            content: "hi".into(),
            media_url: None,
            min_delay_seconds: 0,
            max_delay_seconds: 0,
            status: "queued".into(),
            scheduled_at: None,
            processing_worker_id: None,
            processing_started_at: None,
            sent_at: None,
            error_message: None,
            created_at: Utc::now(),
        };
        assert!(matches!(
            BroadcastMessage::try_from(row),
            Err(StoreError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn limits_saturate() {
        assert_eq!(to_limit(5), 5);
        assert_eq!(to_limit(usize::MAX), i64::MAX);
    }
}
