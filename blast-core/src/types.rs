use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

pub type MessageId = i64;
pub type ContactId = i64;

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StoreError::unknown_variant($kind, other)),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Skipped,
    Cancelled,
}

string_enum!(MessageStatus, "message status", {
    Pending => "pending",
    Processing => "processing",
    Sent => "sent",
    Failed => "failed",
    Skipped => "skipped",
    Cancelled => "cancelled",
});

impl MessageStatus {
    /// Sent, failed and skipped are reached only through `processing`.
    pub fn is_delivery_outcome(&self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Failed | MessageStatus::Skipped)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_delivery_outcome() || *self == MessageStatus::Cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Document,
}

string_enum!(MessageKind, "message kind", {
    Text => "text",
    Image => "image",
    Video => "video",
    Document => "document",
});

/// What a queued message belongs to. Exactly one of campaign or sequence step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageTarget {
    Campaign { campaign_id: i64 },
    SequenceStep { sequence_id: i64, sequence_step_id: i64 },
}

impl MessageTarget {
    pub fn campaign_id(&self) -> Option<i64> {
        match self {
            MessageTarget::Campaign { campaign_id } => Some(*campaign_id),
            MessageTarget::SequenceStep { .. } => None,
        }
    }

    pub fn sequence_id(&self) -> Option<i64> {
        match self {
            MessageTarget::SequenceStep { sequence_id, .. } => Some(*sequence_id),
            MessageTarget::Campaign { .. } => None,
        }
    }

    pub fn sequence_step_id(&self) -> Option<i64> {
        match self {
            MessageTarget::SequenceStep { sequence_step_id, .. } => Some(*sequence_step_id),
            MessageTarget::Campaign { .. } => None,
        }
    }

    pub fn dedupe_target(&self) -> DedupeTarget {
        match self {
            MessageTarget::Campaign { campaign_id } => DedupeTarget::Campaign(*campaign_id),
            MessageTarget::SequenceStep { sequence_step_id, .. } => DedupeTarget::Step(*sequence_step_id),
        }
    }

    /// Rebuild the target from the nullable columns of a stored row.
    pub fn from_columns(
        id: MessageId,
        campaign_id: Option<i64>,
        sequence_id: Option<i64>,
        sequence_step_id: Option<i64>,
    ) -> Result<Self, StoreError> {
        match (campaign_id, sequence_id, sequence_step_id) {
            (Some(campaign_id), None, None) => Ok(MessageTarget::Campaign { campaign_id }),
            (None, Some(sequence_id), Some(sequence_step_id)) => Ok(MessageTarget::SequenceStep {
                sequence_id,
                sequence_step_id,
            }),
            other => Err(StoreError::corrupt(
                "broadcast_messages",
                id,
                format!("ambiguous target columns {:?}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DedupeTarget {
    Campaign(i64),
    Step(i64),
}

/// The at-most-once key: one live row per recipient, device and campaign/step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupeKey {
    pub recipient_address: String,
    pub device_id: String,
    pub target: DedupeTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub id: MessageId,
    pub account_id: String,
    pub device_id: String,
    pub target: MessageTarget,
    pub recipient_address: String,
    pub recipient_name: String,
    pub message_kind: MessageKind,
    pub content: String,
    pub media_url: Option<String>,
    pub min_delay_seconds: i32,
    pub max_delay_seconds: i32,
    pub status: MessageStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub processing_worker_id: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl BroadcastMessage {
    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey {
            recipient_address: self.recipient_address.clone(),
            device_id: self.device_id.clone(),
            target: self.target.dedupe_target(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBroadcastMessage {
    pub account_id: String,
    pub device_id: String,
    pub target: MessageTarget,
    pub recipient_address: String,
    pub recipient_name: String,
    pub message_kind: MessageKind,
    pub content: String,
    pub media_url: Option<String>,
    pub min_delay_seconds: i32,
    pub max_delay_seconds: i32,
    pub scheduled_at: DateTime<Utc>,
}

impl NewBroadcastMessage {
    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey {
            recipient_address: self.recipient_address.clone(),
            device_id: self.device_id.clone(),
            target: self.target.dedupe_target(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: i64,
    pub account_id: String,
    pub device_id: String,
    pub name: String,
    pub is_active: bool,
    pub min_delay_seconds: i32,
    pub max_delay_seconds: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStep {
    pub id: i64,
    pub sequence_id: i64,
    pub day_number: i32,
    pub trigger: String,
    pub next_trigger: Option<String>,
    pub trigger_delay_hours: i32,
    pub min_delay_seconds: Option<i32>,
    pub max_delay_seconds: Option<i32>,
    pub message_kind: MessageKind,
    pub content: String,
    pub media_url: Option<String>,
    pub is_entry_point: bool,
}

/// A sequence with its steps ordered by `day_number`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencePlan {
    pub sequence: Sequence,
    pub steps: Vec<SequenceStep>,
}

impl SequencePlan {
    pub fn delay_bounds(&self, step: &SequenceStep) -> (i32, i32) {
        let min = step.min_delay_seconds.unwrap_or(self.sequence.min_delay_seconds).max(0);
        let max = step.max_delay_seconds.unwrap_or(self.sequence.max_delay_seconds).max(min);
        (min, max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

string_enum!(ContactStatus, "contact status", {
    Pending => "pending",
    Active => "active",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceContact {
    pub id: ContactId,
    pub sequence_id: i64,
    pub recipient_address: String,
    pub recipient_name: String,
    pub current_step: i32,
    pub current_trigger: String,
    pub status: ContactStatus,
    pub next_trigger_time: DateTime<Utc>,
    pub assigned_device_id: String,
    pub sequence_step_id: i64,
    pub activated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSequenceContact {
    pub sequence_id: i64,
    pub recipient_address: String,
    pub recipient_name: String,
    pub current_step: i32,
    pub current_trigger: String,
    pub next_trigger_time: DateTime<Utc>,
    pub assigned_device_id: String,
    pub sequence_step_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Pending,
    Triggered,
    Finished,
}

string_enum!(CampaignStatus, "campaign status", {
    Pending => "pending",
    Triggered => "triggered",
    Finished => "finished",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub account_id: String,
    pub title: String,
    pub message_kind: MessageKind,
    pub content: String,
    pub media_url: Option<String>,
    pub niche: String,
    pub target_status: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub min_delay_seconds: i32,
    pub max_delay_seconds: i32,
    pub status: CampaignStatus,
    /// Set once every matched recipient has been offered to the queue. A
    /// triggered campaign without it is fanned out again on the next pass.
    pub fanned_out_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub const DEFAULT_TARGET_STATUS: &'static str = "prospect";

    pub fn effective_target_status(&self) -> &str {
        match self.target_status.as_deref().map(str::trim) {
            Some(status) if !status.is_empty() => status,
            _ => Self::DEFAULT_TARGET_STATUS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiPlatform {
    Wablas,
    Whacenter,
}

string_enum!(ApiPlatform, "api platform", {
    Wablas => "wablas",
    Whacenter => "whacenter",
});

/// How a device is reached.
///
/// Interactive devices hold a live session and can go offline; API devices
/// are statically addressed through a vendor endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "platform", rename_all = "lowercase")]
pub enum DeviceKind {
    Interactive,
    Api(ApiPlatform),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub kind: DeviceKind,
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
}

/// Reference to an entry-point trigger. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerId(String);

impl TriggerId {
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(TriggerId(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryTrigger {
    Named(TriggerId),
    None,
}

impl EntryTrigger {
    pub fn from_column(raw: Option<&str>) -> Self {
        match raw.and_then(TriggerId::new) {
            Some(id) => EntryTrigger::Named(id),
            None => EntryTrigger::None,
        }
    }

    pub fn trigger_id(&self) -> Option<&TriggerId> {
        match self {
            EntryTrigger::Named(id) => Some(id),
            EntryTrigger::None => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: i64,
    pub account_id: String,
    pub device_id: Option<String>,
    pub address: String,
    pub name: String,
    pub niche: String,
    pub status: String,
    pub entry_trigger: EntryTrigger,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
    pub skipped: i64,
    pub cancelled: i64,
}

impl QueueStats {
    pub fn record(&mut self, status: MessageStatus, count: i64) {
        match status {
            MessageStatus::Pending => self.pending += count,
            MessageStatus::Processing => self.processing += count,
            MessageStatus::Sent => self.sent += count,
            MessageStatus::Failed => self.failed += count,
            MessageStatus::Skipped => self.skipped += count,
            MessageStatus::Cancelled => self.cancelled += count,
        }
    }
}
