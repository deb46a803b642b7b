//! Matches recipients to sequence entry points and campaigns, and performs
//! the initial enqueue.
//!
//! Matching is exact on [`TriggerId`]. A recipient without a trigger never
//! matches, and a trigger that resolves to more than one entry point is
//! refused rather than guessed at.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use blast_core::clock::SchedulingClock;
use blast_core::config::SchedulingConfig;
use blast_core::error::StoreError;
use blast_core::store::Store;
use blast_core::types::{
    Campaign, CampaignStatus, Device, MessageTarget, NewBroadcastMessage, NewSequenceContact,
    Recipient, Sequence, SequenceContact, SequencePlan, TriggerId,
};
use blast_core::BlastContext;
use blast_queue::guard::DuplicateGuard;
use chrono::Duration;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;

use crate::progression::ProgressionEngine;
use crate::schedule::{Schedule, ScheduledStep};

const CAMPAIGN_BATCH: usize = 100;

#[derive(Debug, Error)]
pub enum EnrollmentError {
    #[error("trigger {trigger:?} matches {count} entry points")]
    Ambiguous { trigger: String, count: usize },

    #[error("entry step {step_id} of sequence {sequence_id} has an empty trigger")]
    EmptyTrigger { sequence_id: i64, step_id: i64 },

    #[error("recipient {recipient} has no usable device for account {account_id}")]
    InvalidDevice { recipient: String, account_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Counts from one processor pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub repaired_steps: usize,
    pub sequence_enrollments: usize,
    pub campaign_messages: usize,
    pub activated_steps: usize,
    pub finished_campaigns: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntryPoint {
    plan: usize,
    step: usize,
}

/// `trigger -> entry points` over the active sequences.
struct EntryIndex {
    entries: HashMap<TriggerId, Vec<EntryPoint>>,
}

impl EntryIndex {
    fn build(plans: &[SequencePlan]) -> Self {
        let mut entries: HashMap<TriggerId, Vec<EntryPoint>> = HashMap::new();
        for (plan_idx, plan) in plans.iter().enumerate() {
            for (step_idx, step) in plan.steps.iter().enumerate() {
                if !step.is_entry_point {
                    continue;
                }
                match TriggerId::new(&step.trigger) {
                    Some(trigger) => entries.entry(trigger).or_default().push(EntryPoint {
                        plan: plan_idx,
                        step: step_idx,
                    }),
                    None => {
                        let err = EnrollmentError::EmptyTrigger {
                            sequence_id: plan.sequence.id,
                            step_id: step.id,
                        };
                        tracing::warn!("Ignoring entry point: {}", err);
                    }
                }
            }
        }
        Self { entries }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn resolve(&self, trigger: &TriggerId) -> Result<Option<EntryPoint>, EnrollmentError> {
        match self.entries.get(trigger).map(Vec::as_slice) {
            None | Some([]) => Ok(None),
            Some([single]) => Ok(Some(*single)),
            Some(many) => Err(EnrollmentError::Ambiguous {
                trigger: trigger.to_string(),
                count: many.len(),
            }),
        }
    }
}

fn step_message(step: &ScheduledStep, device_id: &str, address: &str, name: &str) -> NewBroadcastMessage {
    NewBroadcastMessage {
        account_id: step.account_id.clone(),
        device_id: device_id.to_string(),
        target: MessageTarget::SequenceStep {
            sequence_id: step.sequence_id,
            sequence_step_id: step.step.id,
        },
        recipient_address: address.to_string(),
        recipient_name: name.to_string(),
        message_kind: step.step.message_kind,
        content: step.step.content.clone(),
        media_url: step.step.media_url.clone(),
        min_delay_seconds: step.min_delay_seconds,
        max_delay_seconds: step.max_delay_seconds,
        scheduled_at: step.fire_at,
    }
}

/// The step a ledger row points at, with the fire time already recorded on
/// the row.
fn scheduled_step_for(plans: &[SequencePlan], contact: &SequenceContact) -> Option<ScheduledStep> {
    let plan = plans.iter().find(|p| p.sequence.id == contact.sequence_id)?;
    let step = plan.steps.iter().find(|s| s.id == contact.sequence_step_id)?;
    let (min, max) = plan.delay_bounds(step);
    Some(ScheduledStep {
        sequence_id: plan.sequence.id,
        account_id: plan.sequence.account_id.clone(),
        step: step.clone(),
        fire_at: contact.next_trigger_time,
        min_delay_seconds: min,
        max_delay_seconds: max,
    })
}

/// Plan the entry sequence and follow `next_trigger` links on the last step
/// of each sequence into other sequences of the same account.
fn build_schedule<R: Rng + ?Sized>(
    plans: &[SequencePlan],
    index: &EntryIndex,
    entry: EntryPoint,
    start: chrono::DateTime<chrono::Utc>,
    rng: &mut R,
) -> Schedule {
    let mut schedule = Schedule::starting_at(start);
    let mut current = &plans[entry.plan];
    let mut visited = HashSet::from([current.sequence.id]);
    schedule.extend(current, entry.step, rng);

    loop {
        let Some(next) = current
            .steps
            .last()
            .and_then(|step| step.next_trigger.as_deref())
            .and_then(TriggerId::new)
        else {
            break;
        };

        let linked = match index.resolve(&next) {
            Ok(Some(linked)) => linked,
            Ok(None) => {
                tracing::warn!(
                    "Sequence {} links to unknown trigger {:?}, chain stops",
                    current.sequence.id,
                    next.as_str()
                );
                break;
            }
            Err(e) => {
                tracing::warn!("Sequence {} chain stops: {}", current.sequence.id, e);
                break;
            }
        };

        let target = &plans[linked.plan];
        if target.sequence.account_id != current.sequence.account_id {
            tracing::warn!(
                "Sequence {} links across accounts into sequence {}, chain stops",
                current.sequence.id,
                target.sequence.id
            );
            break;
        }
        if !visited.insert(target.sequence.id) {
            break;
        }

        schedule.extend(target, linked.step, rng);
        current = target;
    }
    schedule
}

#[derive(Clone)]
pub struct EnrollmentProcessor {
    store: Arc<dyn Store>,
    clock: SchedulingClock,
    config: SchedulingConfig,
    guard: DuplicateGuard,
    engine: ProgressionEngine,
}

impl EnrollmentProcessor {
    pub fn new(store: Arc<dyn Store>, clock: SchedulingClock, config: SchedulingConfig) -> Self {
        Self {
            guard: DuplicateGuard::new(store.clone(), clock),
            engine: ProgressionEngine::new(store.clone(), clock),
            store,
            clock,
            config,
        }
    }

    pub fn from_context(ctx: &BlastContext) -> Self {
        Self::new(ctx.store.clone(), ctx.clock, ctx.config.scheduling.clone())
    }

    pub fn engine(&self) -> &ProgressionEngine {
        &self.engine
    }

    /// One full pass: ledger repair, sequences, campaigns, the activation
    /// sweep and campaign completion.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleReport> {
        Ok(CycleReport {
            repaired_steps: self.repair_orphaned_steps().await?,
            sequence_enrollments: self.enroll_eligible().await?,
            campaign_messages: self.enroll_campaigns().await?,
            activated_steps: self
                .engine
                .activate_due(self.config.enrollment_batch_size)
                .await?,
            finished_campaigns: self.finish_drained_campaigns().await?,
        })
    }

    /// Enroll every recipient whose entry trigger names exactly one entry
    /// point and who is not yet in that sequence. Returns the number of new
    /// enrollments.
    pub async fn enroll_eligible(&self) -> anyhow::Result<usize> {
        let plans = self.store.active_sequences().await?;
        let index = EntryIndex::build(&plans);
        if index.is_empty() {
            return Ok(0);
        }

        let batch_size = self.config.enrollment_batch_size.max(1);
        let mut after_id = 0;
        let mut enrolled = 0;

        loop {
            let batch = self.store.recipients_to_enroll(after_id, batch_size).await?;
            let Some(last) = batch.last() else {
                break;
            };
            after_id = last.id;

            for recipient in &batch {
                match self.enroll_recipient(&plans, &index, recipient).await {
                    Ok(true) => enrolled += 1,
                    Ok(false) => {}
                    Err(EnrollmentError::Store(e)) => return Err(e.into()),
                    Err(e) => tracing::warn!("Not enrolling {}: {}", recipient.address, e),
                }
            }

            if batch.len() < batch_size {
                break;
            }
        }

        if enrolled > 0 {
            tracing::info!("Enrolled {} recipients into sequences", enrolled);
        }
        Ok(enrolled)
    }

    async fn enroll_recipient(
        &self,
        plans: &[SequencePlan],
        index: &EntryIndex,
        recipient: &Recipient,
    ) -> Result<bool, EnrollmentError> {
        let Some(trigger) = recipient.entry_trigger.trigger_id() else {
            return Ok(false);
        };
        let Some(entry) = index.resolve(trigger)? else {
            return Ok(false);
        };
        let plan = &plans[entry.plan];

        if self
            .store
            .is_enrolled(plan.sequence.id, &recipient.address)
            .await?
        {
            return Ok(false);
        }

        let device = self.resolve_device(recipient, &plan.sequence).await?;

        let start = self.clock.local_now() + Duration::seconds(self.config.enrollment_start_delay_secs);
        let schedule = {
            let mut rng = rand::thread_rng();
            build_schedule(plans, index, entry, start, &mut rng)
        };

        let contacts: Vec<NewSequenceContact> = schedule
            .steps()
            .iter()
            .map(|s| NewSequenceContact {
                sequence_id: s.sequence_id,
                recipient_address: recipient.address.clone(),
                recipient_name: recipient.name.clone(),
                current_step: s.step.day_number,
                current_trigger: s.step.trigger.clone(),
                next_trigger_time: s.fire_at,
                assigned_device_id: device.id.clone(),
                sequence_step_id: s.step.id,
            })
            .collect();

        let inserted = self.store.insert_contacts(&contacts, self.clock.now()).await?;
        if inserted == 0 {
            // A concurrent pass enrolled this recipient first.
            return Ok(false);
        }

        let messages: Vec<NewBroadcastMessage> = schedule
            .steps()
            .iter()
            .map(|s| step_message(s, &device.id, &recipient.address, &recipient.name))
            .collect();
        let summary = self.guard.try_enqueue_many(&messages).await?;

        tracing::debug!(
            "Enrolled {} into sequence {} via {:?}: {} steps, {} messages queued, {} duplicates",
            recipient.address,
            plan.sequence.id,
            trigger.as_str(),
            contacts.len(),
            summary.accepted,
            summary.duplicates
        );

        let sequences: BTreeSet<i64> = schedule.steps().iter().map(|s| s.sequence_id).collect();
        for sequence_id in sequences {
            self.engine.advance(sequence_id, &recipient.address).await?;
        }
        Ok(true)
    }

    /// Re-enqueue step messages for ledger rows that have none, which happens
    /// when a pass wrote the contacts and then failed before queueing. Rows
    /// whose sequence or step is no longer active are left alone. Returns the
    /// number of messages queued.
    pub async fn repair_orphaned_steps(&self) -> anyhow::Result<usize> {
        let orphaned = self
            .store
            .orphaned_contacts(self.config.enrollment_batch_size.max(1))
            .await?;
        if orphaned.is_empty() {
            return Ok(0);
        }

        let plans = self.store.active_sequences().await?;
        let mut messages = Vec::with_capacity(orphaned.len());
        let mut touched = BTreeSet::new();
        for contact in &orphaned {
            let Some(step) = scheduled_step_for(&plans, contact) else {
                tracing::warn!(
                    "Contact {} points at inactive step {} of sequence {}, not repairing",
                    contact.id,
                    contact.sequence_step_id,
                    contact.sequence_id
                );
                continue;
            };
            messages.push(step_message(
                &step,
                &contact.assigned_device_id,
                &contact.recipient_address,
                &contact.recipient_name,
            ));
            touched.insert((contact.sequence_id, contact.recipient_address.clone()));
        }

        let summary = self.guard.try_enqueue_many(&messages).await?;
        for (sequence_id, address) in &touched {
            self.engine.advance(*sequence_id, address).await?;
        }
        if summary.accepted > 0 {
            tracing::info!("Re-queued {} orphaned sequence steps", summary.accepted);
        }
        Ok(summary.accepted)
    }

    /// The recipient's own device, or the sequence device when the recipient
    /// has none. Either way it must exist and belong to the sequence account.
    async fn resolve_device(
        &self,
        recipient: &Recipient,
        sequence: &Sequence,
    ) -> Result<Device, EnrollmentError> {
        let invalid = || EnrollmentError::InvalidDevice {
            recipient: recipient.address.clone(),
            account_id: sequence.account_id.clone(),
        };

        if recipient.account_id != sequence.account_id {
            return Err(invalid());
        }
        let device_id = recipient.device_id.as_deref().unwrap_or(&sequence.device_id);
        match self.store.get_device(device_id).await? {
            Some(device) if device.account_id == sequence.account_id => Ok(device),
            _ => Err(invalid()),
        }
    }

    /// Trigger due campaigns, then fan out every triggered campaign whose
    /// fan-out is not yet recorded. The pending -> triggered claim keeps two
    /// processors from triggering the same campaign. The fan-out marker is
    /// written only after every message is queued, so a pass that fails
    /// halfway is retried on the next cycle and the dedupe key absorbs the
    /// rows that did make it. Returns the number of messages queued.
    pub async fn enroll_campaigns(&self) -> anyhow::Result<usize> {
        let due = self
            .store
            .due_campaigns(self.clock.local_now(), CAMPAIGN_BATCH)
            .await?;
        for campaign in due {
            self.store
                .transition_campaign(
                    campaign.id,
                    CampaignStatus::Pending,
                    CampaignStatus::Triggered,
                    self.clock.now(),
                )
                .await?;
        }

        let awaiting = self.store.campaigns_awaiting_fan_out(CAMPAIGN_BATCH).await?;
        let mut queued = 0;
        for campaign in awaiting {
            queued += self.fan_out_campaign(&campaign).await?;
            self.store
                .mark_campaign_fanned_out(campaign.id, self.clock.now())
                .await?;
        }
        Ok(queued)
    }

    async fn fan_out_campaign(&self, campaign: &Campaign) -> anyhow::Result<usize> {
        let recipients = self
            .store
            .campaign_recipients(
                &campaign.account_id,
                &campaign.niche,
                campaign.effective_target_status(),
            )
            .await?;

        let scheduled_at = campaign.scheduled_at.max(self.clock.local_now());
        let mut devices: HashMap<String, Option<Device>> = HashMap::new();
        let mut candidates = Vec::with_capacity(recipients.len());
        let mut skipped = 0;

        for recipient in &recipients {
            let Some(device_id) = recipient.device_id.as_deref() else {
                skipped += 1;
                continue;
            };
            if !devices.contains_key(device_id) {
                let device = self.store.get_device(device_id).await?;
                devices.insert(device_id.to_string(), device);
            }
            let usable = matches!(
                devices.get(device_id),
                Some(Some(device)) if device.account_id == campaign.account_id
            );
            if !usable {
                skipped += 1;
                continue;
            }

            candidates.push(NewBroadcastMessage {
                account_id: campaign.account_id.clone(),
                device_id: device_id.to_string(),
                target: MessageTarget::Campaign {
                    campaign_id: campaign.id,
                },
                recipient_address: recipient.address.clone(),
                recipient_name: recipient.name.clone(),
                message_kind: campaign.message_kind,
                content: campaign.content.clone(),
                media_url: campaign.media_url.clone(),
                min_delay_seconds: campaign.min_delay_seconds,
                max_delay_seconds: campaign.max_delay_seconds.max(campaign.min_delay_seconds),
                scheduled_at,
            });
        }

        let summary = self.guard.try_enqueue_many(&candidates).await?;
        tracing::info!(
            "Campaign {} ({}) triggered: {} queued, {} duplicates, {} invalid, {} without a usable device",
            campaign.id,
            campaign.title,
            summary.accepted,
            summary.duplicates,
            summary.invalid,
            skipped
        );
        Ok(summary.accepted)
    }

    /// Flip fanned-out campaigns with nothing pending or processing left to
    /// finished.
    pub async fn finish_drained_campaigns(&self) -> anyhow::Result<usize> {
        let triggered = self
            .store
            .campaigns_with_status(CampaignStatus::Triggered, CAMPAIGN_BATCH)
            .await?;

        let mut finished = 0;
        for campaign in triggered {
            if campaign.fanned_out_at.is_none() {
                continue;
            }
            if self.store.open_campaign_messages(campaign.id).await? > 0 {
                continue;
            }
            if self
                .store
                .transition_campaign(
                    campaign.id,
                    CampaignStatus::Triggered,
                    CampaignStatus::Finished,
                    self.clock.now(),
                )
                .await?
            {
                tracing::info!("Campaign {} finished", campaign.id);
                finished += 1;
            }
        }
        Ok(finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progression::StepTransition;
    use blast_core::store::{FaultPoint, MemoryStore};
    use blast_core::types::{
        ContactStatus, DeviceKind, EntryTrigger, MessageKind, MessageStatus, SequenceStep,
    };
    use chrono::Utc;

    struct Fixture {
        store: Arc<MemoryStore>,
        processor: EnrollmentProcessor,
        clock: SchedulingClock,
    }

    fn config() -> SchedulingConfig {
        SchedulingConfig {
            // Start immediately so the first step is due on enrollment.
            enrollment_start_delay_secs: 0,
            ..SchedulingConfig::default()
        }
    }

    async fn fixture() -> Fixture {
        let clock = SchedulingClock::frozen(Utc::now(), Duration::hours(8));
        let store = Arc::new(MemoryStore::new());
        for (id, account) in [("dev-1", "acct"), ("dev-foreign", "other")] {
            store
                .insert_device(Device {
                    id: id.into(),
                    account_id: account.into(),
                    name: id.into(),
                    kind: DeviceKind::Interactive,
                    api_token: None,
                })
                .await;
        }
        Fixture {
            processor: EnrollmentProcessor::new(store.clone(), clock, config()),
            store,
            clock,
        }
    }

    fn step(id: i64, sequence_id: i64, day: i32, trigger: &str, delay_hours: i32) -> SequenceStep {
        SequenceStep {
            id,
            sequence_id,
            day_number: day,
            trigger: trigger.into(),
            next_trigger: None,
            trigger_delay_hours: delay_hours,
            min_delay_seconds: None,
            max_delay_seconds: None,
            message_kind: MessageKind::Text,
            content: format!("{} day {}", trigger, day),
            media_url: None,
            is_entry_point: day == 1,
        }
    }

    fn sequence(id: i64, account: &str) -> Sequence {
        Sequence {
            id,
            account_id: account.into(),
            device_id: "dev-1".into(),
            name: format!("sequence {}", id),
            is_active: true,
            min_delay_seconds: 0,
            max_delay_seconds: 0,
        }
    }

    /// Sequence 1, entry trigger "welcome", delays-to-next [0h, 12h, 12h].
    async fn seed_welcome(store: &MemoryStore) {
        store
            .insert_sequence(
                sequence(1, "acct"),
                vec![
                    step(11, 1, 1, "welcome", 0),
                    step(12, 1, 2, "welcome_day2", 12),
                    step(13, 1, 3, "welcome_day3", 12),
                ],
            )
            .await;
    }

    fn recipient(address: &str, trigger: Option<&str>) -> Recipient {
        Recipient {
            id: 0,
            account_id: "acct".into(),
            device_id: Some("dev-1".into()),
            address: address.into(),
            name: format!("lead {}", address),
            niche: "fitness".into(),
            status: "prospect".into(),
            entry_trigger: EntryTrigger::from_column(trigger),
        }
    }

    #[tokio::test]
    async fn three_step_enrollment_schedules_and_progresses_in_order() {
        let f = fixture().await;
        seed_welcome(&f.store).await;
        f.store.insert_recipient(recipient("A", Some("welcome"))).await;

        assert_eq!(f.processor.enroll_eligible().await.unwrap(), 1);

        let messages = f.store.messages().await;
        assert_eq!(messages.len(), 3);
        let times: Vec<_> = messages.iter().map(|m| m.scheduled_at.unwrap()).collect();
        assert!(times.windows(2).all(|w| w[0] < w[1]), "not increasing: {:?}", times);
        assert!(messages.iter().all(|m| m.status == MessageStatus::Pending));

        // Step one was due at enrollment and is the only active row.
        let contacts = f.store.contacts().await;
        assert_eq!(
            contacts.iter().map(|c| c.status).collect::<Vec<_>>(),
            vec![ContactStatus::Active, ContactStatus::Pending, ContactStatus::Pending]
        );

        // Step two is a zero-hour follow-up (one second later), so it is due
        // once the frozen clock passes it.
        let later = SchedulingClock::frozen(f.clock.now() + Duration::minutes(1), Duration::hours(8));
        let engine = ProgressionEngine::new(f.store.clone(), later);
        let StepTransition::Advanced { activated, .. } =
            engine.complete_step(contacts[0].id).await.unwrap()
        else {
            panic!("expected an advance");
        };
        assert_eq!(activated.unwrap().sequence_step_id, 12);

        let statuses: Vec<_> = f.store.contacts().await.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![ContactStatus::Completed, ContactStatus::Active, ContactStatus::Pending]
        );
    }

    #[tokio::test]
    async fn repeated_runs_do_not_enroll_twice() {
        let f = fixture().await;
        seed_welcome(&f.store).await;
        f.store.insert_recipient(recipient("A", Some("welcome"))).await;

        assert_eq!(f.processor.enroll_eligible().await.unwrap(), 1);
        assert_eq!(f.processor.enroll_eligible().await.unwrap(), 0);
        assert_eq!(f.store.messages().await.len(), 3);
        assert_eq!(f.store.contacts().await.len(), 3);
    }

    #[tokio::test]
    async fn recipients_without_an_exact_match_are_left_alone() {
        let f = fixture().await;
        seed_welcome(&f.store).await;
        f.store.insert_recipient(recipient("none", None)).await;
        f.store.insert_recipient(recipient("blank", Some("   "))).await;
        f.store.insert_recipient(recipient("partial", Some("welc"))).await;
        f.store.insert_recipient(recipient("superstring", Some("welcome_back"))).await;
        // Non-entry triggers are not entry points.
        f.store.insert_recipient(recipient("mid", Some("welcome_day2"))).await;

        assert_eq!(f.processor.enroll_eligible().await.unwrap(), 0);
        assert!(f.store.messages().await.is_empty());
        assert!(f.store.contacts().await.is_empty());
    }

    #[tokio::test]
    async fn ambiguous_triggers_are_refused() {
        let f = fixture().await;
        seed_welcome(&f.store).await;
        f.store
            .insert_sequence(sequence(2, "acct"), vec![step(21, 2, 1, "welcome", 0)])
            .await;
        f.store.insert_recipient(recipient("A", Some("welcome"))).await;

        assert_eq!(f.processor.enroll_eligible().await.unwrap(), 0);
        assert!(f.store.contacts().await.is_empty());
    }

    #[tokio::test]
    async fn devices_must_belong_to_the_sequence_account() {
        let f = fixture().await;
        seed_welcome(&f.store).await;
        let mut foreign = recipient("foreign", Some("welcome"));
        foreign.device_id = Some("dev-foreign".into());
        let mut missing = recipient("missing", Some("welcome"));
        missing.device_id = Some("dev-gone".into());
        let mut fallback = recipient("fallback", Some("welcome"));
        fallback.device_id = None;
        f.store.insert_recipient(foreign).await;
        f.store.insert_recipient(missing).await;
        f.store.insert_recipient(fallback).await;

        assert_eq!(f.processor.enroll_eligible().await.unwrap(), 1);
        let messages = f.store.messages().await;
        assert!(messages.iter().all(|m| m.recipient_address == "fallback"));
        assert!(messages.iter().all(|m| m.device_id == "dev-1"));
    }

    #[tokio::test]
    async fn last_step_chains_into_the_linked_sequence() {
        let f = fixture().await;
        let mut last = step(12, 1, 2, "welcome_day2", 24);
        last.next_trigger = Some("upsell".into());
        f.store
            .insert_sequence(sequence(1, "acct"), vec![step(11, 1, 1, "welcome", 0), last])
            .await;
        let mut upsell_last = step(22, 2, 2, "upsell_day2", 0);
        // Links back to the start; the cycle must be cut.
        upsell_last.next_trigger = Some("welcome".into());
        f.store
            .insert_sequence(sequence(2, "acct"), vec![step(21, 2, 1, "upsell", 24), upsell_last])
            .await;
        f.store.insert_recipient(recipient("A", Some("welcome"))).await;

        assert_eq!(f.processor.enroll_eligible().await.unwrap(), 1);

        let messages = f.store.messages().await;
        let steps: Vec<i64> = messages
            .iter()
            .filter_map(|m| m.target.sequence_step_id())
            .collect();
        assert_eq!(steps, vec![11, 12, 21, 22]);
        let times: Vec<_> = messages.iter().map(|m| m.scheduled_at.unwrap()).collect();
        assert!(times.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(times[2] - times[1], Duration::hours(24));

        // The chained sequence counts as enrolled, so its own trigger does
        // not enroll the recipient a second time.
        assert!(f.store.is_enrolled(2, "A").await.unwrap());
    }

    #[tokio::test]
    async fn unresolved_chain_stops_after_the_entry_sequence() {
        let f = fixture().await;
        let mut only = step(11, 1, 1, "welcome", 0);
        only.next_trigger = Some("nowhere".into());
        f.store.insert_sequence(sequence(1, "acct"), vec![only]).await;
        f.store.insert_recipient(recipient("A", Some("welcome"))).await;

        assert_eq!(f.processor.enroll_eligible().await.unwrap(), 1);
        assert_eq!(f.store.messages().await.len(), 1);
    }

    fn campaign(id: i64, target_status: Option<&str>, scheduled_in: Duration, clock: &SchedulingClock) -> Campaign {
        Campaign {
            id,
            account_id: "acct".into(),
            title: format!("campaign {}", id),
            message_kind: MessageKind::Text,
            content: "flash sale".into(),
            media_url: None,
            niche: "fitness".into(),
            target_status: target_status.map(str::to_string),
            scheduled_at: clock.local_now() + scheduled_in,
            min_delay_seconds: 5,
            max_delay_seconds: 15,
            status: CampaignStatus::Pending,
            fanned_out_at: None,
        }
    }

    #[tokio::test]
    async fn due_campaign_fans_out_once_to_matching_recipients() {
        let f = fixture().await;
        f.store.insert_recipient(recipient("p1", None)).await;
        f.store.insert_recipient(recipient("p2", None)).await;
        let mut customer = recipient("c1", None);
        customer.status = "customer".into();
        f.store.insert_recipient(customer).await;
        let mut no_device = recipient("p3", None);
        no_device.device_id = None;
        f.store.insert_recipient(no_device).await;

        f.store
            .insert_campaign(campaign(7, None, Duration::minutes(-1), &f.clock))
            .await;
        f.store
            .insert_campaign(campaign(8, Some("prospect"), Duration::hours(1), &f.clock))
            .await;

        assert_eq!(f.processor.enroll_campaigns().await.unwrap(), 2);
        assert_eq!(f.processor.enroll_campaigns().await.unwrap(), 0);

        let messages = f.store.messages().await;
        let recipients: Vec<&str> = messages.iter().map(|m| m.recipient_address.as_str()).collect();
        assert_eq!(recipients, vec!["p1", "p2"]);
        assert!(messages
            .iter()
            .all(|m| m.target == MessageTarget::Campaign { campaign_id: 7 }));
        assert_eq!(
            f.store.campaign(7).await.unwrap().status,
            CampaignStatus::Triggered
        );
        assert_eq!(f.store.campaign(8).await.unwrap().status, CampaignStatus::Pending);
    }

    #[tokio::test]
    async fn triggered_campaign_finishes_once_drained() {
        let f = fixture().await;
        f.store.insert_recipient(recipient("p1", None)).await;
        f.store
            .insert_campaign(campaign(7, None, Duration::minutes(-1), &f.clock))
            .await;
        f.processor.enroll_campaigns().await.unwrap();

        assert_eq!(f.processor.finish_drained_campaigns().await.unwrap(), 0);

        let id = f.store.messages().await[0].id;
        f.store.cancel_message(id, Utc::now()).await.unwrap();
        assert_eq!(f.processor.finish_drained_campaigns().await.unwrap(), 1);
        assert_eq!(
            f.store.campaign(7).await.unwrap().status,
            CampaignStatus::Finished
        );
    }

    #[tokio::test]
    async fn run_cycle_reports_each_phase() {
        let f = fixture().await;
        seed_welcome(&f.store).await;
        f.store.insert_recipient(recipient("A", Some("welcome"))).await;
        f.store
            .insert_campaign(campaign(7, None, Duration::minutes(-1), &f.clock))
            .await;

        let report = f.processor.run_cycle().await.unwrap();
        assert_eq!(report.repaired_steps, 0);
        assert_eq!(report.sequence_enrollments, 1);
        assert_eq!(report.campaign_messages, 1);
        assert_eq!(report.finished_campaigns, 0);
    }

    #[tokio::test]
    async fn interrupted_campaign_fan_out_is_retried_before_finishing() {
        let f = fixture().await;
        f.store.insert_recipient(recipient("p1", None)).await;
        f.store.insert_recipient(recipient("p2", None)).await;
        f.store
            .insert_campaign(campaign(7, None, Duration::minutes(-1), &f.clock))
            .await;

        f.store.fail_next(FaultPoint::InsertMessage, 1).await;
        assert!(f.processor.run_cycle().await.is_err());
        let stalled = f.store.campaign(7).await.unwrap();
        assert_eq!(stalled.status, CampaignStatus::Triggered);
        assert!(stalled.fanned_out_at.is_none());

        // Nothing is queued yet, but the campaign must not count as drained.
        assert_eq!(f.processor.finish_drained_campaigns().await.unwrap(), 0);

        let report = f.processor.run_cycle().await.unwrap();
        assert_eq!(report.campaign_messages, 2);
        assert_eq!(report.finished_campaigns, 0);
        assert!(f.store.campaign(7).await.unwrap().fanned_out_at.is_some());
        let recipients: Vec<String> = f
            .store
            .messages()
            .await
            .into_iter()
            .map(|m| m.recipient_address)
            .collect();
        assert_eq!(recipients, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[tokio::test]
    async fn enrollment_interrupted_before_queueing_is_repaired() {
        let f = fixture().await;
        seed_welcome(&f.store).await;
        f.store.insert_recipient(recipient("A", Some("welcome"))).await;

        f.store.fail_next(FaultPoint::InsertMessage, 1).await;
        assert!(f.processor.enroll_eligible().await.is_err());
        assert_eq!(f.store.contacts().await.len(), 3);
        assert!(f.store.messages().await.is_empty());

        // The ledger rows already exist, so a plain enrollment pass skips A.
        assert_eq!(f.processor.enroll_eligible().await.unwrap(), 0);

        assert_eq!(f.processor.repair_orphaned_steps().await.unwrap(), 3);
        let messages = f.store.messages().await;
        let contacts = f.store.contacts().await;
        let steps: Vec<i64> = messages
            .iter()
            .filter_map(|m| m.target.sequence_step_id())
            .collect();
        assert_eq!(steps, vec![11, 12, 13]);
        for (message, contact) in messages.iter().zip(&contacts) {
            assert_eq!(message.scheduled_at, Some(contact.next_trigger_time));
            assert_eq!(message.device_id, contact.assigned_device_id);
        }
        assert_eq!(contacts[0].status, ContactStatus::Active);

        assert_eq!(f.processor.repair_orphaned_steps().await.unwrap(), 0);
    }
}
