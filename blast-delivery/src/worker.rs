use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use blast_core::types::{BroadcastMessage, Device};
use blast_core::BlastContext;
use blast_queue::claim::{new_worker_id, ClaimProtocol, DeliveryOutcome};
use blast_sequence::progression::ProgressionEngine;
use rand::Rng;

use crate::availability::{availability_for, DeviceAvailability};
use crate::sender::{SendOutcome, Sender};

const UNAVAILABLE_BACKOFF: Duration = Duration::from_secs(30);
const DEVICE_OFFLINE: &str = "device offline";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Rows never attempted because the device went away mid-batch.
    pub skipped: usize,
    /// Rows cancelled or requeued by an operator while we held them.
    pub dropped: usize,
    pub device_unavailable: bool,
}

/// Random pause between two sends of one device, within the message bounds.
pub fn pacing_delay<R: Rng + ?Sized>(message: &BroadcastMessage, rng: &mut R) -> Duration {
    let min = message.min_delay_seconds.max(0) as u64;
    let max = (message.max_delay_seconds.max(0) as u64).max(min);
    let secs = if max > min { rng.gen_range(min..=max) } else { min };
    Duration::from_secs(secs)
}

/// Claim loop for one device.
pub struct DeviceWorker {
    device: Device,
    worker_id: String,
    claims: ClaimProtocol,
    engine: ProgressionEngine,
    sender: Arc<dyn Sender>,
    availability: Arc<dyn DeviceAvailability>,
    batch_size: usize,
    poll_interval: Duration,
}

impl DeviceWorker {
    pub fn new(
        device: Device,
        claims: ClaimProtocol,
        engine: ProgressionEngine,
        sender: Arc<dyn Sender>,
        availability: Arc<dyn DeviceAvailability>,
        batch_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            worker_id: new_worker_id(&device.id),
            device,
            claims,
            engine,
            sender,
            availability,
            batch_size: batch_size.max(1),
            poll_interval,
        }
    }

    pub fn from_context(ctx: &BlastContext, device: Device, sender: Arc<dyn Sender>) -> Self {
        let scheduling = &ctx.config.scheduling;
        let availability = availability_for(device.kind, ctx.redis_pool.as_ref());
        Self::new(
            device,
            ClaimProtocol::new(ctx.store.clone(), ctx.clock, scheduling.clone()),
            ProgressionEngine::new(ctx.store.clone(), ctx.clock),
            sender,
            availability,
            scheduling.claim_batch_size,
            Duration::from_millis(scheduling.worker_poll_interval_ms),
        )
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim one batch and work through it in `scheduled_at` order.
    pub async fn run_once(&self) -> Result<BatchReport> {
        let mut report = BatchReport::default();

        if !self.availability.check_availability(&self.device).await {
            report.device_unavailable = true;
            return Ok(report);
        }

        let batch = self
            .claims
            .claim_batch(&self.worker_id, &self.device.id, self.batch_size)
            .await?;
        report.claimed = batch.len();

        let mut rows = batch.iter();
        while let Some(message) = rows.next() {
            let outcome = match self.sender.send(&self.device, message).await {
                SendOutcome::Delivered => DeliveryOutcome::Sent,
                SendOutcome::Failed(reason) => DeliveryOutcome::Failed(reason),
                SendOutcome::DeviceUnavailable => {
                    report.device_unavailable = true;
                    // The rest of the batch is resolved as skipped, never
                    // silently handed back to pending.
                    for unsent in std::iter::once(message).chain(rows.by_ref()) {
                        self.settle(
                            unsent,
                            DeliveryOutcome::Skipped(DEVICE_OFFLINE.to_string()),
                            &mut report,
                        )
                        .await?;
                    }
                    break;
                }
            };
            self.settle(message, outcome, &mut report).await?;

            let pause = {
                let mut rng = rand::thread_rng();
                pacing_delay(message, &mut rng)
            };
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }

        Ok(report)
    }

    /// Resolve one row. A ledger error after the row is resolved is logged
    /// and left to the activation sweep, so it never strands the rest of
    /// the batch in processing.
    async fn settle(
        &self,
        message: &BroadcastMessage,
        outcome: DeliveryOutcome,
        report: &mut BatchReport,
    ) -> Result<()> {
        let counter = match &outcome {
            DeliveryOutcome::Sent => &mut report.delivered,
            DeliveryOutcome::Failed(_) => &mut report.failed,
            DeliveryOutcome::Skipped(_) => &mut report.skipped,
        };
        match self.claims.resolve(message.id, &self.worker_id, outcome).await? {
            Some(resolved) => {
                *counter += 1;
                if let Err(e) = self.engine.on_message_resolved(&resolved).await {
                    tracing::error!(
                        "Failed to settle sequence step for message {} on device {}: {}",
                        resolved.id,
                        self.device.id,
                        e
                    );
                }
            }
            None => report.dropped += 1,
        }
        Ok(())
    }

    pub async fn run(self) {
        tracing::info!(
            "Starting worker {} for device {} ({})",
            self.worker_id,
            self.device.id,
            self.device.name
        );

        loop {
            match self.run_once().await {
                Ok(report) if report.device_unavailable => {
                    tracing::debug!("Device {} unavailable, backing off", self.device.id);
                    tokio::time::sleep(UNAVAILABLE_BACKOFF).await;
                }
                Ok(report) if report.claimed == 0 => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                Ok(report) => {
                    tracing::debug!(
                        "Device {} batch: {} delivered, {} failed, {} skipped, {} dropped",
                        self.device.id,
                        report.delivered,
                        report.failed,
                        report.skipped,
                        report.dropped
                    );
                }
                Err(e) => {
                    tracing::error!("Error in worker for device {}: {}", self.device.id, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use blast_core::clock::SchedulingClock;
    use blast_core::config::SchedulingConfig;
    use blast_core::store::{FaultPoint, MemoryStore, Store};
    use blast_core::types::{
        ContactStatus, DeviceKind, MessageKind, MessageStatus, MessageTarget, NewBroadcastMessage,
        NewSequenceContact,
    };
    use chrono::{DateTime, Utc};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Mutex;

    use crate::availability::AlwaysAvailable;

    /// Replays scripted outcomes and records what it was asked to send.
    struct ScriptedSender {
        script: Mutex<Vec<SendOutcome>>,
        sent: Mutex<Vec<String>>,
    }

    impl ScriptedSender {
        fn new(mut script: Vec<SendOutcome>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sender for ScriptedSender {
        async fn send(&self, _device: &Device, message: &BroadcastMessage) -> SendOutcome {
            self.sent.lock().unwrap().push(message.recipient_address.clone());
            self.script.lock().unwrap().pop().unwrap_or(SendOutcome::Delivered)
        }
    }

    struct Offline;

    #[async_trait]
    impl DeviceAvailability for Offline {
        async fn check_availability(&self, _device: &Device) -> bool {
            false
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: SchedulingClock,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                clock: SchedulingClock::frozen(Utc::now(), chrono::Duration::hours(8)),
            }
        }

        fn worker(&self, sender: Arc<dyn Sender>, availability: Arc<dyn DeviceAvailability>) -> DeviceWorker {
            let device = Device {
                id: "dev-1".into(),
                account_id: "acct".into(),
                name: "front desk".into(),
                kind: DeviceKind::Interactive,
                api_token: None,
            };
            DeviceWorker::new(
                device,
                ClaimProtocol::new(self.store.clone(), self.clock, SchedulingConfig::default()),
                ProgressionEngine::new(self.store.clone(), self.clock),
                sender,
                availability,
                10,
                Duration::from_millis(10),
            )
        }

        async fn enqueue(&self, recipient: &str, target: MessageTarget, scheduled_at: DateTime<Utc>) {
            self.store
                .insert_message(
                    &NewBroadcastMessage {
                        account_id: "acct".into(),
                        device_id: "dev-1".into(),
                        target,
                        recipient_address: recipient.into(),
                        recipient_name: String::new(),
                        message_kind: MessageKind::Text,
                        content: "hi".into(),
                        media_url: None,
                        min_delay_seconds: 0,
                        max_delay_seconds: 0,
                        scheduled_at,
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
        }
    }

    fn campaign() -> MessageTarget {
        MessageTarget::Campaign { campaign_id: 1 }
    }

    #[tokio::test]
    async fn sends_in_schedule_order_and_records_outcomes() {
        let f = Fixture::new();
        let now = f.clock.local_now();
        f.enqueue("late", campaign(), now - chrono::Duration::seconds(1)).await;
        f.enqueue("early", campaign(), now - chrono::Duration::seconds(30)).await;

        let sender = ScriptedSender::new(vec![
            SendOutcome::Delivered,
            SendOutcome::Failed("invalid number".into()),
        ]);
        let report = f
            .worker(sender.clone(), Arc::new(AlwaysAvailable))
            .run_once()
            .await
            .unwrap();

        assert_eq!(sender.sent(), vec!["early", "late"]);
        assert_eq!((report.claimed, report.delivered, report.failed), (2, 1, 1));

        let messages = f.store.messages().await;
        let late = messages.iter().find(|m| m.recipient_address == "late").unwrap();
        let early = messages.iter().find(|m| m.recipient_address == "early").unwrap();
        assert_eq!(early.status, MessageStatus::Sent);
        assert!(early.sent_at.is_some());
        assert_eq!(late.status, MessageStatus::Failed);
        assert_eq!(late.error_message.as_deref(), Some("invalid number"));
    }

    #[tokio::test]
    async fn unavailable_device_skips_the_rest_of_the_batch() {
        let f = Fixture::new();
        let now = f.clock.local_now();
        for (i, recipient) in ["a", "b", "c"].iter().enumerate() {
            f.enqueue(recipient, campaign(), now - chrono::Duration::seconds(10 - i as i64)).await;
        }

        let sender = ScriptedSender::new(vec![SendOutcome::Delivered, SendOutcome::DeviceUnavailable]);
        let report = f
            .worker(sender.clone(), Arc::new(AlwaysAvailable))
            .run_once()
            .await
            .unwrap();

        assert!(report.device_unavailable);
        assert_eq!((report.delivered, report.failed, report.skipped), (1, 0, 2));
        assert_eq!(sender.sent(), vec!["a", "b"]);
        let statuses: Vec<_> = f.store.messages().await.iter().map(|m| m.status).collect();
        assert_eq!(
            statuses,
            vec![MessageStatus::Sent, MessageStatus::Skipped, MessageStatus::Skipped]
        );
        assert!(f
            .store
            .messages()
            .await
            .iter()
            .skip(1)
            .all(|m| m.error_message.as_deref() == Some(DEVICE_OFFLINE)));
    }

    #[tokio::test]
    async fn offline_device_claims_nothing() {
        let f = Fixture::new();
        f.enqueue("a", campaign(), f.clock.local_now()).await;

        let sender = ScriptedSender::new(vec![]);
        let report = f.worker(sender.clone(), Arc::new(Offline)).run_once().await.unwrap();

        assert!(report.device_unavailable);
        assert_eq!(report.claimed, 0);
        assert!(sender.sent().is_empty());
        assert_eq!(f.store.messages().await[0].status, MessageStatus::Pending);
    }

    /// Two due steps for "lead" on sequence 9, step one already active.
    async fn seed_two_steps(f: &Fixture) {
        let now = f.clock.local_now();
        let contacts: Vec<NewSequenceContact> = [(1, 100, -60), (2, 101, -30)]
            .iter()
            .map(|(step, step_id, offset)| NewSequenceContact {
                sequence_id: 9,
                recipient_address: "lead".into(),
                recipient_name: String::new(),
                current_step: *step,
                current_trigger: format!("day{}", step),
                next_trigger_time: now + chrono::Duration::seconds(*offset),
                assigned_device_id: "dev-1".into(),
                sequence_step_id: *step_id,
            })
            .collect();
        f.store.insert_contacts(&contacts, Utc::now()).await.unwrap();
        for contact in &contacts {
            f.enqueue(
                "lead",
                MessageTarget::SequenceStep {
                    sequence_id: 9,
                    sequence_step_id: contact.sequence_step_id,
                },
                contact.next_trigger_time,
            )
            .await;
        }
        ProgressionEngine::new(f.store.clone(), f.clock)
            .advance(9, "lead")
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn delivered_sequence_step_advances_the_contact() {
        let f = Fixture::new();
        seed_two_steps(&f).await;

        let sender = ScriptedSender::new(vec![]);
        let report = f
            .worker(sender, Arc::new(AlwaysAvailable))
            .run_once()
            .await
            .unwrap();
        assert_eq!(report.delivered, 2);

        let statuses: Vec<_> = f.store.contacts().await.iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![ContactStatus::Completed, ContactStatus::Completed]);
    }

    #[tokio::test]
    async fn ledger_errors_do_not_strand_the_batch() {
        let f = Fixture::new();
        seed_two_steps(&f).await;
        f.store.fail_next(FaultPoint::FindContact, 1).await;

        let report = f
            .worker(ScriptedSender::new(vec![]), Arc::new(AlwaysAvailable))
            .run_once()
            .await
            .unwrap();
        assert_eq!((report.claimed, report.delivered), (2, 2));
        assert!(f
            .store
            .messages()
            .await
            .iter()
            .all(|m| m.status == MessageStatus::Sent));

        // Step one's resolution never reached the ledger; the sweep settles it.
        let stuck: Vec<_> = f.store.contacts().await.iter().map(|c| c.status).collect();
        assert_eq!(stuck, vec![ContactStatus::Active, ContactStatus::Pending]);
        ProgressionEngine::new(f.store.clone(), f.clock)
            .activate_due(10)
            .await
            .unwrap();
        let statuses: Vec<_> = f.store.contacts().await.iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![ContactStatus::Completed, ContactStatus::Completed]);
    }

    #[test]
    fn pacing_stays_within_message_bounds() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut message = BroadcastMessage {
            id: 1,
            account_id: "acct".into(),
            device_id: "dev-1".into(),
            target: campaign(),
            recipient_address: "a".into(),
            recipient_name: String::new(),
            message_kind: MessageKind::Text,
            content: String::new(),
            media_url: None,
            min_delay_seconds: 10,
            max_delay_seconds: 30,
            status: MessageStatus::Processing,
            scheduled_at: None,
            processing_worker_id: None,
            processing_started_at: None,
            sent_at: None,
            error_message: None,
            created_at: Utc::now(),
        };
        for _ in 0..100 {
            let pause = pacing_delay(&message, &mut rng).as_secs();
            assert!((10..=30).contains(&pause));
        }

        message.max_delay_seconds = 2;
        assert_eq!(pacing_delay(&message, &mut rng), Duration::from_secs(10));
    }
}
