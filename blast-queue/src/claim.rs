use std::sync::Arc;

use blast_core::clock::SchedulingClock;
use blast_core::config::SchedulingConfig;
use blast_core::error::StoreResult;
use blast_core::store::{ClaimRequest, Store};
use blast_core::types::{BroadcastMessage, MessageId, MessageStatus};
use uuid::Uuid;

/// Terminal result of one delivery attempt, as recorded on the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    Failed(String),
    Skipped(String),
}

impl DeliveryOutcome {
    fn into_parts(self) -> (MessageStatus, Option<String>) {
        match self {
            DeliveryOutcome::Sent => (MessageStatus::Sent, None),
            DeliveryOutcome::Failed(reason) => (MessageStatus::Failed, Some(reason)),
            DeliveryOutcome::Skipped(reason) => (MessageStatus::Skipped, Some(reason)),
        }
    }
}

/// Worker ids are unique per claim loop, prefixed with the device for
/// readability in the processing columns.
pub fn new_worker_id(device_id: &str) -> String {
    format!("{}-{}", device_id, Uuid::new_v4())
}

#[derive(Clone)]
pub struct ClaimProtocol {
    store: Arc<dyn Store>,
    clock: SchedulingClock,
    config: SchedulingConfig,
}

impl ClaimProtocol {
    pub fn new(store: Arc<dyn Store>, clock: SchedulingClock, config: SchedulingConfig) -> Self {
        Self { store, clock, config }
    }

    /// Claim up to `limit` due rows of `device_id` for `worker_id`, earliest
    /// `scheduled_at` first. An empty result means nothing was due or other
    /// workers took it.
    pub async fn claim_batch(
        &self,
        worker_id: &str,
        device_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<BroadcastMessage>> {
        let request = ClaimRequest {
            worker_id: worker_id.to_string(),
            device_id: device_id.to_string(),
            window: self.clock.claim_window_for(&self.config),
            limit,
            now: self.clock.now(),
        };

        let claimed = self.store.claim_messages(&request).await?;
        if !claimed.is_empty() {
            tracing::debug!(
                "Worker {} claimed {} messages for device {}",
                worker_id,
                claimed.len(),
                device_id
            );
        }
        Ok(claimed)
    }

    /// Record the outcome of a claimed row. `None` when the row is no longer
    /// processing under this worker, e.g. it was cancelled mid-flight.
    pub async fn resolve(
        &self,
        message_id: MessageId,
        worker_id: &str,
        outcome: DeliveryOutcome,
    ) -> StoreResult<Option<BroadcastMessage>> {
        let (status, error_message) = outcome.into_parts();
        let resolved = self
            .store
            .resolve_message(message_id, worker_id, status, error_message, self.clock.now())
            .await?;

        if resolved.is_none() {
            tracing::warn!(
                "Message {} was no longer owned by worker {}, dropping {} outcome",
                message_id,
                worker_id,
                status
            );
        }
        Ok(resolved)
    }

    pub async fn requeue(&self, message_id: MessageId) -> StoreResult<Option<BroadcastMessage>> {
        let requeued = self.store.requeue_message(message_id, self.clock.now()).await?;
        if requeued.is_some() {
            tracing::info!("Message {} requeued by operator", message_id);
        }
        Ok(requeued)
    }

    pub async fn cancel(&self, message_id: MessageId) -> StoreResult<Option<BroadcastMessage>> {
        let cancelled = self.store.cancel_message(message_id, self.clock.now()).await?;
        if cancelled.is_some() {
            tracing::info!("Message {} cancelled", message_id);
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blast_core::store::{InsertOutcome, MemoryStore};
    use blast_core::types::{MessageKind, MessageTarget, NewBroadcastMessage};
    use chrono::{DateTime, Duration, Utc};
    use std::collections::HashSet;

    const OFFSET_HOURS: i64 = 8;

    struct Fixture {
        store: Arc<MemoryStore>,
        claims: ClaimProtocol,
        local_now: DateTime<Utc>,
    }

    fn fixture() -> Fixture {
        let now = Utc::now();
        let clock = SchedulingClock::frozen(now, Duration::hours(OFFSET_HOURS));
        let store = Arc::new(MemoryStore::new());
        Fixture {
            claims: ClaimProtocol::new(store.clone(), clock, SchedulingConfig::default()),
            local_now: clock.local_now(),
            store,
        }
    }

    async fn enqueue(store: &MemoryStore, recipient: &str, scheduled_at: DateTime<Utc>) -> MessageId {
        let message = NewBroadcastMessage {
            account_id: "acct".into(),
            device_id: "dev-1".into(),
            target: MessageTarget::Campaign { campaign_id: 1 },
            recipient_address: recipient.into(),
            recipient_name: String::new(),
            message_kind: MessageKind::Text,
            content: "promo".into(),
            media_url: None,
            min_delay_seconds: 0,
            max_delay_seconds: 0,
            scheduled_at,
        };
        match store.insert_message(&message, Utc::now()).await.unwrap() {
            InsertOutcome::Inserted(id) => id,
            InsertOutcome::Duplicate => panic!("fixture rows must be unique"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_claims_partition_the_due_rows() {
        let f = fixture();
        for i in 0..7 {
            enqueue(&f.store, &format!("6010{}", i), f.local_now - Duration::seconds(i)).await;
        }

        let (a, b) = tokio::join!(
            f.claims.claim_batch("worker-a", "dev-1", 5),
            f.claims.claim_batch("worker-b", "dev-1", 5)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let ids_a: HashSet<MessageId> = a.iter().map(|m| m.id).collect();
        let ids_b: HashSet<MessageId> = b.iter().map(|m| m.id).collect();
        assert!(ids_a.is_disjoint(&ids_b));
        assert_eq!(ids_a.len() + ids_b.len(), 7);
        assert!(a.len() <= 5 && b.len() <= 5);

        for message in f.store.messages().await {
            assert_eq!(message.status, MessageStatus::Processing);
            let owner = message.processing_worker_id.as_deref().unwrap();
            let expected = if ids_a.contains(&message.id) { "worker-a" } else { "worker-b" };
            assert_eq!(owner, expected);
        }
    }

    #[tokio::test]
    async fn claims_come_back_oldest_first() {
        let f = fixture();
        let late = enqueue(&f.store, "601", f.local_now - Duration::seconds(5)).await;
        let early = enqueue(&f.store, "602", f.local_now - Duration::seconds(50)).await;
        let middle = enqueue(&f.store, "603", f.local_now - Duration::seconds(20)).await;

        let claimed = f.claims.claim_batch("w", "dev-1", 10).await.unwrap();
        let ids: Vec<MessageId> = claimed.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![early, middle, late]);
    }

    #[tokio::test]
    async fn window_edges_are_inclusive_and_future_rows_wait() {
        let f = fixture();
        let grace = Duration::seconds(SchedulingConfig::default().claim_grace_window_secs);

        let at_earliest = enqueue(&f.store, "601", f.local_now - grace).await;
        let too_old = enqueue(&f.store, "602", f.local_now - grace - Duration::seconds(1)).await;
        let at_now = enqueue(&f.store, "603", f.local_now).await;
        let future = enqueue(&f.store, "604", f.local_now + Duration::seconds(1)).await;

        let claimed: HashSet<MessageId> = f
            .claims
            .claim_batch("w", "dev-1", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(claimed, HashSet::from([at_earliest, at_now]));

        for id in [too_old, future] {
            let row = f.store.get_message(id).await.unwrap().unwrap();
            assert_eq!(row.status, MessageStatus::Pending);
            assert!(row.processing_worker_id.is_none());
        }
    }

    #[tokio::test]
    async fn other_devices_rows_are_never_claimed() {
        let f = fixture();
        enqueue(&f.store, "601", f.local_now).await;
        assert!(f.claims.claim_batch("w", "dev-2", 10).await.unwrap().is_empty());
        assert!(f.claims.claim_batch("w", "dev-1", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolve_after_cancel_is_dropped() {
        let f = fixture();
        let id = enqueue(&f.store, "601", f.local_now).await;
        f.claims.claim_batch("w", "dev-1", 1).await.unwrap();

        let cancelled = f.claims.cancel(id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, MessageStatus::Cancelled);
        assert!(cancelled.processing_worker_id.is_none());

        assert!(f.claims.resolve(id, "w", DeliveryOutcome::Sent).await.unwrap().is_none());
        let row = f.store.get_message(id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Cancelled);
        assert!(row.sent_at.is_none());
    }

    #[tokio::test]
    async fn failed_rows_keep_their_reason_until_requeued() {
        let f = fixture();
        let id = enqueue(&f.store, "601", f.local_now).await;
        f.claims.claim_batch("w", "dev-1", 1).await.unwrap();

        let failed = f
            .claims
            .resolve(id, "w", DeliveryOutcome::Failed("gateway timeout".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("gateway timeout"));

        // Terminal rows stay put for the claim loop.
        assert!(f.claims.claim_batch("w2", "dev-1", 1).await.unwrap().is_empty());

        let requeued = f.claims.requeue(id).await.unwrap().unwrap();
        assert_eq!(requeued.status, MessageStatus::Pending);
        assert!(requeued.error_message.is_none());
        assert!(requeued.processing_worker_id.is_none());

        let again = f.claims.claim_batch("w2", "dev-1", 1).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].processing_worker_id.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn sent_rows_cannot_be_requeued_or_cancelled() {
        let f = fixture();
        let id = enqueue(&f.store, "601", f.local_now).await;
        f.claims.claim_batch("w", "dev-1", 1).await.unwrap();
        f.claims.resolve(id, "w", DeliveryOutcome::Sent).await.unwrap().unwrap();

        assert!(f.claims.requeue(id).await.unwrap().is_none());
        assert!(f.claims.cancel(id).await.unwrap().is_none());
        assert_eq!(
            f.store.get_message(id).await.unwrap().unwrap().status,
            MessageStatus::Sent
        );
    }

    #[test]
    fn worker_ids_are_unique_and_device_prefixed() {
        let a = new_worker_id("dev-1");
        let b = new_worker_id("dev-1");
        assert!(a.starts_with("dev-1-"));
        assert_ne!(a, b);
    }
}
