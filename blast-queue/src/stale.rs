use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use blast_core::clock::SchedulingClock;
use blast_core::config::SchedulingConfig;
use blast_core::error::StoreResult;
use blast_core::store::Store;
use blast_core::types::BroadcastMessage;
use blast_core::BlastContext;
use serde::Serialize;

const REPORT_LIMIT: usize = 500;

/// Rows the claim loop will never pick up on its own.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StaleReport {
    /// Pending rows scheduled before the grace window opened.
    pub stale_pending: Vec<BroadcastMessage>,
    /// Processing rows whose worker has held them past the stuck timeout.
    pub stuck_processing: Vec<BroadcastMessage>,
}

impl StaleReport {
    pub fn is_empty(&self) -> bool {
        self.stale_pending.is_empty() && self.stuck_processing.is_empty()
    }
}

#[derive(Clone)]
pub struct StaleMonitor {
    store: Arc<dyn Store>,
    clock: SchedulingClock,
    config: SchedulingConfig,
}

impl StaleMonitor {
    pub fn new(store: Arc<dyn Store>, clock: SchedulingClock, config: SchedulingConfig) -> Self {
        Self { store, clock, config }
    }

    pub fn from_context(ctx: &BlastContext) -> Self {
        Self::new(ctx.store.clone(), ctx.clock, ctx.config.scheduling.clone())
    }

    pub async fn scan(&self) -> StoreResult<StaleReport> {
        let window = self.clock.claim_window_for(&self.config);
        let stuck_before =
            self.clock.now() - chrono::Duration::seconds(self.config.stuck_processing_secs);

        Ok(StaleReport {
            stale_pending: self
                .store
                .stale_pending_messages(window.earliest, REPORT_LIMIT)
                .await?,
            stuck_processing: self
                .store
                .stuck_processing_messages(stuck_before, REPORT_LIMIT)
                .await?,
        })
    }

    /// Scan once and log every finding. Nothing is retried or cancelled here;
    /// recovery is an operator decision.
    pub async fn scan_and_report(&self) -> StoreResult<StaleReport> {
        let report = self.scan().await?;
        for message in &report.stale_pending {
            tracing::warn!(
                "Message {} for {} on device {} missed its window (scheduled_at {:?})",
                message.id,
                message.recipient_address,
                message.device_id,
                message.scheduled_at
            );
        }
        for message in &report.stuck_processing {
            tracing::warn!(
                "Message {} stuck in processing under worker {:?} since {:?}",
                message.id,
                message.processing_worker_id,
                message.processing_started_at
            );
        }
        Ok(report)
    }
}

pub async fn run(ctx: BlastContext) -> Result<()> {
    tracing::info!("Starting stale queue monitor");

    let monitor = StaleMonitor::from_context(&ctx);
    let interval = Duration::from_secs(ctx.config.scheduling.stale_scan_interval_secs);

    loop {
        match monitor.scan_and_report().await {
            Ok(report) => {
                if !report.is_empty() {
                    tracing::info!(
                        "Stale scan found {} stale pending and {} stuck processing messages",
                        report.stale_pending.len(),
                        report.stuck_processing.len()
                    );
                }
                tokio::time::sleep(interval).await;
            }
            Err(e) => {
                tracing::error!("Error in stale queue monitor: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blast_core::store::{ClaimRequest, MemoryStore};
    use blast_core::types::{MessageKind, MessageTarget, NewBroadcastMessage};
    use chrono::Utc;

    fn message(recipient: &str, scheduled_at: chrono::DateTime<Utc>) -> NewBroadcastMessage {
        NewBroadcastMessage {
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
        }
    }

    #[tokio::test]
    async fn reports_missed_and_stuck_rows_without_touching_them() {
        let now = Utc::now();
        let clock = SchedulingClock::frozen(now, chrono::Duration::hours(8));
        let config = SchedulingConfig::default();
        let store = Arc::new(MemoryStore::new());
        let local_now = clock.local_now();

        store
            .insert_message(&message("601", local_now - chrono::Duration::hours(2)), now)
            .await
            .unwrap();
        store
            .insert_message(&message("602", local_now), now)
            .await
            .unwrap();
        store
            .insert_message(&message("603", local_now - chrono::Duration::seconds(30)), now)
            .await
            .unwrap();

        // 603 was claimed long ago by a worker that never came back.
        let window = clock.claim_window_for(&config);
        let claimed = store
            .claim_messages(&ClaimRequest {
                worker_id: "gone".into(),
                device_id: "dev-1".into(),
                window,
                limit: 1,
                now: now - chrono::Duration::hours(1),
            })
            .await
            .unwrap();
        assert_eq!(claimed[0].recipient_address, "603");

        let monitor = StaleMonitor::new(store.clone(), clock, config);
        let report = monitor.scan_and_report().await.unwrap();

        let stale: Vec<&str> = report.stale_pending.iter().map(|m| m.recipient_address.as_str()).collect();
        let stuck: Vec<&str> = report.stuck_processing.iter().map(|m| m.recipient_address.as_str()).collect();
        assert_eq!(stale, vec!["601"]);
        assert_eq!(stuck, vec!["603"]);

        // Report only; statuses are unchanged.
        let statuses: Vec<_> = store.messages().await.into_iter().map(|m| m.status).collect();
        assert_eq!(
            statuses,
            vec![
                blast_core::types::MessageStatus::Pending,
                blast_core::types::MessageStatus::Pending,
                blast_core::types::MessageStatus::Processing,
            ]
        );
    }
}
