use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use blast_core::BlastContext;
use tokio::task::JoinHandle;

use crate::sender::{HttpSender, Sender};
use crate::worker::DeviceWorker;

/// Keeps exactly one running worker per registered device.
pub struct Dispatcher {
    ctx: BlastContext,
    sender: Arc<dyn Sender>,
    workers: HashMap<String, JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(ctx: BlastContext, sender: Arc<dyn Sender>) -> Self {
        Self {
            ctx,
            sender,
            workers: HashMap::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Reconcile workers with the device table. Returns how many were started.
    pub async fn refresh(&mut self) -> Result<usize> {
        let devices = self.ctx.store.list_devices().await?;

        let known: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        self.workers.retain(|device_id, handle| {
            if known.contains(&device_id.as_str()) {
                return true;
            }
            tracing::info!("Device {} removed, stopping its worker", device_id);
            handle.abort();
            false
        });

        let mut started = 0;
        for device in devices {
            if let Some(handle) = self.workers.get(&device.id) {
                if !handle.is_finished() {
                    continue;
                }
                tracing::warn!("Worker for device {} exited, restarting", device.id);
            }

            let device_id = device.id.clone();
            let worker = DeviceWorker::from_context(&self.ctx, device, self.sender.clone());
            self.workers.insert(device_id, tokio::spawn(worker.run()));
            started += 1;
        }
        Ok(started)
    }

    pub fn shutdown(&mut self) {
        for (_, handle) in self.workers.drain() {
            handle.abort();
        }
    }
}

pub async fn run(ctx: BlastContext) -> Result<()> {
    tracing::info!("Starting device dispatcher");

    let sender: Arc<dyn Sender> = Arc::new(HttpSender::new(&ctx.config.delivery)?);
    let interval = Duration::from_secs(ctx.config.delivery.device_refresh_secs.max(1));
    let mut dispatcher = Dispatcher::new(ctx, sender);

    let mut error_count = 0u32;
    loop {
        match dispatcher.refresh().await {
            Ok(started) => {
                error_count = 0;
                if started > 0 {
                    tracing::info!(
                        "Started {} device workers ({} running)",
                        started,
                        dispatcher.worker_count()
                    );
                }
                tokio::time::sleep(interval).await;
            }
            Err(e) => {
                error_count += 1;
                tracing::error!("Error refreshing devices (error count: {}): {}", error_count, e);
                // 1s, 2s, 4s, max 30s
                let backoff = Duration::from_secs(1 << error_count.min(5)).min(Duration::from_secs(30));
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use blast_core::clock::SchedulingClock;
    use blast_core::config::Config;
    use blast_core::store::MemoryStore;
    use blast_core::types::{ApiPlatform, BroadcastMessage, Device, DeviceKind};
    use chrono::Utc;

    use crate::sender::SendOutcome;

    struct NullSender;

    #[async_trait]
    impl Sender for NullSender {
        async fn send(&self, _device: &Device, _message: &BroadcastMessage) -> SendOutcome {
            SendOutcome::Delivered
        }
    }

    fn device(id: &str) -> Device {
        Device {
            id: id.into(),
            account_id: "acct".into(),
            name: id.into(),
            kind: DeviceKind::Api(ApiPlatform::Wablas),
            api_token: Some("tok".into()),
        }
    }

    #[tokio::test]
    async fn one_worker_per_device_across_refreshes() {
        let store = Arc::new(MemoryStore::new());
        store.insert_device(device("dev-1")).await;
        store.insert_device(device("dev-2")).await;

        let ctx = BlastContext::with_store(
            Config::for_memory(),
            store.clone(),
            SchedulingClock::frozen(Utc::now(), chrono::Duration::hours(8)),
        );
        let mut dispatcher = Dispatcher::new(ctx, Arc::new(NullSender));

        assert_eq!(dispatcher.refresh().await.unwrap(), 2);
        assert_eq!(dispatcher.refresh().await.unwrap(), 0);
        assert_eq!(dispatcher.worker_count(), 2);

        store.insert_device(device("dev-3")).await;
        assert_eq!(dispatcher.refresh().await.unwrap(), 1);
        assert_eq!(dispatcher.worker_count(), 3);

        dispatcher.shutdown();
        assert_eq!(dispatcher.worker_count(), 0);
    }
}
