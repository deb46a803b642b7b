use std::sync::Arc;

use async_trait::async_trait;
use blast_core::redis::{is_device_online, RedisPool};
use blast_core::types::{Device, DeviceKind};

#[async_trait]
pub trait DeviceAvailability: Send + Sync {
    async fn check_availability(&self, device: &Device) -> bool;
}

/// API devices are addressed statically and are always reachable.
pub struct AlwaysAvailable;

#[async_trait]
impl DeviceAvailability for AlwaysAvailable {
    async fn check_availability(&self, _device: &Device) -> bool {
        true
    }
}

/// Interactive devices are online while their presence key exists.
pub struct PresenceAvailability {
    pool: RedisPool,
}

impl PresenceAvailability {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceAvailability for PresenceAvailability {
    async fn check_availability(&self, device: &Device) -> bool {
        match is_device_online(&self.pool, &device.id).await {
            Ok(online) => online,
            Err(e) => {
                tracing::warn!("Presence lookup failed for device {}: {}", device.id, e);
                false
            }
        }
    }
}

/// Pick the availability check for a device kind once, at worker start.
pub fn availability_for(kind: DeviceKind, redis: Option<&RedisPool>) -> Arc<dyn DeviceAvailability> {
    match (kind, redis) {
        (DeviceKind::Interactive, Some(pool)) => Arc::new(PresenceAvailability::new(pool.clone())),
        (DeviceKind::Interactive, None) | (DeviceKind::Api(_), _) => Arc::new(AlwaysAvailable),
    }
}
