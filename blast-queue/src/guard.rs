//! At-most-once admission into the broadcast queue.
//!
//! The existence check is only a fast path. The partial unique indexes in the
//! store are what actually reject a second live row for the same
//! recipient, device and campaign/step when two producers race.

use std::sync::Arc;

use blast_core::clock::SchedulingClock;
use blast_core::error::StoreError;
use blast_core::store::{InsertOutcome, Store};
use blast_core::types::{MessageId, NewBroadcastMessage};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted(MessageId),
    RejectedDuplicate,
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnqueueSummary {
    pub accepted: usize,
    pub duplicates: usize,
    pub invalid: usize,
}

#[derive(Clone)]
pub struct DuplicateGuard {
    store: Arc<dyn Store>,
    clock: SchedulingClock,
}

impl DuplicateGuard {
    pub fn new(store: Arc<dyn Store>, clock: SchedulingClock) -> Self {
        Self { store, clock }
    }

    pub async fn try_enqueue(
        &self,
        candidate: &NewBroadcastMessage,
    ) -> Result<EnqueueOutcome, EnqueueError> {
        validate(candidate)?;

        let key = candidate.dedupe_key();
        if self.store.message_exists(&key).await? {
            tracing::info!(
                "Rejected duplicate for {} on device {} ({:?})",
                key.recipient_address,
                key.device_id,
                key.target
            );
            return Ok(EnqueueOutcome::RejectedDuplicate);
        }

        match self.store.insert_message(candidate, self.clock.now()).await? {
            InsertOutcome::Inserted(id) => {
                tracing::debug!("Enqueued message {} for {}", id, key.recipient_address);
                Ok(EnqueueOutcome::Accepted(id))
            }
            InsertOutcome::Duplicate => {
                tracing::info!(
                    "Lost enqueue race for {} on device {} ({:?})",
                    key.recipient_address,
                    key.device_id,
                    key.target
                );
                Ok(EnqueueOutcome::RejectedDuplicate)
            }
        }
    }

    /// Enqueue every candidate. Invalid candidates are counted and skipped;
    /// only store failures abort the batch.
    pub async fn try_enqueue_many(
        &self,
        candidates: &[NewBroadcastMessage],
    ) -> Result<EnqueueSummary, StoreError> {
        let mut summary = EnqueueSummary::default();
        for candidate in candidates {
            match self.try_enqueue(candidate).await {
                Ok(EnqueueOutcome::Accepted(_)) => summary.accepted += 1,
                Ok(EnqueueOutcome::RejectedDuplicate) => summary.duplicates += 1,
                Err(EnqueueError::InvalidCandidate(reason)) => {
                    tracing::warn!("Skipping candidate for {:?}: {}", candidate.recipient_address, reason);
                    summary.invalid += 1;
                }
                Err(EnqueueError::Store(e)) => return Err(e),
            }
        }
        Ok(summary)
    }
}

fn validate(candidate: &NewBroadcastMessage) -> Result<(), EnqueueError> {
    if candidate.recipient_address.trim().is_empty() {
        return Err(EnqueueError::InvalidCandidate("empty recipient address".into()));
    }
    if candidate.device_id.trim().is_empty() {
        return Err(EnqueueError::InvalidCandidate("empty device id".into()));
    }
    if candidate.min_delay_seconds < 0 || candidate.max_delay_seconds < candidate.min_delay_seconds {
        return Err(EnqueueError::InvalidCandidate(format!(
            "bad delay bounds [{}, {}]",
            candidate.min_delay_seconds, candidate.max_delay_seconds
        )));
    }
    Ok(())
}
