//! The per-recipient step state machine.
//!
//! A recipient has at most one `active` contact row per sequence. The store
//! enforces that with a partial unique index, so every transition here is a
//! single conditional update and a lost race simply returns nothing.

use std::sync::Arc;

use blast_core::clock::SchedulingClock;
use blast_core::error::StoreResult;
use blast_core::store::Store;
use blast_core::types::{
    BroadcastMessage, ContactId, ContactStatus, MessageStatus, MessageTarget, SequenceContact,
};

#[derive(Debug, Clone)]
pub enum StepTransition {
    /// The contact was not active (already finished, or still waiting).
    NoOp,
    Advanced {
        finished: SequenceContact,
        /// The step that is active once progression settles, if any is due.
        activated: Option<SequenceContact>,
    },
}

/// The contact state a resolved message settles its step into.
fn contact_status_for(status: MessageStatus) -> Option<ContactStatus> {
    match status {
        MessageStatus::Sent | MessageStatus::Skipped => Some(ContactStatus::Completed),
        MessageStatus::Failed | MessageStatus::Cancelled => Some(ContactStatus::Failed),
        MessageStatus::Pending | MessageStatus::Processing => None,
    }
}

#[derive(Clone)]
pub struct ProgressionEngine {
    store: Arc<dyn Store>,
    clock: SchedulingClock,
}

impl ProgressionEngine {
    pub fn new(store: Arc<dyn Store>, clock: SchedulingClock) -> Self {
        Self { store, clock }
    }

    pub async fn complete_step(&self, contact_id: ContactId) -> StoreResult<StepTransition> {
        self.finish(contact_id, ContactStatus::Completed).await
    }

    /// Mark the step failed. The next step is still unblocked.
    pub async fn fail_step(&self, contact_id: ContactId, reason: &str) -> StoreResult<StepTransition> {
        tracing::warn!("Sequence contact {} failed: {}", contact_id, reason);
        self.finish(contact_id, ContactStatus::Failed).await
    }

    async fn finish(&self, contact_id: ContactId, status: ContactStatus) -> StoreResult<StepTransition> {
        let Some(finished) = self
            .store
            .finish_active_contact(contact_id, status, self.clock.now())
            .await?
        else {
            return Ok(StepTransition::NoOp);
        };

        let activated = self
            .advance(finished.sequence_id, &finished.recipient_address)
            .await?;
        Ok(StepTransition::Advanced { finished, activated })
    }

    /// Activate the earliest due pending step for the recipient if nothing is
    /// active. Steps whose message already reached a terminal state are
    /// settled on the spot and the next one is tried.
    pub async fn advance(
        &self,
        sequence_id: i64,
        recipient_address: &str,
    ) -> StoreResult<Option<SequenceContact>> {
        let mut remaining = self
            .store
            .recipient_contacts(sequence_id, recipient_address)
            .await?
            .len();

        while remaining > 0 {
            remaining -= 1;

            let Some(active) = self
                .store
                .activate_next_contact(
                    sequence_id,
                    recipient_address,
                    self.clock.local_now(),
                    self.clock.now(),
                )
                .await?
            else {
                return Ok(None);
            };

            let settled = self
                .store
                .step_message(active.sequence_step_id, recipient_address)
                .await?
                .and_then(|message| contact_status_for(message.status));

            match settled {
                Some(status) => {
                    tracing::debug!(
                        "Step {} for {} already resolved, settling it as {}",
                        active.current_step,
                        recipient_address,
                        status
                    );
                    self.store
                        .finish_active_contact(active.id, status, self.clock.now())
                        .await?;
                }
                None => {
                    tracing::debug!(
                        "Activated step {} of sequence {} for {}",
                        active.current_step,
                        sequence_id,
                        recipient_address
                    );
                    return Ok(Some(active));
                }
            }
        }
        Ok(None)
    }

    /// React to a sequence message reaching a terminal state.
    pub async fn on_message_resolved(&self, message: &BroadcastMessage) -> StoreResult<StepTransition> {
        let MessageTarget::SequenceStep {
            sequence_id,
            sequence_step_id,
        } = message.target
        else {
            return Ok(StepTransition::NoOp);
        };
        let Some(status) = contact_status_for(message.status) else {
            return Ok(StepTransition::NoOp);
        };

        let Some(contact) = self
            .store
            .find_contact(sequence_id, &message.recipient_address, sequence_step_id)
            .await?
        else {
            tracing::warn!(
                "No sequence contact for message {} (sequence {}, step {})",
                message.id,
                sequence_id,
                sequence_step_id
            );
            return Ok(StepTransition::NoOp);
        };

        match contact.status {
            ContactStatus::Active => match status {
                ContactStatus::Failed => {
                    let reason = message
                        .error_message
                        .as_deref()
                        .unwrap_or_else(|| message.status.as_str());
                    self.fail_step(contact.id, reason).await
                }
                _ => self.complete_step(contact.id).await,
            },
            ContactStatus::Pending => {
                // Sent before the ledger caught up; let activation settle it.
                let activated = self.advance(sequence_id, &message.recipient_address).await?;
                match self.store.get_contact(contact.id).await? {
                    Some(current) if current.status == ContactStatus::Active => {
                        self.finish(current.id, status).await
                    }
                    Some(current)
                        if matches!(current.status, ContactStatus::Completed | ContactStatus::Failed) =>
                    {
                        Ok(StepTransition::Advanced {
                            finished: current,
                            activated,
                        })
                    }
                    _ => Ok(StepTransition::NoOp),
                }
            }
            ContactStatus::Completed | ContactStatus::Failed => Ok(StepTransition::NoOp),
        }
    }

    /// Periodic sweep. First settles active steps whose message resolved
    /// without the ledger following (a store error at resolution time), then
    /// activates due steps for recipients with nothing active. Returns the
    /// number of steps activated.
    pub async fn activate_due(&self, limit: usize) -> StoreResult<usize> {
        let mut activated = 0;
        for contact in self.store.settled_active_contacts(limit).await? {
            let Some(status) = self
                .store
                .step_message(contact.sequence_step_id, &contact.recipient_address)
                .await?
                .and_then(|message| contact_status_for(message.status))
            else {
                continue;
            };
            tracing::info!(
                "Catching up step {} of sequence {} for {} as {}",
                contact.current_step,
                contact.sequence_id,
                contact.recipient_address,
                status
            );
            if let StepTransition::Advanced {
                activated: Some(_), ..
            } = self.finish(contact.id, status).await?
            {
                activated += 1;
            }
        }

        let waiting = self
            .store
            .recipients_awaiting_activation(self.clock.local_now(), limit)
            .await?;
        for (sequence_id, recipient_address) in waiting {
            if self.advance(sequence_id, &recipient_address).await?.is_some() {
                activated += 1;
            }
        }
        Ok(activated)
    }
}
