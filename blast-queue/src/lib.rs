pub mod claim;
pub mod guard;
pub mod stale;

pub use claim::{new_worker_id, ClaimProtocol, DeliveryOutcome};
pub use guard::{DuplicateGuard, EnqueueError, EnqueueOutcome, EnqueueSummary};
pub use stale::{StaleMonitor, StaleReport};
