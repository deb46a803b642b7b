pub mod availability;
pub mod dispatcher;
pub mod sender;
pub mod worker;

pub use availability::{availability_for, AlwaysAvailable, DeviceAvailability, PresenceAvailability};
pub use dispatcher::{run, Dispatcher};
pub use sender::{HttpSender, SendError, SendOutcome, Sender};
pub use worker::{BatchReport, DeviceWorker};
