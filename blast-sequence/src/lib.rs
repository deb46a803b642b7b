pub mod enrollment;
pub mod processor;
pub mod progression;
pub mod schedule;

pub use enrollment::{CycleReport, EnrollmentError, EnrollmentProcessor};
pub use progression::{ProgressionEngine, StepTransition};
pub use schedule::{plan_sequence, Schedule, ScheduledStep};
