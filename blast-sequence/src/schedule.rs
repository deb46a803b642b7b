//! Pre-computes when every step of an enrollment fires.
//!
//! Step `i` fires `trigger_delay_hours` of step `i - 1` after step `i - 1`,
//! plus a jitter drawn from the step's `[min, max]` delay seconds. Fire
//! times are strictly increasing: a collision is pushed one second past the
//! previous step so claim order always matches step order.

use blast_core::types::{SequencePlan, SequenceStep};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;

#[derive(Debug, Clone)]
pub struct ScheduledStep {
    pub sequence_id: i64,
    pub account_id: String,
    pub step: SequenceStep,
    pub fire_at: DateTime<Utc>,
    pub min_delay_seconds: i32,
    pub max_delay_seconds: i32,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    steps: Vec<ScheduledStep>,
    cursor: DateTime<Utc>,
}

impl Schedule {
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            steps: Vec::new(),
            cursor: start,
        }
    }

    /// Append `plan.steps[from..]` after whatever is already scheduled.
    pub fn extend<R: Rng + ?Sized>(&mut self, plan: &SequencePlan, from: usize, rng: &mut R) {
        for step in plan.steps.iter().skip(from) {
            let (min, max) = plan.delay_bounds(step);
            let jitter = if max > min { rng.gen_range(min..=max) } else { min };

            let mut fire_at = self.cursor + Duration::seconds(i64::from(jitter));
            if let Some(previous) = self.steps.last() {
                if fire_at <= previous.fire_at {
                    fire_at = previous.fire_at + Duration::seconds(1);
                }
            }

            self.cursor = fire_at + Duration::hours(i64::from(step.trigger_delay_hours.max(0)));
            self.steps.push(ScheduledStep {
                sequence_id: plan.sequence.id,
                account_id: plan.sequence.account_id.clone(),
                step: step.clone(),
                fire_at,
                min_delay_seconds: min,
                max_delay_seconds: max,
            });
        }
    }

    pub fn steps(&self) -> &[ScheduledStep] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<ScheduledStep> {
        self.steps
    }
}

/// Schedule one sequence from step index `from`, starting at `start`.
pub fn plan_sequence<R: Rng + ?Sized>(
    plan: &SequencePlan,
    from: usize,
    start: DateTime<Utc>,
    rng: &mut R,
) -> Vec<ScheduledStep> {
    let mut schedule = Schedule::starting_at(start);
    schedule.extend(plan, from, rng);
    schedule.into_steps()
}
