//! Time-window arithmetic for the broadcast queue.
//!
//! `scheduled_at` and `next_trigger_time` are stored in the scheduling frame:
//! UTC shifted by a fixed, configured offset. Wall-clock stamps
//! (`processing_started_at`, `sent_at`, `completed_at`) stay in plain UTC.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SchedulingConfig;

#[derive(Debug, Clone, Copy)]
pub struct SchedulingClock {
    local_offset: Duration,
    frozen_at: Option<DateTime<Utc>>,
}

impl SchedulingClock {
    pub fn new(local_offset: Duration) -> Self {
        Self {
            local_offset,
            frozen_at: None,
        }
    }

    pub fn from_config(config: &SchedulingConfig) -> Self {
        Self::new(Duration::hours(config.local_offset_hours))
    }

    /// A clock whose wall time never moves. Used by tests.
    pub fn frozen(now: DateTime<Utc>, local_offset: Duration) -> Self {
        Self {
            local_offset,
            frozen_at: Some(now),
        }
    }

    pub fn local_offset(&self) -> Duration {
        self.local_offset
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.frozen_at.unwrap_or_else(Utc::now)
    }

    pub fn local_now(&self) -> DateTime<Utc> {
        self.to_local(self.now())
    }

    pub fn to_local(&self, wall: DateTime<Utc>) -> DateTime<Utc> {
        wall + self.local_offset
    }

    pub fn claim_window(&self, horizon: Duration, grace: Duration) -> ClaimWindow {
        let local_now = self.local_now();
        ClaimWindow {
            earliest: local_now - grace,
            latest: local_now + horizon,
        }
    }

    pub fn claim_window_for(&self, config: &SchedulingConfig) -> ClaimWindow {
        self.claim_window(
            Duration::seconds(config.claim_horizon_secs),
            Duration::seconds(config.claim_grace_window_secs),
        )
    }
}

/// Inclusive `[earliest, latest]` range of claimable `scheduled_at` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimWindow {
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
}

impl ClaimWindow {
    pub fn contains(&self, scheduled_at: DateTime<Utc>) -> bool {
        scheduled_at >= self.earliest && scheduled_at <= self.latest
    }

    pub fn is_stale(&self, scheduled_at: DateTime<Utc>) -> bool {
        scheduled_at < self.earliest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn clock() -> SchedulingClock {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 4, 0, 0).unwrap();
        SchedulingClock::frozen(now, Duration::hours(8))
    }

    #[test]
    fn local_now_applies_the_offset_once() {
        let clock = clock();
        assert_eq!(clock.local_now() - clock.now(), Duration::hours(8));
    }

    #[test]
    fn window_edges_are_inclusive() {
        let clock = clock();
        let horizon = Duration::minutes(5);
        let grace = Duration::minutes(10);
        let window = clock.claim_window(horizon, grace);
        let local_now = clock.local_now();

        assert!(window.contains(local_now));
        assert!(window.contains(local_now + horizon));
        assert!(window.contains(local_now - grace));
        assert!(!window.contains(local_now + horizon + Duration::seconds(1)));
        assert!(!window.contains(local_now - grace - Duration::seconds(1)));
        assert!(window.is_stale(local_now - grace - Duration::seconds(1)));
        assert!(!window.is_stale(local_now + horizon + Duration::seconds(1)));
    }

    #[test]
    fn config_window_uses_configured_seconds() {
        let clock = clock();
        let config = SchedulingConfig {
            claim_horizon_secs: 30,
            claim_grace_window_secs: 90,
            ..SchedulingConfig::default()
        };
        let window = clock.claim_window_for(&config);
        assert_eq!(window.latest - clock.local_now(), Duration::seconds(30));
        assert_eq!(clock.local_now() - window.earliest, Duration::seconds(90));
    }
}
