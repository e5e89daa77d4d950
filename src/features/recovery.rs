//! Backoff and restart bookkeeping.
//!
//! Rate-limit sleeps double from a base up to a ceiling and drop back to the
//! base after one clean tick. Session restarts are counted separately by the
//! runner and only reset after a full successful cycle.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;
use tracing::{info, warn};

use crate::core::config::BackoffConfig;

/// Consecutive rate-limit counter plus the exponential schedule that sizes
/// each sleep. No jitter and no elapsed-time cap: the window end bounds it.
#[derive(Debug)]
pub struct BackoffState {
    schedule: ExponentialBackoff,
    ceiling: Duration,
    consecutive: u32,
}

impl BackoffState {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        let schedule = ExponentialBackoffBuilder::new()
            .with_initial_interval(base.min(ceiling))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(ceiling)
            .with_max_elapsed_time(None)
            .build();
        Self {
            schedule,
            ceiling,
            consecutive: 0,
        }
    }

    pub fn from_config(cfg: &BackoffConfig) -> Self {
        Self::new(cfg.base(), cfg.ceiling())
    }

    /// Record a rate-limit signal and return how long to sleep for it.
    pub fn on_rate_limited(&mut self) -> Duration {
        let wait = self
            .schedule
            .next_backoff()
            .unwrap_or(self.ceiling)
            .min(self.ceiling);
        self.consecutive = self.consecutive.saturating_add(1);
        warn!(
            "recovery: rate limited ({} in a row), backing off {}s",
            self.consecutive,
            wait.as_secs_f64()
        );
        wait
    }

    /// A tick finished without any negative signal.
    pub fn on_clean_tick(&mut self) {
        if self.consecutive > 0 {
            info!(
                "recovery: clean tick, backoff reset to {}s",
                self.schedule.initial_interval.as_secs()
            );
        }
        self.schedule.reset();
        self.consecutive = 0;
    }

    /// The sleep the next rate-limit signal will get.
    pub fn current(&self) -> Duration {
        self.schedule.current_interval
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Bounded session restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartBudget {
    max: u32,
    used: u32,
}

impl RestartBudget {
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    /// Spend one restart. `false` once the budget is gone.
    pub fn try_restart(&mut self) -> bool {
        if self.used >= self.max {
            return false;
        }
        self.used += 1;
        true
    }

    /// Only a full successful cycle gives the budget back.
    pub fn reset(&mut self) {
        self.used = 0;
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}
