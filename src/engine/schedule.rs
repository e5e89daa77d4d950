use chrono::NaiveDateTime;
use serde::Serialize;
use std::time::Duration;

use crate::core::config::TimingConfig;

/// Release window, computed once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduleWindow {
    /// `None` polls immediately.
    pub target: Option<NaiveDateTime>,
    /// Start of the fine phase.
    pub pre_window: NaiveDateTime,
    /// The fine phase gives up here.
    pub end: NaiveDateTime,
}

fn delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}

impl ScheduleWindow {
    pub fn compute(
        now: NaiveDateTime,
        target: Option<NaiveDateTime>,
        lead: Duration,
        trailing: Duration,
        horizon: Duration,
    ) -> Self {
        match target {
            Some(t) => Self {
                target: Some(t),
                pre_window: t - delta(lead),
                end: t + delta(trailing),
            },
            None => Self {
                target: None,
                pre_window: now,
                end: now + delta(horizon),
            },
        }
    }

    pub fn from_timing(now: NaiveDateTime, target: Option<NaiveDateTime>, timing: &TimingConfig) -> Self {
        Self::compute(
            now,
            target,
            timing.pre_window_lead(),
            timing.trailing_window(),
            timing.no_target_horizon(),
        )
    }

    /// Whether the coarse wait is needed at all.
    pub fn needs_coarse_wait(&self, now: NaiveDateTime) -> bool {
        now < self.pre_window
    }

    pub fn until_pre_window(&self, now: NaiveDateTime) -> Duration {
        until(now, self.pre_window)
    }

    pub fn until_end(&self, now: NaiveDateTime) -> Duration {
        until(now, self.end)
    }

    pub fn until_target(&self, now: NaiveDateTime) -> Option<Duration> {
        self.target.map(|t| until(now, t))
    }

    /// Target passed. Direct apply probing starts here.
    pub fn target_reached(&self, now: NaiveDateTime) -> bool {
        self.target.map(|t| now >= t).unwrap_or(false)
    }

    pub fn expired(&self, now: NaiveDateTime) -> bool {
        now >= self.end
    }
}

/// Non-negative `to - from`.
pub fn until(from: NaiveDateTime, to: NaiveDateTime) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, 19)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn window_around_target() {
        let w = ScheduleWindow::from_timing(at(9, 40, 0), Some(at(10, 0, 0)), &TimingConfig::default());
        assert_eq!(w.pre_window, at(9, 55, 0));
        assert_eq!(w.end, at(10, 5, 0));
        assert!(w.needs_coarse_wait(at(9, 40, 0)));
        assert!(!w.needs_coarse_wait(at(9, 55, 0)));
        assert_eq!(w.until_pre_window(at(9, 40, 0)), Duration::from_secs(900));
        assert!(!w.target_reached(at(9, 59, 59)));
        assert!(w.target_reached(at(10, 0, 0)));
        assert!(w.expired(at(10, 5, 0)));
    }

    #[test]
    fn window_without_target_polls_immediately() {
        let now = at(13, 0, 0);
        let w = ScheduleWindow::from_timing(now, None, &TimingConfig::default());
        assert_eq!(w.pre_window, now);
        assert_eq!(w.end, at(13, 30, 0));
        assert!(!w.needs_coarse_wait(now));
        assert!(!w.target_reached(at(13, 10, 0)));
    }

    #[test]
    fn until_saturates_at_zero() {
        assert_eq!(until(at(10, 0, 1), at(10, 0, 0)), Duration::ZERO);
    }
}
