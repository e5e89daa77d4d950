//! The one place that turns "time remaining" into "how long to sleep".

use rand::prelude::*;
use std::time::Duration;

/// Floor for the coarse sleep so a refresh that is already due never spins.
pub const MIN_COARSE_SLEEP: Duration = Duration::from_millis(50);

/// Sleep step for the coarse wait, tightening as the deadline nears:
/// more than 5 min left → 60 s, more than 1 min → 10 s, more than 10 s → 2 s,
/// otherwise 250 ms.
pub fn coarse_step(remaining: Duration) -> Duration {
    let secs = remaining.as_secs_f64();
    if secs > 300.0 {
        Duration::from_secs(60)
    } else if secs > 60.0 {
        Duration::from_secs(10)
    } else if secs > 10.0 {
        Duration::from_secs(2)
    } else {
        Duration::from_millis(250)
    }
}

/// Next coarse sleep: the tier step, never past the deadline, and waking in
/// time for the next keep-warm refresh.
pub fn coarse_sleep(remaining: Duration, until_refresh: Duration) -> Duration {
    coarse_step(remaining)
        .min(remaining)
        .min(until_refresh.max(MIN_COARSE_SLEEP))
}

/// Fine-phase interval `base + unit * jitter`, with `unit` in `[-1, 1]`.
pub fn fine_interval(base: Duration, jitter: Duration, unit: f64) -> Duration {
    let unit = unit.clamp(-1.0, 1.0);
    let ms = base.as_secs_f64() * 1000.0 + unit * jitter.as_secs_f64() * 1000.0;
    Duration::from_millis(ms.max(0.0).round() as u64)
}

/// [`fine_interval`] with a uniformly drawn `unit`.
pub fn sample_fine_interval(base: Duration, jitter: Duration) -> Duration {
    let mut rng = rand::rng();
    fine_interval(base, jitter, rng.random_range(-1.0..=1.0))
}

/// `1h 2m 3s`, `4m 5s`, `6s`.
pub fn fmt_remaining(d: Duration) -> String {
    let total = d.as_secs();
    let (h, rem) = (total / 3600, total % 3600);
    let (m, s) = (rem / 60, rem % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
