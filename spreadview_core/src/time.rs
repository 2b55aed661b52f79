//! Time points and the process time unit.
//!
//! The filter treats time as an opaque, totally ordered value. All it needs
//! is the elapsed wall time between two points, which [`TimeUnit`] turns into
//! the unit the process rates are quoted in.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Seconds in one day, the default process time unit.
pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// An instant the filter can be advanced to.
pub trait TimePoint: Copy + PartialOrd + Debug + Send + Sync + 'static {
    /// Elapsed seconds from `earlier` to `self` (negative if `self` is earlier).
    fn seconds_since(&self, earlier: &Self) -> f64;
}

impl TimePoint for f64 {
    fn seconds_since(&self, earlier: &Self) -> f64 {
        self - earlier
    }
}

impl TimePoint for i64 {
    fn seconds_since(&self, earlier: &Self) -> f64 {
        (*self as i128 - *earlier as i128) as f64
    }
}

fn chrono_seconds(delta: chrono::Duration) -> f64 {
    match delta.num_microseconds() {
        Some(us) => us as f64 * 1e-6,
        None => delta.num_milliseconds() as f64 * 1e-3,
    }
}

impl TimePoint for NaiveDateTime {
    fn seconds_since(&self, earlier: &Self) -> f64 {
        chrono_seconds(*self - *earlier)
    }
}

impl TimePoint for DateTime<Utc> {
    fn seconds_since(&self, earlier: &Self) -> f64 {
        chrono_seconds(*self - *earlier)
    }
}

/// Length of one process time unit, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeUnit {
    pub seconds: f64,
}

impl TimeUnit {
    /// One day per unit.
    pub const DAY: TimeUnit = TimeUnit { seconds: SECONDS_PER_DAY };

    /// One second per unit (raw elapsed seconds).
    pub const SECOND: TimeUnit = TimeUnit { seconds: 1.0 };

    /// A custom unit; e.g. `TimeUnit::new(365.25 * SECONDS_PER_DAY)` for years.
    pub fn new(seconds: f64) -> Self {
        Self { seconds }
    }

    /// Elapsed time from `from` to `to`, in this unit.
    pub fn elapsed<T: TimePoint>(&self, from: &T, to: &T) -> f64 {
        to.seconds_since(from) / self.seconds
    }
}

impl Default for TimeUnit {
    fn default() -> Self {
        Self::DAY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    #[test]
    fn test_one_hour_is_one_twenty_fourth_day() {
        let t0 = NaiveDate::from_ymd_opt(2017, 5, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let t1 = t0 + chrono::Duration::hours(1);
        assert_relative_eq!(TimeUnit::DAY.elapsed(&t0, &t1), 1.0 / 24.0, epsilon = 1e-15);
    }

    #[test]
    fn test_plain_seconds() {
        assert_eq!(TimeUnit::SECOND.elapsed(&10.0, &12.5), 2.5);
        assert_eq!(TimeUnit::SECOND.elapsed(&10_i64, &7_i64), -3.0);
    }

    #[test]
    fn test_extreme_integer_span_does_not_wrap() {
        let span = TimeUnit::SECOND.elapsed(&i64::MIN, &i64::MAX);
        assert_relative_eq!(span, 2.0 * i64::MAX as f64, max_relative = 1e-12);
        assert!(TimeUnit::SECOND.elapsed(&i64::MAX, &i64::MIN) < 0.0);
    }
}
