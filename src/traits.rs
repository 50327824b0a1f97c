//! Injectable time source for forecasts that follow the hour of day.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Hour of day in UTC; the phase of every diurnal pattern.
    fn hour_utc(&self) -> u32 {
        self.now().hour()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Pinned instant shared between clones, so a test can move time under a
/// predictor that already holds the clock.
#[derive(Debug, Clone)]
pub struct MockClock(Arc<Mutex<DateTime<Utc>>>);

impl MockClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(Arc::new(Mutex::new(at)))
    }

    /// Midnight of 2024-01-01 plus `hour` hours.
    pub fn at_hour(hour: u32) -> Self {
        let midnight = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default();
        Self::new(midnight + Duration::hours(i64::from(hour)))
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance_hours(&self, hours: i64) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) += Duration::hours(hours);
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_hour_and_advance_wrap_the_day() {
        let clock = MockClock::at_hour(22);
        assert_eq!(clock.hour_utc(), 22);
        clock.advance_hours(3);
        assert_eq!(clock.hour_utc(), 1);
    }

    #[test]
    fn test_set_is_visible_through_clones() {
        let clock = MockClock::at_hour(0);
        let shared = clock.clone();
        clock.set(Utc.with_ymd_and_hms(2024, 6, 17, 15, 30, 0).unwrap());
        assert_eq!(shared.hour_utc(), 15);
    }

    #[test]
    fn test_system_clock_tracks_wall_time() {
        assert!((Utc::now() - SystemClock.now()).num_seconds().abs() < 5);
    }
}
