use chrono::{NaiveDateTime, Timelike};
use std::sync::{Mutex, PoisonError};

/// Source of "now" for check-in stamping, at second precision.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        truncate(chrono::Local::now().naive_local())
    }
}

/// A clock that only moves when told to. Used for replays and tests.
#[derive(Debug)]
pub struct ManualClock(Mutex<NaiveDateTime>);

impl ManualClock {
    pub fn new(at: NaiveDateTime) -> Self {
        Self(Mutex::new(truncate(at)))
    }

    pub fn set(&self, at: NaiveDateTime) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = truncate(at);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn truncate(at: NaiveDateTime) -> NaiveDateTime {
    at.with_nanosecond(0).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_manual_clock_drops_subseconds() {
        let at = NaiveDate::from_ymd_opt(2024, 1, 10)
            .unwrap()
            .and_hms_milli_opt(9, 5, 0, 750)
            .unwrap();
        let clock = ManualClock::new(at);
        assert_eq!(clock.now().time().to_string(), "09:05:00");
    }

    #[test]
    fn test_system_clock_whole_seconds() {
        assert_eq!(SystemClock.now().nanosecond(), 0);
    }
}
