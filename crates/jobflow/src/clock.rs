//! Time source abstraction
//!
//! Due dates and lease expiries are compared against a `Clock` rather than
//! `Utc::now()` directly so tests can advance time without sleeping.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

/// Source of the current instant
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests
///
/// Starts at the instant it was created and only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = add_duration(*now, by);
    }

    /// Jump to a specific instant
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Add a std `Duration` to an instant, saturating instead of panicking
/// on out-of-range values.
pub fn add_duration(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    // A duration too large for TimeDelta is far past any representable
    // instant, so it saturates the same way an overflowing add does.
    let Ok(delta) = TimeDelta::from_std(d) else {
        return DateTime::<Utc>::MAX_UTC;
    };
    t.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
