use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use quarry::Clock;

/// Programmable clock: tests set or advance `now` explicitly.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Clock starting at the given instant.
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// The current instant.
    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    /// Set the current instant.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    /// Advance the current instant.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // an arbitrary fixed instant well past the epoch
        Self::starting_at(DateTime::<Utc>::from_timestamp(1_735_689_600, 0).expect("valid"))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
