//! An injectable clock, so the scheduler's backoff and the message
//! lifecycle's expiry checks can be driven deterministically in tests
//! rather than sleeping real wall-clock time.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_unix(&self) -> i64 {
        self.now().timestamp()
    }
}

/// The real clock, used outside of tests.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock the test harness moves forward explicitly, for exercising
/// backoff schedules and message expiry without waiting in real time.
#[derive(Clone)]
pub struct TestClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    pub fn at(start: DateTime<Utc>) -> Self {
        TestClock {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Convenience constructor from a unix timestamp, for tests that don't
    /// care about a specific calendar date.
    pub fn new(unix_timestamp: i64) -> Self {
        Self::at(DateTime::from_timestamp(unix_timestamp, 0).expect("timestamp in range"))
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut guard = self.current.lock().expect("test clock lock poisoned");
        *guard += duration;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut guard = self.current.lock().expect("test clock lock poisoned");
        *guard = at;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().expect("test clock lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_deterministically() {
        let start = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = TestClock::at(start);
        assert_eq!(clock.now(), start);
        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(60));
    }
}
