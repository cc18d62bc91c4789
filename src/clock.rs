//! Abstract wall clock and rounding policy (spec.md §4.H).

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};

/// Abstract source of the current time, so tests can be deterministic.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that returns a fixed, externally-advanceable instant. Used by
/// tests that need deterministic `issued_at`/`expires_at` values and by
/// tests of the cleanup actor that want to fast-forward past a deadline
/// without sleeping in real time.
#[derive(Debug, Clone)]
pub struct TestClock(std::sync::Arc<std::sync::Mutex<DateTime<Utc>>>);

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> TestClock {
        TestClock(std::sync::Arc::new(std::sync::Mutex::new(start)))
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.0.lock().unwrap();
        *guard += chrono::Duration::from_std(by).unwrap_or_default();
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

/// Rounding policy applied to issue times, refresh times, and timeouts so
/// that textual `Timeout` serialization and expiry comparisons are stable
/// (spec.md §4.H). Default is one-second rounding.
#[derive(Debug, Clone, Copy)]
pub struct RoundingPolicy {
    granularity_secs: i64,
}

impl Default for RoundingPolicy {
    fn default() -> RoundingPolicy {
        RoundingPolicy { granularity_secs: 1 }
    }
}

impl RoundingPolicy {
    pub fn with_granularity_secs(secs: i64) -> RoundingPolicy {
        RoundingPolicy { granularity_secs: secs.max(1) }
    }

    pub fn round_instant(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        if self.granularity_secs <= 1 {
            t.trunc_subsecs(0)
        } else {
            let secs = t.timestamp();
            let rounded = (secs / self.granularity_secs) * self.granularity_secs;
            DateTime::from_timestamp(rounded, 0).unwrap_or(t)
        }
    }

    pub fn round_timeout(&self, d: Duration) -> Duration {
        let secs = d.as_secs().max(1);
        if self.granularity_secs <= 1 {
            Duration::from_secs(secs)
        } else {
            let g = self.granularity_secs as u64;
            Duration::from_secs(((secs + g - 1) / g) * g)
        }
    }
}
