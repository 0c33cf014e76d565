//! Clock abstraction for scheduling and visibility timeouts.
//!
//! Everything that compares "now" against a scheduled time goes through a
//! [`Clock`], so tests can step past visibility timeouts and retry delays
//! without sleeping.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};

/// Source of wall-clock and monotonic time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for latency measurements.
    fn now(&self) -> Instant;

    /// Returns the current wall-clock time.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    ///
    /// Production maps this to `tokio::time::sleep`; the test clock advances
    /// virtual time instead.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Clock backed by the system time and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying time, so a clock handed to a queue and
/// the clock held by the test move together.
#[derive(Debug, Clone)]
pub struct TestClock {
    elapsed_ns: Arc<AtomicU64>,
    wall_ms: Arc<AtomicI64>,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a test clock starting at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            wall_ms: Arc::new(AtomicI64::new(start.timestamp_millis())),
            base_instant: Instant::now(),
        }
    }

    /// Advances both the monotonic and wall clocks.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.elapsed_ns.fetch_add(ns, Ordering::AcqRel);
        self.wall_ms.fetch_add(ms, Ordering::AcqRel);
    }

    /// Returns how far the clock has been advanced since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let ms = self.wall_ms.load(Ordering::Acquire);
        Utc.timestamp_millis_opt(ms).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_both_clocks() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = TestClock::starting_at(start);
        let instant = clock.now();

        clock.advance(Duration::from_secs(61));

        assert_eq!(clock.now().duration_since(instant), Duration::from_secs(61));
        assert_eq!(clock.now_utc(), start + chrono::Duration::seconds(61));
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::new();
        let other = clock.clone();
        let before = other.now_utc();

        clock.advance(Duration::from_secs(5));

        assert_eq!(other.now_utc() - before, chrono::Duration::seconds(5));
    }

    #[tokio::test]
    async fn sleep_advances_virtual_time() {
        let clock = TestClock::new();
        clock.sleep(Duration::from_secs(3)).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }
}
