//! # Monotonic Time Primitives
//!
//! All timing in the crate is expressed against a monotonic clock: absolute
//! nanosecond timestamps ([`AbsTime`]) that never go backwards and are never
//! compared against wall-clock time. Timeouts are expiration comparisons,
//! never busy loops.
//!
//! ## Types
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`AbsTime`] | Absolute monotonic time in nanoseconds |
//! | [`TimeBucket`] | Minute-wide quantization of `AbsTime`, indexes ticket queues |
//! | [`TimeSource`] | Clock abstraction, injected into every stateful component |
//! | [`MonotonicClock`] | Production clock (process-origin `Instant`) |
//! | [`ManualClock`] | Hand-driven clock for tests and simulation |

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Width of one ticket time bucket (one minute).
pub const TIME_BUCKET_LEN: Duration = Duration::from_secs(60);

/// Absolute monotonic time in nanoseconds since an arbitrary origin.
///
/// The origin is process-local; `AbsTime` values are only meaningful relative
/// to other values from the same [`TimeSource`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AbsTime(u64);

impl AbsTime {
    pub const ZERO: AbsTime = AbsTime(0);

    pub fn from_nanos(nanos: u64) -> Self {
        AbsTime(nanos)
    }

    pub fn as_nanos(self) -> u64 {
        self.0
    }

    /// Whole seconds since the clock origin, truncated to 32 bits the way the
    /// wire protocol carries registration timestamps.
    pub fn as_secs_u32(self) -> u32 {
        (self.0 / NANOS_PER_SEC) as u32
    }

    /// The time bucket this instant falls into.
    pub fn bucket(self) -> TimeBucket {
        TimeBucket(self.0 / TIME_BUCKET_LEN.as_nanos() as u64)
    }

    /// Nanoseconds from `earlier` to `self`, zero if `earlier` is in the future.
    pub fn saturating_since(self, earlier: AbsTime) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Signed nanoseconds from `now` until `self`. Negative when `self` has
    /// already passed.
    pub fn nanos_until(self, now: AbsTime) -> i64 {
        self.0 as i64 - now.0 as i64
    }
}

impl std::ops::Add<Duration> for AbsTime {
    type Output = AbsTime;

    fn add(self, rhs: Duration) -> AbsTime {
        AbsTime(self.0 + rhs.as_nanos() as u64)
    }
}

/// Minute-wide quantization of monotonic time.
///
/// Bucket indices are monotone in `AbsTime`: for any two instants
/// `a <= b`, `a.bucket() <= b.bucket()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeBucket(pub u64);

impl TimeBucket {
    pub fn next(self) -> TimeBucket {
        TimeBucket(self.0 + 1)
    }
}

impl std::ops::Add<u64> for TimeBucket {
    type Output = TimeBucket;

    fn add(self, rhs: u64) -> TimeBucket {
        TimeBucket(self.0 + rhs)
    }
}

/// Source of monotonic timestamps.
///
/// Every stateful component takes a shared [`Clock`] at construction instead
/// of reading the system clock, so tests drive time by hand.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> AbsTime;
}

pub type Clock = Arc<dyn TimeSource>;

/// Production clock: nanoseconds elapsed since the clock was created.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now(&self) -> AbsTime {
        AbsTime(self.origin.elapsed().as_nanos() as u64)
    }
}

/// Hand-driven clock for tests and simulation. Starts at a configurable
/// offset and only moves when advanced.
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new(start: AbsTime) -> Self {
        ManualClock { nanos: AtomicU64::new(start.as_nanos()) }
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: AbsTime) {
        self.nanos.store(to.as_nanos(), Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> AbsTime {
        AbsTime(self.nanos.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_are_monotone_in_time() {
        let a = AbsTime::from_nanos(59 * NANOS_PER_SEC);
        let b = AbsTime::from_nanos(60 * NANOS_PER_SEC);
        let c = AbsTime::from_nanos(119 * NANOS_PER_SEC);
        assert_eq!(a.bucket(), TimeBucket(0));
        assert_eq!(b.bucket(), TimeBucket(1));
        assert_eq!(c.bucket(), TimeBucket(1));
        assert!(a.bucket() <= b.bucket() && b.bucket() <= c.bucket());
    }

    #[test]
    fn manual_clock_advances_by_hand() {
        let clock = ManualClock::new(AbsTime::ZERO);
        assert_eq!(clock.now(), AbsTime::ZERO);
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now().as_secs_u32(), 5);
    }

    #[test]
    fn monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn nanos_until_is_signed() {
        let now = AbsTime::from_nanos(100);
        assert_eq!(AbsTime::from_nanos(150).nanos_until(now), 50);
        assert_eq!(AbsTime::from_nanos(40).nanos_until(now), -60);
    }
}
