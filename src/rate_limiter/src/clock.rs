// SPDX-License-Identifier: Apache-2.0

//! Converts wall-clock time into a monotonically increasing tick index.
//!
//! A tick is the quantum of time the token buckets use for refill
//! accounting; its length is configured per [`crate::BucketConfig`] via
//! [`TimeSpec`].

use std::time::Duration;

/// A point in time expressed the way the surrounding event loop reports it:
/// seconds plus a microsecond remainder. Kept separate from
/// [`std::time::Instant`] so that a test harness (or a caller with its own
/// cached `gettimeofday`-style clock) can hand in values without depending
/// on wall-clock `Instant::now()`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeSpec {
    /// Whole seconds.
    pub sec: u64,
    /// Microseconds in `[0, 1_000_000)`.
    pub usec: u64,
}

impl TimeSpec {
    /// Builds a [`TimeSpec`] from a [`Duration`].
    #[must_use]
    pub fn from_duration(d: Duration) -> Self {
        TimeSpec {
            sec: d.as_secs(),
            usec: u64::from(d.subsec_micros()),
        }
    }

    /// Total milliseconds represented by this timespec, as used by
    /// [`tick_for`]. Truncates towards zero, matching the C source's
    /// `msec = tv_sec * 1000 + tv_usec / 1000`.
    #[must_use]
    pub fn as_millis(self) -> u64 {
        self.sec.saturating_mul(1000) + self.usec / 1000
    }

    /// Converts to a [`Duration`], used when handing a delay back to a
    /// caller's timer service.
    #[must_use]
    pub fn to_duration(self) -> Duration {
        Duration::from_secs(self.sec) + Duration::from_micros(self.usec)
    }
}

impl From<Duration> for TimeSpec {
    fn from(d: Duration) -> Self {
        TimeSpec::from_duration(d)
    }
}

/// A monotonic time source. The core never calls `Instant::now()` directly
/// so that it stays independent of the surrounding event loop's notion of
/// "now" (which is usually cached once per loop iteration, not read fresh
/// on every call).
pub trait Clock {
    /// Returns the current time. Must be monotonic: callers rely on
    /// [`tick_for`] never decreasing as long as successive `now()` calls
    /// don't decrease.
    fn now(&self) -> TimeSpec;
}

/// A [`Clock`] backed by [`std::time::Instant`], anchored at construction
/// time so that `TimeSpec` values stay small.
#[derive(Debug)]
pub struct SystemClock {
    epoch: std::time::Instant,
}

impl SystemClock {
    /// Creates a new clock anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        SystemClock {
            epoch: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> TimeSpec {
        TimeSpec::from_duration(self.epoch.elapsed())
    }
}

/// A 32-bit tick index. Overflow is well-defined: tick arithmetic always
/// goes through [`Tick::ticks_since`], which wraps, so this type is correct
/// as long as true elapsed ticks never exceed `i32::MAX`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tick(pub u32);

impl Tick {
    /// Number of ticks elapsed since `earlier`, via wrapping subtraction.
    /// A clock regression (or no progress) is detected by the caller
    /// inspecting the result, not by this function, which cannot
    /// distinguish "just wrapped" from "went backwards".
    #[must_use]
    pub fn ticks_since(self, earlier: Tick) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }
}

/// Computes the tick index for `time` given the tick length encoded in
/// `msec_per_tick`. Purely functional; monotonic non-decreasing as long as
/// `time` is monotonic.
#[tracing::instrument(level = "trace", ret)]
#[must_use]
pub fn tick_for(time: TimeSpec, msec_per_tick: u32) -> Tick {
    let msec = time.as_millis();
    #[allow(clippy::cast_possible_truncation)]
    let tick = (msec / u64::from(msec_per_tick)) as u32;
    Tick(tick)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_for_is_monotonic_non_decreasing() {
        let mut last = Tick(0);
        for ms in [0u64, 1, 999, 1000, 1001, 5000, 5999, 6000] {
            let t = tick_for(
                TimeSpec {
                    sec: ms / 1000,
                    usec: (ms % 1000) * 1000,
                },
                1000,
            );
            assert!(t >= last);
            last = t;
        }
    }

    #[test]
    fn tick_for_truncates() {
        let t = tick_for(TimeSpec { sec: 2, usec: 999_000 }, 1000);
        assert_eq!(t, Tick(2));
    }

    #[test]
    fn ticks_since_wraps_around() {
        let a = Tick(u32::MAX);
        let b = Tick(1);
        assert_eq!(b.ticks_since(a), 2);
    }

    #[test]
    fn ticks_since_zero_when_equal() {
        let a = Tick(42);
        assert_eq!(a.ticks_since(a), 0);
    }
}
