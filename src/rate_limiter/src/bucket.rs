// SPDX-License-Identifier: Apache-2.0

//! Token bucket arithmetic: configuration, state, and the refill/charge
//! operations applied to it.
//!
//! Mirrors `ev_token_bucket_cfg`/`ev_token_bucket` from libevent's
//! `bufferevent_ratelim.c`, generalized to cover both per-stream and
//! per-group buckets with the same code.

use crate::clock::{Tick, TimeSpec};
use crate::Error;

/// No matter how full a bucket gets, a single read/write attempt is capped
/// at this many bytes.
pub const MAX_READ_EVER: u32 = 16_384;
/// See [`MAX_READ_EVER`].
pub const MAX_WRITE_EVER: u32 = 16_384;
/// Default per-member floor on a group's computed share.
pub const DEFAULT_MIN_SHARE: u32 = 64;
/// Default tick length when a caller doesn't specify one: one second.
pub const DEFAULT_TICK_LENGTH: TimeSpec = TimeSpec { sec: 1, usec: 0 };

/// Immutable, validated bucket parameters. Shared between a stream's bucket
/// (by reference, since many streams may use the same config) and a
/// group's bucket (by value, since groups never share a config object with
/// the streams they throttle, see spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketConfig {
    read_rate: u32,
    write_rate: u32,
    read_max: u32,
    write_max: u32,
    tick_length: TimeSpec,
    msec_per_tick: u32,
}

impl BucketConfig {
    /// Validates and builds a new configuration.
    ///
    /// `tick_length` defaults to one second when `None`. Rejects
    /// `read_rate > read_burst`, `write_rate > write_burst`, a rate of `0`
    /// in either direction, or a tick length that rounds down to `0`
    /// milliseconds.
    #[tracing::instrument(level = "trace", ret)]
    pub fn new(
        read_rate: u32,
        read_burst: u32,
        write_rate: u32,
        write_burst: u32,
        tick_length: Option<TimeSpec>,
    ) -> Result<Self, Error> {
        if read_rate < 1 || write_rate < 1 {
            return Err(Error::InvalidConfig("rate must be at least 1"));
        }
        if read_rate > read_burst || write_rate > write_burst {
            return Err(Error::InvalidConfig("rate must not exceed burst"));
        }
        let tick_length = tick_length.unwrap_or(DEFAULT_TICK_LENGTH);
        let msec_per_tick = tick_length.as_millis();
        if msec_per_tick < 1 || msec_per_tick > u64::from(u32::MAX) {
            return Err(Error::InvalidConfig("tick length must be between 1ms and u32::MAX ms"));
        }
        #[allow(clippy::cast_possible_truncation)]
        let msec_per_tick = msec_per_tick as u32;

        Ok(BucketConfig {
            read_rate,
            write_rate,
            read_max: read_burst,
            write_max: write_burst,
            tick_length,
            msec_per_tick,
        })
    }

    /// Tokens added per tick for reads.
    #[must_use]
    pub fn read_rate(&self) -> u32 {
        self.read_rate
    }

    /// Tokens added per tick for writes.
    #[must_use]
    pub fn write_rate(&self) -> u32 {
        self.write_rate
    }

    /// Read bucket ceiling.
    #[must_use]
    pub fn read_max(&self) -> u32 {
        self.read_max
    }

    /// Write bucket ceiling.
    #[must_use]
    pub fn write_max(&self) -> u32 {
        self.write_max
    }

    /// The configured tick length.
    #[must_use]
    pub fn tick_length(&self) -> TimeSpec {
        self.tick_length
    }

    /// Cached milliseconds-per-tick, used by [`crate::clock::tick_for`].
    #[must_use]
    pub fn msec_per_tick(&self) -> u32 {
        self.msec_per_tick
    }

    /// Computes the tick index for `time` under this configuration.
    #[must_use]
    pub fn tick_for(&self, time: TimeSpec) -> Tick {
        crate::clock::tick_for(time, self.msec_per_tick)
    }
}

/// Mutable token-bucket state: a signed pair of counters plus the tick they
/// were last advanced to.
///
/// The counters are signed (`i64`, not the `i32` an exact C port would use)
/// so that charging more than the current balance in a single refill cycle,
/// which both spec.md and the original C source treat as ordinary,
/// expected behavior, not an error, can never itself overflow even after
/// several such charges accumulate between refills.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bucket {
    read_limit: i64,
    write_limit: i64,
    last_updated: Tick,
}

impl Bucket {
    /// Initializes a fresh bucket: both limits start at the configured
    /// rate (one tick's worth of credit, matching the original source's
    /// `ev_token_bucket_init`), and `last_updated` is set to `now`.
    #[must_use]
    pub fn new(cfg: &BucketConfig, now: Tick) -> Self {
        Bucket {
            read_limit: i64::from(cfg.read_rate),
            write_limit: i64::from(cfg.write_rate),
            last_updated: now,
        }
    }

    /// Re-initializes an in-flight bucket against a (possibly different)
    /// configuration, clipping **downward only**. An in-flight bucket has
    /// already spent some portion of its current allowance; refilling from
    /// scratch would grant an unearned burst. `last_updated` is left
    /// unchanged, the next [`Bucket::update`] call accounts for whatever
    /// ticks have elapsed since.
    #[tracing::instrument(level = "trace", ret)]
    pub fn reinitialize(&mut self, cfg: &BucketConfig) {
        self.read_limit = self.read_limit.min(i64::from(cfg.read_max));
        self.write_limit = self.write_limit.min(i64::from(cfg.write_max));
    }

    /// Advances the bucket to `now_tick`, adding `n_ticks * rate` tokens in
    /// each direction (saturating at the configured maximum), where
    /// `n_ticks = now_tick - last_updated` via wrapping subtraction.
    ///
    /// Returns `false`, mutating nothing, if no ticks have elapsed or if
    /// the apparent elapsed tick count exceeds `i32::MAX` (treated as a
    /// clock regression rather than a legitimate multi-year gap).
    #[tracing::instrument(level = "trace", ret)]
    pub fn update(&mut self, cfg: &BucketConfig, now_tick: Tick) -> bool {
        let n = now_tick.ticks_since(self.last_updated);
        if n == 0 || n > i32::MAX as u32 {
            return false;
        }
        let n = i64::from(n);

        self.read_limit = refill_one_direction(self.read_limit, i64::from(cfg.read_rate), i64::from(cfg.read_max), n);
        self.write_limit =
            refill_one_direction(self.write_limit, i64::from(cfg.write_rate), i64::from(cfg.write_max), n);
        self.last_updated = now_tick;
        true
    }

    /// Advances the bucket to `now_tick` under `cfg`, then charges `bytes`
    /// against the `dir` counter. Returns the post-charge limit so the
    /// caller can decide whether to suspend.
    pub fn advance_and_charge(
        &mut self,
        cfg: &BucketConfig,
        now_tick: Tick,
        dir: crate::suspend::Direction,
        bytes: u32,
    ) -> i64 {
        self.update(cfg, now_tick);
        self.charge(dir, bytes)
    }

    /// Charges `bytes` against the `dir` counter without advancing the
    /// bucket first. Returns the post-charge limit.
    pub fn charge(&mut self, dir: crate::suspend::Direction, bytes: u32) -> i64 {
        match dir {
            crate::suspend::Direction::Read => {
                self.read_limit -= i64::from(bytes);
                self.read_limit
            }
            crate::suspend::Direction::Write => {
                self.write_limit -= i64::from(bytes);
                self.write_limit
            }
        }
    }

    /// Current limit in the given direction. May be negative if the bucket
    /// has been overdrawn.
    #[must_use]
    pub fn limit(&self, dir: crate::suspend::Direction) -> i64 {
        match dir {
            crate::suspend::Direction::Read => self.read_limit,
            crate::suspend::Direction::Write => self.write_limit,
        }
    }

    /// Tick this bucket was last advanced to.
    #[must_use]
    pub fn last_updated(&self) -> Tick {
        self.last_updated
    }
}

/// Computes the refilled limit for one direction, avoiding the overflow
/// that a naive `limit = min(limit + n*rate, max)` could hit: if
/// `(max - limit) / n < rate` the bucket would saturate anyway, so we
/// short-circuit to `max` without ever computing `n * rate` against a
/// value that could overflow.
fn refill_one_direction(limit: i64, rate: i64, max: i64, n: i64) -> i64 {
    if (max - limit) / n < rate {
        max
    } else {
        limit + n * rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspend::Direction;

    fn cfg(rate: u32, burst: u32) -> BucketConfig {
        BucketConfig::new(rate, burst, rate, burst, Some(TimeSpec { sec: 1, usec: 0 })).unwrap()
    }

    #[test]
    fn rejects_rate_above_burst() {
        assert!(BucketConfig::new(10, 5, 10, 5, None).is_err());
    }

    #[test]
    fn rejects_zero_rate() {
        assert!(BucketConfig::new(0, 5, 1, 5, None).is_err());
    }

    #[test]
    fn fresh_bucket_starts_at_rate_not_max() {
        let c = cfg(1000, 2000);
        let b = Bucket::new(&c, Tick(0));
        assert_eq!(b.limit(Direction::Read), 1000);
        assert_eq!(b.limit(Direction::Write), 1000);
    }

    #[test]
    fn update_zero_ticks_is_noop() {
        let c = cfg(1000, 2000);
        let mut b = Bucket::new(&c, Tick(5));
        let before = b;
        assert!(!b.update(&c, Tick(5)));
        assert_eq!(b, before);
    }

    #[test]
    fn update_huge_gap_treated_as_regression() {
        let c = cfg(1000, 2000);
        let mut b = Bucket::new(&c, Tick(0));
        let before = b;
        assert!(!b.update(&c, Tick((i32::MAX as u32) + 2)));
        assert_eq!(b, before);
    }

    #[test]
    fn linear_refill_within_ceiling() {
        // Law: for k ticks from a freshly-zeroed bucket, limit == min(k*r, M).
        let c = cfg(10, 1000);
        let mut b = Bucket::new(&c, Tick(0));
        b.charge(Direction::Read, 10); // drive to 0
        assert_eq!(b.limit(Direction::Read), 0);

        assert!(b.update(&c, Tick(5)));
        assert_eq!(b.limit(Direction::Read), 50);

        assert!(b.update(&c, Tick(205)));
        // 50 + 200*10 = 2050, capped at 1000
        assert_eq!(b.limit(Direction::Read), 1000);
    }

    #[test]
    fn reinitialize_clips_down_only_and_keeps_last_updated() {
        let c1 = cfg(1000, 5000);
        let mut b = Bucket::new(&c1, Tick(7));
        b.charge(Direction::Read, 200); // 800

        let c2 = BucketConfig::new(1000, 500, 1000, 500, None).unwrap();
        b.reinitialize(&c2);
        assert_eq!(b.limit(Direction::Read), 500);
        assert_eq!(b.last_updated(), Tick(7));
    }

    #[test]
    fn reinitialize_leaves_limit_below_new_max_untouched() {
        let c1 = cfg(1000, 5000);
        let mut b = Bucket::new(&c1, Tick(7));
        b.charge(Direction::Read, 900); // 100

        let c2 = BucketConfig::new(1000, 500, 1000, 500, None).unwrap();
        b.reinitialize(&c2);
        assert_eq!(b.limit(Direction::Read), 100);
    }

    #[test]
    fn charge_can_go_negative() {
        let c = cfg(1000, 2000);
        let mut b = Bucket::new(&c, Tick(0));
        let limit = b.charge(Direction::Read, 5000);
        assert!(limit < 0);
        assert_eq!(limit, 1000 - 5000);
    }

    proptest::proptest! {
        #[test]
        fn refill_never_exceeds_max(rate in 1u32..=10_000, burst_extra in 0u32..=100_000, ticks in 1u32..=1_000_000) {
            let burst = rate.saturating_add(burst_extra).max(rate);
            let c = BucketConfig::new(rate, burst, rate, burst, None).unwrap();
            let mut b = Bucket::new(&c, Tick(0));
            b.update(&c, Tick(ticks));
            proptest::prop_assert!(b.limit(crate::suspend::Direction::Read) <= i64::from(burst));
        }
    }
}
