// SPDX-License-Identifier: Apache-2.0

//! Per-stream rate limiting: the bucket a single connection owns outright,
//! plus its optional membership in a shared [`GroupLimiter`].
//!
//! Grounded on `_bufferevent_get_rlim_max`, `_bufferevent_decrement_read_buckets`
//! /`_bufferevent_decrement_write_buckets`, `_bev_refill_callback`, and
//! `bufferevent_set_rate_limit` in the original C source, reshaped around the
//! teacher `rate_limiter` crate's `RateLimiter::consume`/`event_handler` split
//! between "do the accounting" and "tell me what to arm next".

use std::sync::Arc;
use std::time::Duration;

use crate::bucket::{Bucket, BucketConfig, MAX_READ_EVER, MAX_WRITE_EVER};
use crate::clock::Clock;
use crate::group::GroupLimiter;
use crate::suspend::{Direction, SuspendReason, SuspendableStream};

#[derive(Clone, Copy, Debug)]
struct PerStreamBucket {
    config: Arc<BucketConfig>,
    bucket: Bucket,
}

/// The rate-limiting state a single stream (connection) carries alongside
/// its own I/O buffers. Owns nothing about how bytes are actually read or
/// written, that's the caller's [`SuspendableStream`], only the bucket
/// accounting and, optionally, a handle into a shared [`GroupLimiter`].
///
/// Does not itself hold a [`crate::timer::TimerHandle`]: arming and
/// cancelling the per-stream refill timer is the caller's job, since only
/// the caller knows how to build a `'static` callback that can find its way
/// back to this stream later. [`StreamLimiter::decrement_read_buckets`] and
/// [`StreamLimiter::decrement_write_buckets`] report back how long to wait
/// before calling [`StreamLimiter::on_refill_timer`] again.
#[derive(Debug, Default)]
pub struct StreamLimiter {
    per_stream: Option<PerStreamBucket>,
    group: Option<GroupLimiter>,
    member_slot: Option<usize>,
    bw_suspended_read: bool,
    bw_suspended_write: bool,
}

impl StreamLimiter {
    /// Creates a limiter with no per-stream bucket and no group membership:
    /// [`StreamLimiter::max_read`]/[`StreamLimiter::max_write`] return the
    /// unthrottled ceiling until [`StreamLimiter::set_rate_limit`] or
    /// [`GroupLimiter::add_stream`] attaches something.
    #[must_use]
    pub fn new() -> Self {
        StreamLimiter::default()
    }

    /// True if this stream currently belongs to a group.
    #[must_use]
    pub fn has_group(&self) -> bool {
        self.group.is_some()
    }

    /// The group this stream belongs to, if any.
    #[must_use]
    pub fn group(&self) -> Option<&GroupLimiter> {
        self.group.as_ref()
    }

    pub(crate) fn attach_group(&mut self, group: GroupLimiter, slot: usize) {
        self.group = Some(group);
        self.member_slot = Some(slot);
    }

    pub(crate) fn detach_group(&mut self) -> Option<usize> {
        self.group = None;
        self.member_slot.take()
    }

    /// Changes (or clears, or installs) this stream's own bucket
    /// configuration. Mirrors `bufferevent_set_rate_limit`:
    ///
    /// - `None` with an existing bucket: drops it and lifts
    ///   [`SuspendReason::BANDWIDTH`] in both directions.
    /// - `None` with no existing bucket: no-op.
    /// - `Some(cfg)` identical (by `Arc` identity) to the current one: no-op.
    /// - `Some(cfg)` replacing a different one: clips the in-flight bucket
    ///   down to the new ceilings (never grants an unearned burst) and
    ///   re-applies suspension for whichever directions are still
    ///   non-positive.
    /// - `Some(cfg)` with no existing bucket: allocates a fresh one, credited
    ///   with one tick's worth of tokens.
    #[tracing::instrument(level = "trace", skip(clock, stream))]
    pub fn set_rate_limit(
        &mut self,
        config: Option<Arc<BucketConfig>>,
        clock: &dyn Clock,
        stream: &mut dyn SuspendableStream,
    ) {
        let Some(cfg) = config else {
            if self.per_stream.take().is_some() {
                stream.unsuspend_read(SuspendReason::BANDWIDTH);
                stream.unsuspend_write(SuspendReason::BANDWIDTH);
                self.bw_suspended_read = false;
                self.bw_suspended_write = false;
            }
            return;
        };

        if let Some(existing) = &self.per_stream {
            if Arc::ptr_eq(&existing.config, &cfg) {
                return;
            }
        }

        if let Some(mut existing) = self.per_stream.take() {
            existing.bucket.reinitialize(&cfg);
            existing.config = cfg;
            if existing.bucket.limit(Direction::Read) > 0 {
                stream.unsuspend_read(SuspendReason::BANDWIDTH);
                self.bw_suspended_read = false;
            } else {
                stream.suspend_read(SuspendReason::BANDWIDTH);
                self.bw_suspended_read = true;
            }
            if existing.bucket.limit(Direction::Write) > 0 {
                stream.unsuspend_write(SuspendReason::BANDWIDTH);
                self.bw_suspended_write = false;
            } else {
                stream.suspend_write(SuspendReason::BANDWIDTH);
                self.bw_suspended_write = true;
            }
            self.per_stream = Some(existing);
        } else {
            let now_tick = cfg.tick_for(clock.now());
            let bucket = Bucket::new(&cfg, now_tick);
            self.per_stream = Some(PerStreamBucket { config: cfg, bucket });
        }
    }

    /// How many bytes may be read right now: the smaller of the per-stream
    /// ceiling, the group's computed share, and the hard per-call cap
    /// ([`MAX_READ_EVER`]). Refreshes the per-stream bucket against `clock`
    /// first. If a group has suspended reads, calls
    /// `stream.suspend_read(SuspendReason::BANDWIDTH_GROUP)` and returns 0.
    #[tracing::instrument(level = "trace", skip(clock, stream))]
    pub fn max_read(&mut self, clock: &dyn Clock, stream: &mut dyn SuspendableStream) -> u32 {
        self.max_for(Direction::Read, clock, stream)
    }

    /// See [`StreamLimiter::max_read`].
    #[tracing::instrument(level = "trace", skip(clock, stream))]
    pub fn max_write(&mut self, clock: &dyn Clock, stream: &mut dyn SuspendableStream) -> u32 {
        self.max_for(Direction::Write, clock, stream)
    }

    fn max_for(&mut self, dir: Direction, clock: &dyn Clock, stream: &mut dyn SuspendableStream) -> u32 {
        let ceiling = match dir {
            Direction::Read => MAX_READ_EVER,
            Direction::Write => MAX_WRITE_EVER,
        };

        if self.per_stream.is_none() && self.group.is_none() {
            return ceiling;
        }

        let mut max_so_far = i64::from(ceiling);

        if let Some(ps) = &mut self.per_stream {
            let now_tick = ps.config.tick_for(clock.now());
            ps.bucket.update(&ps.config, now_tick);
            max_so_far = max_so_far.min(ps.bucket.limit(dir));
        }

        if let Some(group) = &self.group {
            let share = group.query_share(dir, stream);
            max_so_far = max_so_far.min(share);
        }

        #[allow(clippy::cast_sign_loss)]
        let result = max_so_far.max(0) as u32;
        result
    }

    /// Charges `bytes` against the per-stream read bucket (if any) and the
    /// group read bucket (if a member). If the per-stream bucket goes
    /// non-positive, suspends the stream for [`SuspendReason::BANDWIDTH`]
    /// and returns the delay after which the caller should arm a one-shot
    /// timer that calls [`StreamLimiter::on_refill_timer`]. A group going
    /// non-positive is handled entirely inside the group (it suspends every
    /// member it can reach, not just this one) and never affects the
    /// returned delay.
    #[tracing::instrument(level = "trace", skip(stream))]
    pub fn decrement_read_buckets(&mut self, bytes: u32, stream: &mut dyn SuspendableStream) -> Option<Duration> {
        self.decrement(Direction::Read, bytes, stream)
    }

    /// See [`StreamLimiter::decrement_read_buckets`].
    #[tracing::instrument(level = "trace", skip(stream))]
    pub fn decrement_write_buckets(&mut self, bytes: u32, stream: &mut dyn SuspendableStream) -> Option<Duration> {
        self.decrement(Direction::Write, bytes, stream)
    }

    fn decrement(&mut self, dir: Direction, bytes: u32, stream: &mut dyn SuspendableStream) -> Option<Duration> {
        let mut rearm = None;

        if let Some(ps) = &mut self.per_stream {
            let new_limit = ps.bucket.charge(dir, bytes);
            if new_limit <= 0 {
                stream.suspend(dir, SuspendReason::BANDWIDTH);
                match dir {
                    Direction::Read => self.bw_suspended_read = true,
                    Direction::Write => self.bw_suspended_write = true,
                }
                rearm = Some(ps.config.tick_length().to_duration());
            }
        }

        if let Some(group) = &self.group {
            group.charge(dir, bytes);
        }

        rearm
    }

    /// Call when the per-stream refill timer the caller armed (per the
    /// `Duration` returned from a `decrement_*` or a previous
    /// `on_refill_timer` call) fires. Advances the bucket, and for each
    /// direction this limiter itself suspended for
    /// [`SuspendReason::BANDWIDTH`], unsuspends it if the refreshed limit is
    /// positive again. Returns `Some(delay)` if at least one direction is
    /// still exhausted and the caller should arm the timer once more;
    /// `None` if there is nothing left to watch (including when this
    /// limiter has no per-stream bucket at all).
    #[tracing::instrument(level = "trace", skip(clock, stream))]
    pub fn on_refill_timer(&mut self, clock: &dyn Clock, stream: &mut dyn SuspendableStream) -> Option<Duration> {
        let Some(ps) = &mut self.per_stream else {
            return None;
        };
        let now_tick = ps.config.tick_for(clock.now());
        ps.bucket.update(&ps.config, now_tick);

        let mut again = false;

        if self.bw_suspended_read {
            if ps.bucket.limit(Direction::Read) > 0 {
                stream.unsuspend_read(SuspendReason::BANDWIDTH);
                self.bw_suspended_read = false;
            } else {
                again = true;
            }
        }
        if self.bw_suspended_write {
            if ps.bucket.limit(Direction::Write) > 0 {
                stream.unsuspend_write(SuspendReason::BANDWIDTH);
                self.bw_suspended_write = false;
            } else {
                again = true;
            }
        }

        if again {
            Some(ps.config.tick_length().to_duration())
        } else {
            None
        }
    }
}
