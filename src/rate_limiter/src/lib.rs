// SPDX-License-Identifier: Apache-2.0

//! # rate_limiter
//!
//! Token-bucket bandwidth throttling for a single stream, or for a group of
//! streams sharing one budget.
//!
//! A [`stream::StreamLimiter`] owns a private bucket credited at a
//! configured rate up to a configured burst ceiling; a [`group::GroupLimiter`]
//! owns one bucket shared by every stream that joins it, refilled on its own
//! timer independent of any single member's activity. Both answer the same
//! two questions a caller's read/write loop needs: "how many bytes may I
//! move right now" ([`stream::StreamLimiter::max_read`] /
//! [`stream::StreamLimiter::max_write`]), and "I just moved N bytes, account
//! for that" ([`stream::StreamLimiter::decrement_read_buckets`] /
//! [`stream::StreamLimiter::decrement_write_buckets`]).
//!
//! This crate does not own an event loop, a clock, or I/O. It depends on
//! three small collaborator traits the surrounding library provides:
//! [`clock::Clock`] (monotonic time), [`timer::TimerService`] (scheduling
//! refill callbacks), and [`suspend::SuspendableStream`] (actually pausing
//! reads/writes on a connection). Tests in this crate use fakes for all
//! three; a real caller wires in whatever its event loop already has.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod bucket;
pub mod clock;
pub mod group;
pub(crate) mod lock_order;
pub mod rotation;
pub mod stream;
pub mod suspend;
pub mod timer;

pub use bucket::{BucketConfig, MAX_READ_EVER, MAX_WRITE_EVER};
pub use clock::{Clock, SystemClock, Tick, TimeSpec};
pub use group::GroupLimiter;
pub use stream::StreamLimiter;
pub use suspend::{Direction, SuspendReason, SuspendableStream};
pub use timer::{TimerHandle, TimerService};

#[cfg(feature = "timerfd")]
pub use timer::TimerFdService;

/// Errors this crate can report. Lock contention is never one of them: a
/// failed try-lock during group-driven suspend/unsuspend is ordinary,
/// expected behavior handled internally (see
/// [`group::GroupLimiter`]'s `pending_unsuspend_*` bookkeeping), not a
/// caller-visible failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A [`BucketConfig`] was rejected: a zero rate, a rate exceeding its
    /// burst ceiling, or a tick length outside `[1ms, u32::MAX ms]`.
    #[error("invalid rate limiter configuration: {0}")]
    InvalidConfig(&'static str),

    /// The timer collaborator failed to arm a timer.
    #[error("timer error: {0}")]
    Timer(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeClock {
        now: Mutex<TimeSpec>,
    }

    impl Clock for FakeClock {
        fn now(&self) -> TimeSpec {
            *self.now.lock().unwrap()
        }
    }

    impl FakeClock {
        fn advance_ticks(&self, msec_per_tick: u32, ticks: u64) {
            let mut now = self.now.lock().unwrap();
            let ms = now.as_millis() + ticks * u64::from(msec_per_tick);
            *now = TimeSpec { sec: ms / 1000, usec: (ms % 1000) * 1000 };
        }
    }

    #[derive(Default)]
    struct NullTimerService {
        next: AtomicU64,
    }

    impl TimerService for NullTimerService {
        fn schedule_oneshot(&self, _delay: std::time::Duration, _callback: Box<dyn FnMut() + Send>) -> TimerHandle {
            TimerHandle(self.next.fetch_add(1, Ordering::SeqCst))
        }
        fn schedule_repeating(&self, _period: std::time::Duration, _callback: Box<dyn FnMut() + Send>) -> TimerHandle {
            TimerHandle(self.next.fetch_add(1, Ordering::SeqCst))
        }
        fn cancel(&self, _handle: TimerHandle) {}
    }

    #[derive(Default)]
    struct RecordingStream {
        read_suspended: bool,
        write_suspended: bool,
    }

    impl SuspendableStream for RecordingStream {
        fn suspend_read(&mut self, _reason: SuspendReason) {
            self.read_suspended = true;
        }
        fn suspend_write(&mut self, _reason: SuspendReason) {
            self.write_suspended = true;
        }
        fn unsuspend_read(&mut self, _reason: SuspendReason) {
            self.read_suspended = false;
        }
        fn unsuspend_write(&mut self, _reason: SuspendReason) {
            self.write_suspended = false;
        }
    }

    /// An end-to-end pass through a stream joining a group, exhausting both
    /// the per-stream and the group bucket, and recovering once both have
    /// had a chance to refill, exercising the interaction between
    /// [`StreamLimiter`] and [`GroupLimiter`] rather than either in
    /// isolation.
    #[test]
    fn stream_and_group_limits_compose() {
        let clock = Arc::new(FakeClock::default());
        let timers = Arc::new(NullTimerService::default());

        let group_cfg = BucketConfig::new(200, 200, 200, 200, None).unwrap();
        let group = GroupLimiter::new(group_cfg, clock.clone(), timers.clone());

        let mut limiter = StreamLimiter::new();
        let handle: Arc<Mutex<dyn SuspendableStream + Send>> = Arc::new(Mutex::new(RecordingStream::default()));

        {
            let mut s = handle.lock().unwrap();
            limiter.set_rate_limit(Some(Arc::new(BucketConfig::new(100, 100, 100, 100, None).unwrap())), clock.as_ref(), &mut *s);
        }
        group.add_stream(&mut limiter, &handle);

        let allowed = {
            let mut s = handle.lock().unwrap();
            limiter.max_read(clock.as_ref(), &mut *s)
        };
        // Per-stream rate (100) is the tighter of the two ceilings.
        assert_eq!(allowed, 100);

        {
            let mut s = handle.lock().unwrap();
            limiter.decrement_read_buckets(100, &mut *s);
            assert!(s.read_suspended);
        }

        clock.advance_ticks(1000, 1);
        {
            let mut s = handle.lock().unwrap();
            let again = limiter.on_refill_timer(clock.as_ref(), &mut *s);
            assert!(again.is_none());
            assert!(!s.read_suspended);
        }
    }
}
