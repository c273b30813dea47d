// SPDX-License-Identifier: Apache-2.0

//! The timer service collaborator.
//!
//! The core never drives its own event loop; it schedules refill callbacks
//! against whatever timer service the surrounding I/O library provides,
//! the same way a `timerfd::TimerFd` armed by the caller's event loop hands
//! its refill duty back to whoever polls it.

use std::time::Duration;

use crate::Error;

#[cfg(feature = "timerfd")]
use std::collections::HashMap;
#[cfg(feature = "timerfd")]
use std::os::unix::io::{AsRawFd, RawFd};
#[cfg(feature = "timerfd")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "timerfd")]
use std::sync::Mutex;

/// Opaque handle to a scheduled timer, returned by [`TimerService`] so it
/// can later be cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// A timer collaborator: schedules one-shot or repeating callbacks after a
/// delay. Implemented by the surrounding event loop; this crate only calls
/// `schedule_oneshot`/`schedule_repeating`/`cancel`.
pub trait TimerService {
    /// Schedules `callback` to run once after `delay`. Re-scheduling the
    /// per-stream refill timer (spec.md §4.5 step 4) calls this again with
    /// a fresh handle rather than rearming the old one, mirroring the
    /// one-shot-per-arm semantics of `timerfd`/`evtimer_add`.
    fn schedule_oneshot(&self, delay: Duration, callback: Box<dyn FnMut() + Send>) -> TimerHandle;

    /// Schedules `callback` to run every `period`, starting after one
    /// `period` has elapsed. Used for the group's master refill timer.
    fn schedule_repeating(&self, period: Duration, callback: Box<dyn FnMut() + Send>) -> TimerHandle;

    /// Cancels a previously scheduled timer. Cancelling a handle that has
    /// already fired (one-shot) or was never registered is a no-op.
    fn cancel(&self, handle: TimerHandle);
}

/// One armed `timerfd::TimerFd` together with the callback it should
/// trigger and whether it rearms itself after firing.
#[cfg(feature = "timerfd")]
struct ArmedTimer {
    fd: timerfd::TimerFd,
    callback: Box<dyn FnMut() + Send>,
    repeating: bool,
}

/// A [`TimerService`] backed by Linux `timerfd`, mirroring the mechanism
/// the teacher `rate_limiter` crate uses for its own refill timer: each
/// scheduled timer is a real `timerfd::TimerFd` the caller's event loop
/// polls for readiness via [`TimerFdService::as_raw_fd`], then drains via
/// [`TimerFdService::event_handler`], the same `AsRawFd` + `event_handler`
/// contract the teacher's own `RateLimiter` exposes. Gated behind the
/// `timerfd` feature (enabled by default) since it is Linux-only; callers
/// on other platforms supply their own [`TimerService`] implementation
/// instead.
#[cfg(feature = "timerfd")]
pub struct TimerFdService {
    next_id: AtomicU64,
    armed: Mutex<HashMap<u64, ArmedTimer>>,
}

#[cfg(feature = "timerfd")]
impl std::fmt::Debug for TimerFdService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerFdService").finish_non_exhaustive()
    }
}

#[cfg(feature = "timerfd")]
impl TimerFdService {
    /// Creates a new timerfd-backed timer service with no timers armed yet.
    #[must_use]
    pub fn new() -> Self {
        TimerFdService {
            next_id: AtomicU64::new(0),
            armed: Mutex::new(HashMap::new()),
        }
    }

    /// Creates and arms a `timerfd::TimerFd` in the requested mode.
    fn arm(state: timerfd::TimerState) -> Result<timerfd::TimerFd, Error> {
        let mut fd = timerfd::TimerFd::new_custom(timerfd::ClockId::Monotonic, true, true)
            .map_err(Error::Timer)?;
        fd.set_state(state, timerfd::SetTimeFlags::Default);
        Ok(fd)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// The raw fd backing `handle`, for the caller's event loop to register
    /// for `POLLIN` readiness, mirroring the teacher `RateLimiter`'s
    /// `AsRawFd` contract. Returns `None` once `handle` has been cancelled,
    /// or has fired and was one-shot.
    #[must_use]
    pub fn as_raw_fd(&self, handle: TimerHandle) -> Option<RawFd> {
        self.armed.lock().unwrap().get(&handle.0).map(|timer| timer.fd.as_raw_fd())
    }

    /// Must be called on every readiness event for `handle`'s fd (per the
    /// [`TimerFdService::as_raw_fd`] contract). Reads the expiration count
    /// off the `timerfd` and, if it has actually expired, invokes the
    /// callback once. A one-shot timer is deregistered afterward; a
    /// repeating one stays armed for its next period.
    pub fn event_handler(&self, handle: TimerHandle) {
        let mut armed = self.armed.lock().unwrap();
        let Some(timer) = armed.get_mut(&handle.0) else {
            return;
        };
        if timer.fd.read() == 0 {
            return;
        }
        (timer.callback)();
        if !timer.repeating {
            armed.remove(&handle.0);
        }
    }
}

#[cfg(feature = "timerfd")]
impl Default for TimerFdService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "timerfd")]
impl TimerService for TimerFdService {
    fn schedule_oneshot(&self, delay: Duration, mut callback: Box<dyn FnMut() + Send>) -> TimerHandle {
        let id = self.next_id();
        match Self::arm(timerfd::TimerState::Oneshot(delay)) {
            Ok(fd) => {
                self.armed
                    .lock()
                    .unwrap()
                    .insert(id, ArmedTimer { fd, callback, repeating: false });
            }
            Err(_) => {
                // Couldn't even create the timerfd; run the refill now rather
                // than leaving the caller suspended forever.
                callback();
            }
        }
        TimerHandle(id)
    }

    fn schedule_repeating(&self, period: Duration, mut callback: Box<dyn FnMut() + Send>) -> TimerHandle {
        let id = self.next_id();
        match Self::arm(timerfd::TimerState::Periodic { current: period, interval: period }) {
            Ok(fd) => {
                self.armed
                    .lock()
                    .unwrap()
                    .insert(id, ArmedTimer { fd, callback, repeating: true });
            }
            Err(_) => {
                callback();
            }
        }
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        self.armed.lock().unwrap().remove(&handle.0);
    }
}



#[cfg(test)]
mod tests {
    use super::fake::FakeTimerService;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn oneshot_fires_once() {
        let svc = FakeTimerService::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        svc.schedule_oneshot(Duration::from_millis(1), Box::new(move || { c.fetch_add(1, Ordering::SeqCst); }));
        svc.fire_all_due();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(svc.len(), 0);
    }

    #[test]
    fn repeating_stays_registered() {
        let svc = FakeTimerService::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        svc.schedule_repeating(Duration::from_millis(1), Box::new(move || { c.fetch_add(1, Ordering::SeqCst); }));
        svc.fire_all_due();
        svc.fire_all_due();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(svc.len(), 1);
    }

    #[test]
    fn cancel_stops_future_fires() {
        let svc = FakeTimerService::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = svc.schedule_repeating(Duration::from_millis(1), Box::new(move || { c.fetch_add(1, Ordering::SeqCst); }));
        svc.fire_all_due();
        svc.cancel(handle);
        svc.fire_all_due();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
