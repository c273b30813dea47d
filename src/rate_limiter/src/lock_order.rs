// SPDX-License-Identifier: Apache-2.0

//! Debug-only enforcement of the `stream -> group` lock order.
//!
//! Code may acquire a stream lock and then a group lock, never the
//! reverse; group-driven code paths that need to touch member state MUST
//! use a non-blocking try-acquire. This module doesn't prevent a
//! deadlock-prone call from compiling, the stream lock lives entirely
//! outside this crate, in the caller's own connection object, but it
//! gives debug builds a cheap assertion that a blocking member acquisition
//! was never attempted while the current thread already holds a group
//! lock, pushing an invariant the type system can't express into
//! something a debug build catches instead of a comment.

use std::cell::Cell;

thread_local! {
    static GROUP_LOCKS_HELD: Cell<u32> = const { Cell::new(0) };
}

/// RAII marker recording that the current thread holds a group lock.
/// Dropped when the group lock is released.
pub(crate) struct GroupLockGuard {
    _private: (),
}

impl GroupLockGuard {
    /// Marks the current thread as holding a group lock.
    pub(crate) fn acquire() -> Self {
        GROUP_LOCKS_HELD.with(|c| c.set(c.get() + 1));
        GroupLockGuard { _private: () }
    }
}

impl Drop for GroupLockGuard {
    fn drop(&mut self) {
        GROUP_LOCKS_HELD.with(|c| c.set(c.get().saturating_sub(1)));
    }
}

/// Asserts that the current thread is not already holding a group lock.
/// Call this immediately before a *blocking* acquisition of a member's
/// (stream's) lock. A no-op in release builds.
#[cfg_attr(not(debug_assertions), allow(dead_code))]
pub(crate) fn assert_no_group_lock_held_before_blocking_stream_lock() {
    #[cfg(debug_assertions)]
    GROUP_LOCKS_HELD.with(|c| {
        assert_eq!(
            c.get(),
            0,
            "lock-order violation: attempted a blocking stream-lock acquisition while a group lock \
             is held on this thread; group-driven code must use try_lock on members"
        );
    });
}
