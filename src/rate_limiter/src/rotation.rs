// SPDX-License-Identifier: Apache-2.0

//! Weak, process-local randomness for random-start member rotation.
//!
//! Mirrors `_evutil_weakrand`/`_bev_group_random_element` from the
//! original C source: no cryptographic strength is needed, only a cheap
//! way to avoid always favoring the same group member, so this is
//! hand-rolled rather than pulled in as a `rand` dependency.

use std::cell::Cell;
use std::time::{SystemTime, UNIX_EPOCH};

/// A tiny xorshift32 generator. Not suitable for anything security
/// sensitive; only used to pick a random starting member for group
/// rotation.
#[derive(Debug)]
pub struct WeakRng {
    state: Cell<u32>,
}

impl WeakRng {
    /// Builds a generator seeded from the given non-zero value. Zero seeds
    /// are rejected by xorshift (they produce an all-zero stream), so a
    /// zero input is nudged to a fixed non-zero constant.
    #[must_use]
    pub fn new(seed: u32) -> Self {
        WeakRng {
            state: Cell::new(if seed == 0 { 0x9E37_79B9 } else { seed }),
        }
    }

    /// Seeds from the current time, good enough for a process-local
    /// fairness tie-breaker.
    #[must_use]
    pub fn from_time() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0x2545_F491);
        Self::new(seed)
    }

    /// Returns the next pseudo-random `u32`.
    pub fn next_u32(&self) -> u32 {
        let mut x = self.state.get();
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state.set(x);
        x
    }

    /// Returns a pseudo-random index in `[0, bound)`. Panics if `bound` is
    /// zero; callers must check for an empty collection first (see
    /// [`random_start_order`]).
    pub fn below(&self, bound: u32) -> u32 {
        assert!(bound > 0, "below() requires a non-zero bound");
        self.next_u32() % bound
    }
}

/// Produces the visiting order for a random-start rotation over `n`
/// members: a uniformly chosen start index `k`, then `[k, n) ++ [0, k)`.
/// Returns an empty vector when `n == 0`, no random index is drawn and no
/// division is performed.
#[must_use]
pub fn random_start_order(n: usize, rng: &WeakRng) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    #[allow(clippy::cast_possible_truncation)]
    let k = rng.below(n as u32) as usize;
    let mut order = Vec::with_capacity(n);
    order.extend(k..n);
    order.extend(0..k);
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_group_produces_empty_order() {
        let rng = WeakRng::new(12345);
        assert!(random_start_order(0, &rng).is_empty());
    }

    #[test]
    fn order_visits_every_member_exactly_once() {
        let rng = WeakRng::new(7);
        for n in 1..20 {
            let order = random_start_order(n, &rng);
            let mut seen: Vec<usize> = order.clone();
            seen.sort_unstable();
            let expected: Vec<usize> = (0..n).collect();
            assert_eq!(seen, expected, "n={n}");
        }
    }

    #[test]
    fn order_is_a_rotation() {
        let rng = WeakRng::new(99);
        let n = 6;
        let order = random_start_order(n, &rng);
        let k = order[0];
        let expected: Vec<usize> = (k..n).chain(0..k).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn zero_seed_is_nudged_to_nonzero() {
        let rng = WeakRng::new(0);
        // Should not get stuck emitting zero forever.
        let a = rng.next_u32();
        let b = rng.next_u32();
        assert_ne!((a, b), (0, 0));
    }
}
