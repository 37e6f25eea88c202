// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Clock and id-generation dependencies.
//!
//! Channels never read wall-clock time or draw request ids from globals;
//! both flow in as explicit dependencies constructed once per device
//! manager. Tests substitute fixed implementations for deterministic
//! payloads.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Source of wall-clock time for message timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current time as unix seconds.
    fn unix_seconds(&self) -> u32;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_seconds(&self) -> u32 {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX)
    }
}

/// Generates monotonically increasing request ids from a fixed range.
///
/// The start position is randomized so concurrent clients sharing a
/// device are unlikely to collide. Ids wrap back to the range start on
/// overflow.
#[derive(Debug, Clone)]
pub struct RequestIdGenerator {
    next: Arc<AtomicU64>,
    min: u64,
    max: u64,
}

impl RequestIdGenerator {
    /// Creates a generator over `min..=max`, seeded at a random position.
    ///
    /// # Panics
    ///
    /// Panics if `min >= max`.
    #[must_use]
    pub fn new(min: u64, max: u64) -> Self {
        assert!(min < max, "empty request id range");
        let start = rand::thread_rng().gen_range(min..=max);
        Self {
            next: Arc::new(AtomicU64::new(start)),
            min,
            max,
        }
    }

    /// Returns the next request id.
    pub fn next_id(&self) -> u64 {
        loop {
            let current = self.next.load(Ordering::Relaxed);
            let next = if current >= self.max {
                self.min
            } else {
                current + 1
            };
            if self
                .next
                .compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return current;
            }
        }
    }

    /// Returns the next request id truncated to `u32`.
    ///
    /// Only valid for generators whose range fits in 32 bits.
    pub fn next_u32(&self) -> u32 {
        u32::try_from(self.next_id()).unwrap_or_else(|_| {
            debug_assert!(false, "request id range exceeds u32");
            0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn system_clock_is_past_2020() {
        assert!(SystemClock.unix_seconds() > 1_577_836_800);
    }

    #[test]
    fn ids_are_unique_and_in_range() {
        let generator = RequestIdGenerator::new(10_000, 999_999);
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = generator.next_id();
            assert!((10_000..=999_999).contains(&id));
            assert!(seen.insert(id), "duplicate id {id}");
        }
    }

    #[test]
    fn ids_wrap_at_range_end() {
        let generator = RequestIdGenerator::new(1, 3);
        let mut seen = HashSet::new();
        for _ in 0..3 {
            seen.insert(generator.next_id());
        }
        assert_eq!(seen, HashSet::from([1, 2, 3]));
        // A fourth draw wraps back into the range.
        assert!((1..=3).contains(&generator.next_id()));
    }

    #[test]
    fn clones_share_the_counter() {
        let generator = RequestIdGenerator::new(1, 1000);
        let clone = generator.clone();
        let first = generator.next_id();
        let second = clone.next_id();
        assert_ne!(first, second);
    }
}
