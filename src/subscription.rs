// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subscription handles.
//!
//! Every subscribe operation in this library hands back an
//! [`Unsubscribe`] handle. Handles are idempotent and remain safe to
//! invoke after the owning channel or session has closed.

use parking_lot::Mutex;

type CleanupFn = Box<dyn FnOnce() + Send>;

/// Handle that detaches a subscription when invoked.
///
/// Invoking the handle more than once, or after the channel closed, is a
/// no-op.
#[must_use = "dropping the handle without calling it leaves the subscription active"]
pub struct Unsubscribe {
    cleanup: Mutex<Option<CleanupFn>>,
}

impl Unsubscribe {
    /// Wraps a cleanup function.
    pub fn new(cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cleanup: Mutex::new(Some(Box::new(cleanup))),
        }
    }

    /// Creates a handle that does nothing, for already-detached cases.
    #[must_use]
    pub fn noop() -> Self {
        Self {
            cleanup: Mutex::new(None),
        }
    }

    /// Detaches the subscription.
    pub fn unsubscribe(&self) {
        if let Some(cleanup) = self.cleanup.lock().take() {
            cleanup();
        }
    }

    /// Chains another handle to be released together with this one.
    #[must_use]
    pub fn and(self, other: Unsubscribe) -> Unsubscribe {
        Unsubscribe::new(move || {
            self.unsubscribe();
            other.unsubscribe();
        })
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("armed", &self.cleanup.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn fires_cleanup_once() {
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();
        let unsub = Unsubscribe::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        unsub.unsubscribe();
        unsub.unsubscribe();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn noop_is_safe() {
        Unsubscribe::noop().unsubscribe();
    }

    #[test]
    fn chained_handles_release_together() {
        let count = Arc::new(AtomicU32::new(0));
        let c1 = count.clone();
        let c2 = count.clone();
        let unsub =
            Unsubscribe::new(move || {
                c1.fetch_add(1, Ordering::SeqCst);
            })
            .and(Unsubscribe::new(move || {
                c2.fetch_add(1, Ordering::SeqCst);
            }));

        unsub.unsubscribe();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
