// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pending RPC bookkeeping.
//!
//! Each in-flight request maps its id to a one-shot channel. An entry
//! leaves the table in exactly one of three ways: a matching response, a
//! timeout, or a channel close; a response for an id that is no longer
//! present is logged and dropped.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::Error;

/// Table of in-flight requests awaiting responses.
#[derive(Debug)]
pub struct PendingRpcs<K, V> {
    pending: Mutex<HashMap<K, oneshot::Sender<V>>>,
}

impl<K, V> Default for PendingRpcs<K, V> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> PendingRpcs<K, V>
where
    K: Eq + Hash + Copy + Display + Send,
    V: Send,
{
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request id and returns the receiver its response will
    /// resolve.
    ///
    /// # Errors
    ///
    /// Fails when the id is already pending; ids must not be reused
    /// while in flight.
    pub fn start(&self, key: K) -> Result<oneshot::Receiver<V>, Error> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&key) {
            return Err(Error::FatalStartup(format!(
                "request id {key} already pending, cannot send command"
            )));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(key, tx);
        Ok(rx)
    }

    /// Resolves a pending request with its response value.
    ///
    /// A value for an unknown id (a late response whose entry timed out
    /// or was cancelled, or a second transport answering the same RPC)
    /// is logged and dropped.
    pub fn resolve(&self, key: K, value: V) {
        let sender = self.pending.lock().remove(&key);
        match sender {
            Some(sender) => {
                if sender.send(value).is_err() {
                    tracing::debug!(request_id = %key, "Requester gone, dropping response");
                }
            }
            None => {
                tracing::debug!(request_id = %key, "Dropping response for unknown request id");
            }
        }
    }

    /// Removes an entry without resolving it.
    ///
    /// The waiting receiver observes cancellation. Removing an id that
    /// is not pending is a no-op.
    pub fn pop(&self, key: K) {
        self.pending.lock().remove(&key);
    }

    /// Fails every pending entry, e.g. on connection loss or close.
    pub fn fail_all(&self, mut make_error: impl FnMut() -> V) {
        let entries: Vec<(K, oneshot::Sender<V>)> = self.pending.lock().drain().collect();
        for (key, sender) in entries {
            if sender.send(make_error()).is_err() {
                tracing::debug!(request_id = %key, "Requester gone during fail_all");
            }
        }
    }

    /// Returns the number of in-flight requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns whether no requests are in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_value() {
        let pending: PendingRpcs<u32, String> = PendingRpcs::new();
        let rx = pending.start(1).unwrap();
        pending.resolve(1, "test_result".to_string());
        assert_eq!(rx.await.unwrap(), "test_result");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn duplicate_start_fails() {
        let pending: PendingRpcs<u32, String> = PendingRpcs::new();
        let _rx = pending.start(1).unwrap();
        assert!(pending.start(1).is_err());
    }

    #[tokio::test]
    async fn unsolicited_resolve_is_dropped() {
        let pending: PendingRpcs<u32, String> = PendingRpcs::new();
        pending.resolve(1, "ignored".to_string());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn pop_cancels_the_receiver() {
        let pending: PendingRpcs<u32, String> = PendingRpcs::new();
        let rx = pending.start(1).unwrap();
        pending.pop(1);
        assert!(rx.await.is_err());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn pop_unknown_is_noop() {
        let pending: PendingRpcs<u32, String> = PendingRpcs::new();
        pending.pop(1);
    }

    #[tokio::test]
    async fn second_resolve_is_noop() {
        let pending: PendingRpcs<u32, String> = PendingRpcs::new();
        let rx = pending.start(1).unwrap();
        pending.resolve(1, "first".to_string());
        pending.resolve(1, "second".to_string());
        assert_eq!(rx.await.unwrap(), "first");
    }

    #[tokio::test]
    async fn fail_all_empties_the_table() {
        let pending: PendingRpcs<u32, String> = PendingRpcs::new();
        let rx1 = pending.start(1).unwrap();
        let rx2 = pending.start(2).unwrap();

        pending.fail_all(|| "connection lost".to_string());
        assert!(pending.is_empty());
        assert_eq!(rx1.await.unwrap(), "connection lost");
        assert_eq!(rx2.await.unwrap(), "connection lost");
    }

    #[tokio::test]
    async fn concurrent_rpcs_resolve_independently() {
        let pending: std::sync::Arc<PendingRpcs<u32, String>> =
            std::sync::Arc::new(PendingRpcs::new());

        let mut handles = Vec::new();
        for id in 1..=3u32 {
            let pending = pending.clone();
            handles.push(tokio::spawn(async move {
                let rx = pending.start(id).unwrap();
                tokio::task::yield_now().await;
                pending.resolve(id, format!("result{id}"));
                rx.await.unwrap()
            }));
        }

        for (index, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), format!("result{}", index + 1));
        }
        assert!(pending.is_empty());
    }
}
