// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counters and latency timers for debugging.
//!
//! A [`Diagnostics`] handle tracks event counts and operation latencies
//! inside a subsystem. Handles are cheap to clone and share; nested
//! subsystems roll up into the parent when exported. Diagnostics data is
//! surfaced to callers through higher level APIs such as
//! [`DeviceManager::diagnostic_data`](crate::devices::DeviceManager::diagnostic_data).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// A shareable collector of counters and latency histograms.
///
/// Latencies are tracked as `<prefix>_count` / `<prefix>_sum` counter
/// pairs (sum in milliseconds), which is enough to derive averages while
/// keeping the export a flat integer map.
#[derive(Clone, Debug, Default)]
pub struct Diagnostics {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    counters: Mutex<BTreeMap<String, i64>>,
    children: Mutex<BTreeMap<String, Diagnostics>>,
}

impl Diagnostics {
    /// Creates a new, empty diagnostics collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter for the given key by one.
    pub fn increment(&self, key: &str) {
        self.increment_by(key, 1);
    }

    /// Increments the counter for the given key by `count`.
    pub fn increment_by(&self, key: &str, count: i64) {
        let mut counters = self.inner.counters.lock();
        *counters.entry(key.to_string()).or_insert(0) += count;
    }

    /// Records a latency sample for the given key prefix.
    pub fn elapsed(&self, key_prefix: &str, elapsed_ms: i64) {
        self.increment_by(&format!("{key_prefix}_count"), 1);
        self.increment_by(&format!("{key_prefix}_sum"), elapsed_ms);
    }

    /// Returns the sub-diagnostics for the given subsystem key.
    ///
    /// A new child collector is created on first use. Child data is
    /// nested under its key in [`as_value`](Self::as_value).
    #[must_use]
    pub fn subsystem(&self, key: &str) -> Diagnostics {
        let mut children = self.inner.children.lock();
        children.entry(key.to_string()).or_default().clone()
    }

    /// Starts a timer that records a latency sample when dropped.
    #[must_use]
    pub fn timer(&self, key_prefix: &str) -> DiagnosticsTimer {
        DiagnosticsTimer {
            diagnostics: self.clone(),
            key_prefix: key_prefix.to_string(),
            start: Instant::now(),
        }
    }

    /// Exports all counters and non-empty children as a JSON object.
    #[must_use]
    pub fn as_value(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (key, value) in self.inner.counters.lock().iter() {
            map.insert(key.clone(), serde_json::Value::from(*value));
        }
        for (key, child) in self.inner.children.lock().iter() {
            let value = child.as_value();
            if value.as_object().is_some_and(|m| !m.is_empty()) {
                map.insert(key.clone(), value);
            }
        }
        serde_json::Value::Object(map)
    }

    /// Returns the current value of a counter, if recorded.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<i64> {
        self.inner.counters.lock().get(key).copied()
    }

    /// Clears all counters and child diagnostics, for testing.
    pub fn reset(&self) {
        self.inner.counters.lock().clear();
        for child in self.inner.children.lock().values() {
            child.reset();
        }
    }
}

/// Records the elapsed time for a scope as a latency sample on drop.
#[must_use = "the timer records its sample when dropped"]
pub struct DiagnosticsTimer {
    diagnostics: Diagnostics,
    key_prefix: String,
    start: Instant,
}

impl Drop for DiagnosticsTimer {
    fn drop(&mut self) {
        let ms = i64::try_from(self.start.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.diagnostics.elapsed(&self.key_prefix, ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_counts_events() {
        let diagnostics = Diagnostics::new();
        diagnostics.increment("connect");
        diagnostics.increment("connect");
        diagnostics.increment_by("messages", 5);

        assert_eq!(diagnostics.get("connect"), Some(2));
        assert_eq!(diagnostics.get("messages"), Some(5));
        assert_eq!(diagnostics.get("unknown"), None);
    }

    #[test]
    fn elapsed_tracks_count_and_sum() {
        let diagnostics = Diagnostics::new();
        diagnostics.elapsed("rpc", 12);
        diagnostics.elapsed("rpc", 8);

        assert_eq!(diagnostics.get("rpc_count"), Some(2));
        assert_eq!(diagnostics.get("rpc_sum"), Some(20));
    }

    #[test]
    fn subsystem_nests_in_export() {
        let diagnostics = Diagnostics::new();
        diagnostics.increment("top");
        diagnostics.subsystem("mqtt").increment("publish");
        // Empty children are omitted from the export.
        let _ = diagnostics.subsystem("idle");

        let value = diagnostics.as_value();
        assert_eq!(value["top"], 1);
        assert_eq!(value["mqtt"]["publish"], 1);
        assert!(value.get("idle").is_none());
    }

    #[test]
    fn subsystem_is_shared() {
        let diagnostics = Diagnostics::new();
        let child = diagnostics.subsystem("mqtt");
        child.increment("publish");
        assert_eq!(diagnostics.subsystem("mqtt").get("publish"), Some(1));
    }

    #[test]
    fn timer_records_sample() {
        let diagnostics = Diagnostics::new();
        {
            let _timer = diagnostics.timer("op");
        }
        assert_eq!(diagnostics.get("op_count"), Some(1));
        assert!(diagnostics.get("op_sum").is_some());
    }

    #[test]
    fn reset_clears_everything() {
        let diagnostics = Diagnostics::new();
        diagnostics.increment("top");
        diagnostics.subsystem("mqtt").increment("publish");

        diagnostics.reset();
        assert_eq!(diagnostics.get("top"), None);
        assert_eq!(diagnostics.subsystem("mqtt").get("publish"), None);
    }
}
