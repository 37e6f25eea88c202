// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Connection health tracking.
//!
//! Channels report command outcomes to a [`HealthManager`]; a run of
//! consecutive timeouts restarts the underlying connection, subject to a
//! cooldown so a dead device cannot keep a session flapping.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Consecutive timeouts before a restart is requested.
const DEFAULT_TIMEOUT_THRESHOLD: u32 = 3;
/// Minimum spacing between restarts.
const DEFAULT_RESTART_COOLDOWN: Duration = Duration::from_secs(30 * 60);

type RestartFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Restarts a connection after repeated command timeouts.
#[derive(Clone)]
pub struct HealthManager {
    restart: RestartFn,
    threshold: u32,
    cooldown: Duration,
    state: Arc<Mutex<HealthState>>,
}

#[derive(Debug, Default)]
struct HealthState {
    consecutive_timeouts: u32,
    last_restart: Option<Instant>,
}

impl HealthManager {
    /// Creates a health manager invoking `restart` after the default
    /// three consecutive timeouts, at most once per 30-minute cooldown.
    pub fn new<F, Fut>(restart: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::with_limits(restart, DEFAULT_TIMEOUT_THRESHOLD, DEFAULT_RESTART_COOLDOWN)
    }

    /// Creates a health manager with explicit threshold and cooldown.
    pub fn with_limits<F, Fut>(restart: F, threshold: u32, cooldown: Duration) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            restart: Arc::new(move || Box::pin(restart())),
            threshold,
            cooldown,
            state: Arc::new(Mutex::new(HealthState::default())),
        }
    }

    /// Records a command timeout; may trigger a restart.
    pub async fn on_timeout(&self) {
        let restart = {
            let mut state = self.state.lock();
            state.consecutive_timeouts += 1;
            if state.consecutive_timeouts < self.threshold {
                return;
            }
            state.consecutive_timeouts = 0;
            let now = Instant::now();
            let in_cooldown = state
                .last_restart
                .is_some_and(|last| now.duration_since(last) < self.cooldown);
            if in_cooldown {
                tracing::debug!("Restart suppressed by cooldown");
                None
            } else {
                state.last_restart = Some(now);
                Some(self.restart.clone())
            }
        };
        if let Some(restart) = restart {
            tracing::warn!("Consecutive command timeouts, restarting connection");
            restart().await;
        }
    }

    /// Records a successful command, resetting the timeout run.
    pub fn on_success(&self) {
        self.state.lock().consecutive_timeouts = 0;
    }
}

impl std::fmt::Debug for HealthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("HealthManager")
            .field("threshold", &self.threshold)
            .field("cooldown", &self.cooldown)
            .field("consecutive_timeouts", &state.consecutive_timeouts)
            .finish()
    }
}
