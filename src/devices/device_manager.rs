// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Top-level device coordination.
//!
//! The [`DeviceManager`] owns an account's device roster: it reconciles
//! home data from the web API with the cache, builds the channel stack
//! matching each device's protocol family, runs the per-device connect
//! loops, and fans ready notifications out to the caller. The web API
//! itself stays behind the [`HomeDataApi`] seam.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::mqtt::{HealthManager, MqttParams, MqttSession, MqttSessionConfig, UnauthorizedHook};
use crate::protocol::v1::SecurityData;
use crate::types::{HomeData, HomeDataDevice, UserParams};
use crate::util::{Clock, SystemClock};

use super::a01_channel::A01Channel;
use super::b01_channel::B01Channel;
use super::cache::{Cache, NoCache};
use super::channel::DeviceChannel;
use super::device::{DeviceConnection, DeviceVersion, ReadyCallback, RoborockDevice};
use super::local_channel::tcp_local_session;
use super::mqtt_channel::MqttChannel;
use super::v1_channel::V1Channel;

/// Source of the account's home data.
///
/// The HTTPS web API is outside this library; integrations implement
/// this trait over their client and the manager consumes it for roster
/// discovery.
#[async_trait]
pub trait HomeDataApi: Send + Sync {
    /// Fetches the current home data for the account.
    async fn get_home_data(&self) -> Result<HomeData>;
}

struct ManagerInner {
    user_params: UserParams,
    api: Arc<dyn HomeDataApi>,
    cache: Arc<dyn Cache>,
    clock: Arc<dyn Clock>,
    mqtt_params: MqttParams,
    security: SecurityData,
    session: OnceCell<MqttSession>,
    session_override: Option<MqttSession>,
    mqtt_health: OnceLock<HealthManager>,
    devices: Mutex<HashMap<String, RoborockDevice>>,
    ready_callback: Option<ReadyCallback>,
    unauthorized_hook: Option<UnauthorizedHook>,
    diagnostics: Diagnostics,
    closed: AtomicBool,
}

/// Owns every device of one account.
///
/// Cheap to clone; all clones share the roster and the MQTT session.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<ManagerInner>,
}

/// Creates a manager with default options and discovers the roster.
///
/// # Errors
///
/// Fails when home data cannot be obtained from either the API or the
/// cache, when the broker rejects the derived credentials, or when a
/// device's initial connect fails with a non-retryable error.
pub async fn create_device_manager(
    user_params: UserParams,
    api: Arc<dyn HomeDataApi>,
) -> Result<DeviceManager> {
    DeviceManagerBuilder::new(user_params, api).build().await
}

/// Builder for a [`DeviceManager`].
pub struct DeviceManagerBuilder {
    user_params: UserParams,
    api: Arc<dyn HomeDataApi>,
    cache: Arc<dyn Cache>,
    clock: Arc<dyn Clock>,
    ready_callback: Option<ReadyCallback>,
    unauthorized_hook: Option<UnauthorizedHook>,
    session_override: Option<MqttSession>,
}

impl DeviceManagerBuilder {
    /// Starts a builder from account credentials and a home data source.
    #[must_use]
    pub fn new(user_params: UserParams, api: Arc<dyn HomeDataApi>) -> Self {
        Self {
            user_params,
            api,
            cache: Arc::new(NoCache),
            clock: Arc::new(SystemClock),
            ready_callback: None,
            unauthorized_hook: None,
            session_override: None,
        }
    }

    /// Uses the given cache for home data, network info, and features.
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = cache;
        self
    }

    /// Substitutes the wall clock, for deterministic tests.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Registers a callback fired when each device first connects.
    #[must_use]
    pub fn ready_callback(
        mut self,
        callback: impl Fn(&RoborockDevice) + Send + Sync + 'static,
    ) -> Self {
        self.ready_callback = Some(Arc::new(callback));
        self
    }

    /// Registers a hook fired when the broker rejects the credentials.
    #[must_use]
    pub fn unauthorized_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.unauthorized_hook = Some(Arc::new(hook));
        self
    }

    /// Substitutes a pre-built MQTT session, for tests.
    #[cfg(test)]
    pub(crate) fn session(mut self, session: MqttSession) -> Self {
        self.session_override = Some(session);
        self
    }

    /// Builds the manager and runs the initial device discovery.
    ///
    /// # Errors
    ///
    /// See [`create_device_manager`].
    pub async fn build(self) -> Result<DeviceManager> {
        let mqtt_params = MqttParams::from_user_data(&self.user_params.user_data)?;
        let security = SecurityData::generate(&self.user_params.user_data.rriot.k);

        let manager = DeviceManager {
            inner: Arc::new(ManagerInner {
                mqtt_params,
                security,
                api: self.api,
                cache: self.cache,
                clock: self.clock,
                session: OnceCell::new(),
                session_override: self.session_override,
                mqtt_health: OnceLock::new(),
                devices: Mutex::new(HashMap::new()),
                ready_callback: self.ready_callback,
                unauthorized_hook: self.unauthorized_hook,
                diagnostics: Diagnostics::new(),
                closed: AtomicBool::new(false),
                user_params: self.user_params,
            }),
        };
        manager.discover_devices(true).await?;
        Ok(manager)
    }
}

impl DeviceManager {
    /// Re-fetches home data and reconciles the device roster.
    ///
    /// With `prefer_cache`, cached home data short-circuits the API
    /// call; without it, the API is queried and the cache only serves as
    /// fallback on failure. Newly appearing devices get channel stacks
    /// and connect loops; disappearing devices are closed.
    ///
    /// # Errors
    ///
    /// Fails when no home data source is available or a new device's
    /// initial connect fails non-retryably.
    pub async fn discover_devices(&self, prefer_cache: bool) -> Result<Vec<RoborockDevice>> {
        self.inner.diagnostics.increment("discover_devices");
        let home_data = self.fetch_home_data(prefer_cache).await?;
        self.sync_devices(&home_data).await?;
        self.get_devices()
    }

    /// Returns every device in the roster.
    ///
    /// Never blocks on unconnected devices.
    ///
    /// # Errors
    ///
    /// Surfaces a device's parked non-retryable connect error once.
    pub fn get_devices(&self) -> Result<Vec<RoborockDevice>> {
        let devices: Vec<RoborockDevice> = self.inner.devices.lock().values().cloned().collect();
        for device in &devices {
            if let Some(err) = device.take_startup_error() {
                return Err(err);
            }
        }
        Ok(devices)
    }

    /// Looks up one device by duid.
    #[must_use]
    pub fn get_device(&self, duid: &str) -> Option<RoborockDevice> {
        self.inner.devices.lock().get(duid).cloned()
    }

    /// Exports counters and latency histograms for every subsystem.
    #[must_use]
    pub fn diagnostic_data(&self) -> serde_json::Value {
        let mut data = self.inner.diagnostics.as_value();
        let mut devices = serde_json::Map::new();
        for (duid, device) in self.inner.devices.lock().iter() {
            if let Some(channel) = device.v1_channel() {
                let value = channel.diagnostics().as_value();
                if value.as_object().is_some_and(|m| !m.is_empty()) {
                    devices.insert(duid.clone(), value);
                }
            }
        }
        if !devices.is_empty()
            && let Some(map) = data.as_object_mut()
        {
            map.insert("devices".into(), serde_json::Value::Object(devices));
        }
        data
    }

    /// Cancels connect loops, closes every channel, and closes the MQTT
    /// session; idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let devices: Vec<RoborockDevice> = {
            let mut map = self.inner.devices.lock();
            map.drain().map(|(_, device)| device).collect()
        };
        for device in devices {
            device.close().await;
        }
        let session = self
            .inner
            .session_override
            .clone()
            .or_else(|| self.inner.session.get().cloned());
        if let Some(session) = session {
            session.close().await;
        }
        tracing::debug!("Device manager closed");
    }

    /// The account MQTT session, opened on first demand.
    async fn session(&self) -> Result<MqttSession> {
        if let Some(session) = &self.inner.session_override {
            return Ok(session.clone());
        }
        self.inner
            .session
            .get_or_try_init(|| async {
                let mut config = MqttSessionConfig::new(self.inner.mqtt_params.clone());
                config.diagnostics = self.inner.diagnostics.subsystem("mqtt");
                config.unauthorized_hook = self.inner.unauthorized_hook.clone();
                MqttSession::start(config).await
            })
            .await
            .cloned()
    }

    fn mqtt_health(&self, session: &MqttSession) -> HealthManager {
        self.inner
            .mqtt_health
            .get_or_init(|| {
                let session = session.clone();
                HealthManager::new(move || {
                    let session = session.clone();
                    async move {
                        session.restart().await;
                    }
                })
            })
            .clone()
    }

    async fn fetch_home_data(&self, prefer_cache: bool) -> Result<HomeData> {
        if prefer_cache {
            let cached = self.inner.cache.get().await.ok().and_then(|d| d.home_data);
            if let Some(home_data) = cached {
                tracing::debug!("Using cached home data");
                return Ok(home_data);
            }
        }

        self.inner.diagnostics.increment("fetch_home_data");
        match self.inner.api.get_home_data().await {
            Ok(home_data) => {
                if let Ok(mut data) = self.inner.cache.get().await {
                    data.home_data = Some(home_data.clone());
                    let _ = self.inner.cache.set(data).await;
                    let _ = self.inner.cache.flush().await;
                }
                Ok(home_data)
            }
            Err(err) => {
                let cached = self.inner.cache.get().await.ok().and_then(|d| d.home_data);
                match cached {
                    Some(home_data) => {
                        tracing::warn!(error = %err, "Home data fetch failed, using cache");
                        Ok(home_data)
                    }
                    None => Err(err),
                }
            }
        }
    }

    /// Applies a roster to the device map: build and connect the new,
    /// close the gone.
    async fn sync_devices(&self, home_data: &HomeData) -> Result<()> {
        let session = self.session().await?;

        let roster: HashSet<String> = home_data
            .all_devices()
            .map(|device| device.duid.clone())
            .collect();

        let removed: Vec<RoborockDevice> = {
            let mut devices = self.inner.devices.lock();
            let gone: Vec<String> = devices
                .keys()
                .filter(|duid| !roster.contains(*duid))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|duid| devices.remove(&duid))
                .collect()
        };
        for device in removed {
            tracing::info!(duid = %device.duid(), "Device left the roster, closing");
            device.close().await;
        }

        let mut new_devices = Vec::new();
        for info in home_data.all_devices() {
            if self.inner.devices.lock().contains_key(&info.duid) {
                continue;
            }
            let device = self.create_device(&session, info, home_data);
            if let Some(callback) = &self.inner.ready_callback {
                device.add_ready_callback(callback.clone());
            }
            self.inner
                .devices
                .lock()
                .insert(info.duid.clone(), device.clone());
            new_devices.push(device);
        }

        // First attempts run concurrently; a retryable failure moves the
        // device to its background loop, anything else aborts startup.
        let mut attempts = tokio::task::JoinSet::new();
        for device in new_devices {
            attempts.spawn(async move {
                match device.connect_once().await {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_retryable() => {
                        tracing::debug!(
                            duid = %device.duid(),
                            error = %err,
                            "Initial connect failed, retrying in background"
                        );
                        device.spawn_connect_loop();
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            });
        }
        while let Some(joined) = attempts.join_next().await {
            joined.map_err(|err| Error::FatalStartup(err.to_string()))??;
        }
        Ok(())
    }

    /// Builds the channel stack matching a device's protocol family.
    fn create_device(
        &self,
        session: &MqttSession,
        info: &HomeDataDevice,
        home_data: &HomeData,
    ) -> RoborockDevice {
        let version = DeviceVersion::from_pv(&info.pv);
        if version == DeviceVersion::Unknown {
            tracing::warn!(
                duid = %info.duid,
                pv = %info.pv,
                "Unknown protocol version, treating as v1"
            );
        }

        let mqtt_channel: Arc<dyn DeviceChannel> = Arc::new(MqttChannel::new(
            session.clone(),
            &info.duid,
            &self.inner.user_params.user_data.rriot.u,
            &self.inner.mqtt_params.username,
            &info.local_key,
            self.inner.clock.clone(),
        ));

        let connection = if version.is_v1_family() {
            let local_session = tcp_local_session(
                info.local_key.clone(),
                info.duid.clone(),
                self.inner.clock.clone(),
            );
            let channel = V1Channel::new(
                &info.duid,
                self.inner.security.clone(),
                mqtt_channel,
                local_session,
                self.inner.cache.clone(),
                self.inner.clock.clone(),
            );
            channel.set_mqtt_health(self.mqtt_health(session));
            DeviceConnection::V1(channel)
        } else if version == DeviceVersion::A01 {
            DeviceConnection::A01 {
                channel: Arc::new(A01Channel::new(mqtt_channel.clone(), &info.duid)),
                mqtt: mqtt_channel,
            }
        } else {
            DeviceConnection::B01 {
                channel: Arc::new(B01Channel::new(mqtt_channel.clone(), &info.duid)),
                mqtt: mqtt_channel,
            }
        };

        RoborockDevice::new(
            info.clone(),
            home_data.product(&info.product_id).cloned(),
            version,
            connection,
            self.inner.cache.clone(),
            self.inner.diagnostics.subsystem("device"),
        )
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("devices", &self.inner.devices.lock().len())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}
