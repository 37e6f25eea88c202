// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device handles.
//!
//! A [`RoborockDevice`] owns the channel stack for one device and its
//! connect lifecycle: the first successful connect marks the device
//! ready and fires ready callbacks; transport failures retry with
//! exponential backoff in a background task; a non-retryable failure
//! parks the error for the manager to surface on the next query.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::protocol::v1::commands;
use crate::subscription::Unsubscribe;
use crate::types::{DeviceFeatures, HomeDataDevice, HomeDataProduct};

use super::a01_channel::A01Channel;
use super::b01_channel::B01Channel;
use super::cache::Cache;
use super::channel::DeviceChannel;
use super::v1_channel::V1Channel;
use super::v1_rpc::{MapRpcChannel, V1RpcChannel};

/// First retry delay of the connect loop.
const MIN_BACKOFF: Duration = Duration::from_secs(1);
/// Retry delay cap of the connect loop.
const MAX_BACKOFF: Duration = Duration::from_secs(10 * 60);

/// Callback fired when a device completes its first connect.
pub type ReadyCallback = Arc<dyn Fn(&RoborockDevice) + Send + Sync>;

/// Protocol family parsed from the roster's `pv` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceVersion {
    /// The v1 protocol family (`1.0`).
    V1,
    /// The A01 appliance family.
    A01,
    /// The B01 appliance family.
    B01,
    /// v1-family devices speaking the L01 local cipher.
    L01,
    /// Anything this library does not recognize.
    Unknown,
}

impl DeviceVersion {
    /// Parses a roster `pv` value.
    #[must_use]
    pub fn from_pv(pv: &str) -> Self {
        match pv {
            "1.0" => Self::V1,
            "A01" => Self::A01,
            "B01" => Self::B01,
            "L01" => Self::L01,
            _ => Self::Unknown,
        }
    }

    /// Whether this family uses the dual-transport V1 channel stack.
    #[must_use]
    pub fn is_v1_family(self) -> bool {
        matches!(self, Self::V1 | Self::L01 | Self::Unknown)
    }
}

/// The channel stack wired for one device.
pub(crate) enum DeviceConnection {
    /// Dual-transport stack for v1-family devices.
    V1(V1Channel),
    /// MQTT-only stack for A01 appliances.
    A01 {
        channel: Arc<A01Channel>,
        mqtt: Arc<dyn DeviceChannel>,
    },
    /// MQTT-only stack for B01 devices.
    B01 {
        channel: Arc<B01Channel>,
        mqtt: Arc<dyn DeviceChannel>,
    },
}

struct DeviceInner {
    device_info: HomeDataDevice,
    product_info: Option<HomeDataProduct>,
    version: DeviceVersion,
    connection: DeviceConnection,
    cache: Arc<dyn Cache>,
    ready: AtomicBool,
    ready_callbacks: Mutex<Vec<ReadyCallback>>,
    subscription: Mutex<Option<Unsubscribe>>,
    connect_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    startup_error: Mutex<Option<Error>>,
    features: Mutex<Option<DeviceFeatures>>,
    diagnostics: Diagnostics,
    closed: AtomicBool,
}

/// One device owned by the device manager.
///
/// Cheap to clone; all clones share the channel stack.
#[derive(Clone)]
pub struct RoborockDevice {
    inner: Arc<DeviceInner>,
}

impl RoborockDevice {
    pub(crate) fn new(
        device_info: HomeDataDevice,
        product_info: Option<HomeDataProduct>,
        version: DeviceVersion,
        connection: DeviceConnection,
        cache: Arc<dyn Cache>,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                device_info,
                product_info,
                version,
                connection,
                cache,
                ready: AtomicBool::new(false),
                ready_callbacks: Mutex::new(Vec::new()),
                subscription: Mutex::new(None),
                connect_task: Mutex::new(None),
                startup_error: Mutex::new(None),
                features: Mutex::new(None),
                diagnostics,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the device unique id.
    #[must_use]
    pub fn duid(&self) -> &str {
        &self.inner.device_info.duid
    }

    /// Returns the device display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.device_info.name
    }

    /// Returns the protocol family of this device.
    #[must_use]
    pub fn device_version(&self) -> DeviceVersion {
        self.inner.version
    }

    /// Returns the product entry from the roster, when known.
    #[must_use]
    pub fn product(&self) -> Option<&HomeDataProduct> {
        self.inner.product_info.as_ref()
    }

    /// Whether the device completed its first connect and its transport
    /// is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        if !self.inner.ready.load(Ordering::SeqCst) {
            return false;
        }
        match &self.inner.connection {
            DeviceConnection::V1(channel) => channel.is_mqtt_connected(),
            DeviceConnection::A01 { channel, .. } => channel.is_connected(),
            DeviceConnection::B01 { channel, .. } => channel.is_connected(),
        }
    }

    /// The dual-transport channel of a v1-family device.
    #[must_use]
    pub fn v1_channel(&self) -> Option<&V1Channel> {
        match &self.inner.connection {
            DeviceConnection::V1(channel) => Some(channel),
            _ => None,
        }
    }

    /// The default RPC surface of a v1-family device.
    #[must_use]
    pub fn rpc_channel(&self) -> Option<V1RpcChannel> {
        self.v1_channel().map(V1Channel::rpc_channel)
    }

    /// The MQTT-pinned RPC surface of a v1-family device.
    #[must_use]
    pub fn mqtt_rpc_channel(&self) -> Option<V1RpcChannel> {
        self.v1_channel().map(V1Channel::mqtt_rpc_channel)
    }

    /// The map RPC surface of a v1-family device.
    #[must_use]
    pub fn map_rpc_channel(&self) -> Option<MapRpcChannel> {
        self.v1_channel().map(V1Channel::map_rpc_channel)
    }

    /// The A01 channel of an A01-family device.
    #[must_use]
    pub fn a01_channel(&self) -> Option<Arc<A01Channel>> {
        match &self.inner.connection {
            DeviceConnection::A01 { channel, .. } => Some(channel.clone()),
            _ => None,
        }
    }

    /// The B01 channel of a B01-family device.
    #[must_use]
    pub fn b01_channel(&self) -> Option<Arc<B01Channel>> {
        match &self.inner.connection {
            DeviceConnection::B01 { channel, .. } => Some(channel.clone()),
            _ => None,
        }
    }

    /// Capability flags discovered on first connect, when available.
    #[must_use]
    pub fn device_features(&self) -> Option<DeviceFeatures> {
        self.inner.features.lock().clone()
    }

    /// Registers a ready callback.
    ///
    /// A callback registered after the device is already ready fires
    /// immediately.
    pub fn add_ready_callback(&self, callback: ReadyCallback) {
        if self.inner.ready.load(Ordering::SeqCst) {
            callback(self);
        } else {
            self.inner.ready_callbacks.lock().push(callback);
        }
    }

    /// Takes the parked non-retryable connect error, if any.
    pub(crate) fn take_startup_error(&self) -> Option<Error> {
        self.inner.startup_error.lock().take()
    }

    /// One connect attempt: subscribe the channel stack and, for
    /// v1-family devices, discover capabilities.
    pub(crate) async fn connect_once(&self) -> Result<()> {
        match &self.inner.connection {
            DeviceConnection::V1(channel) => {
                if self.inner.subscription.lock().is_none() {
                    let duid = self.duid().to_string();
                    let unsub = channel
                        .subscribe(move |message| {
                            tracing::trace!(
                                duid = %duid,
                                protocol = ?message.protocol,
                                "Device message"
                            );
                        })
                        .await?;
                    *self.inner.subscription.lock() = Some(unsub);
                }
                self.discover_features(channel).await?;
            }
            DeviceConnection::A01 { mqtt, .. } | DeviceConnection::B01 { mqtt, .. } => {
                if self.inner.subscription.lock().is_none() {
                    let duid = self.duid().to_string();
                    let unsub = mqtt
                        .subscribe(Arc::new(move |message: &crate::protocol::Message| {
                            tracing::trace!(
                                duid = %duid,
                                protocol = ?message.protocol,
                                "Device message"
                            );
                        }))
                        .await?;
                    *self.inner.subscription.lock() = Some(unsub);
                }
            }
        }
        self.inner.diagnostics.increment("connect");
        self.mark_ready();
        Ok(())
    }

    /// Loads cached capability flags or queries them from the device.
    ///
    /// Devices that do not answer `app_get_init_status` stay usable;
    /// only transport failures propagate so the connect loop retries.
    async fn discover_features(&self, channel: &V1Channel) -> Result<()> {
        if self.inner.features.lock().is_some() {
            return Ok(());
        }
        let cached = self
            .inner
            .cache
            .get()
            .await
            .ok()
            .and_then(|data| data.device(self.duid()).and_then(|e| e.device_features.clone()));
        if let Some(features) = cached {
            *self.inner.features.lock() = Some(features);
            return Ok(());
        }

        match channel
            .mqtt_rpc_channel()
            .send_command(commands::APP_GET_INIT_STATUS, None)
            .await
        {
            Ok(value) => match DeviceFeatures::from_init_status(&value) {
                Ok(features) => {
                    *self.inner.features.lock() = Some(features.clone());
                    if let Ok(mut data) = self.inner.cache.get().await {
                        data.device_mut(self.duid()).device_features = Some(features);
                        let _ = self.inner.cache.set(data).await;
                        let _ = self.inner.cache.flush().await;
                    }
                    Ok(())
                }
                Err(err) => {
                    tracing::warn!(duid = %self.duid(), error = %err, "Unparseable init status");
                    Ok(())
                }
            },
            Err(err) if err.is_retryable() => Err(err),
            Err(err) => {
                tracing::warn!(
                    duid = %self.duid(),
                    error = %err,
                    "Device does not report init status"
                );
                Ok(())
            }
        }
    }

    fn mark_ready(&self) {
        if self.inner.ready.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(duid = %self.duid(), name = %self.name(), "Device ready");
        let callbacks: Vec<ReadyCallback> = self.inner.ready_callbacks.lock().drain(..).collect();
        for callback in callbacks {
            callback(self);
        }
    }

    /// Spawns the background retry loop after a failed first attempt.
    pub(crate) fn spawn_connect_loop(&self) {
        let device = self.clone();
        let handle = tokio::spawn(async move {
            let mut backoff = MIN_BACKOFF;
            loop {
                if device.inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(backoff).await;
                match device.connect_once().await {
                    Ok(()) => return,
                    Err(err) if err.is_retryable() => {
                        tracing::debug!(
                            duid = %device.duid(),
                            error = %err,
                            retry_in = ?backoff,
                            "Connect attempt failed"
                        );
                        device.inner.diagnostics.increment("connect_retry");
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                    Err(err) => {
                        tracing::warn!(
                            duid = %device.duid(),
                            error = %err,
                            "Connect failed with a non-retryable error"
                        );
                        *device.inner.startup_error.lock() = Some(err);
                        return;
                    }
                }
            }
        });
        *self.inner.connect_task.lock() = Some(handle);
    }

    /// Stops the connect loop and releases the channel stack; idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.inner.connect_task.lock().take() {
            task.abort();
        }
        if let Some(unsub) = self.inner.subscription.lock().take() {
            unsub.unsubscribe();
        }
        match &self.inner.connection {
            DeviceConnection::V1(channel) => channel.close().await,
            DeviceConnection::A01 { mqtt, .. } | DeviceConnection::B01 { mqtt, .. } => {
                mqtt.close().await;
            }
        }
        tracing::debug!(duid = %self.duid(), "Device closed");
    }
}

impl std::fmt::Debug for RoborockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoborockDevice")
            .field("duid", &self.duid())
            .field("name", &self.name())
            .field("version", &self.inner.version)
            .field("connected", &self.is_connected())
            .finish()
    }
}
