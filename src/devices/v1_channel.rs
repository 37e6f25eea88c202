// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dual-transport channel for V1 devices.
//!
//! A [`V1Channel`] presents one RPC surface per device over two
//! transports: the account MQTT session and a direct TCP connection on
//! the LAN. Subscribing wires up MQTT, resolves the device's LAN address
//! (live over MQTT, else from the cache), and attempts the local
//! connection; a failed local setup degrades to MQTT-only and is not an
//! error. Commands prefer the local transport and retry once over MQTT
//! when it fails at the transport level.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::mqtt::HealthManager;
use crate::protocol::v1::{
    RequestMessage, RpcValue, SecurityData, commands, decode_map_response, decode_rpc_response,
};
use crate::protocol::{Message, MessageProtocol};
use crate::subscription::Unsubscribe;
use crate::types::NetworkInfo;
use crate::util::{Clock, RequestIdGenerator};

use super::cache::Cache;
use super::channel::{DeviceChannel, MessageCallback};
use super::local_channel::LocalSession;
use super::pending::PendingRpcs;
use super::v1_rpc::{MapRpcChannel, RpcFlavor, V1RpcChannel};

/// Default RPC response deadline.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
/// Request id range for JSON RPC.
const RPC_ID_RANGE: (u64, u64) = (10_000, 999_999);
/// Request id range for map RPC; map headers carry the id in 16 bits.
const MAP_ID_RANGE: (u64, u64) = (10_000, 32_767);

type RpcOutcome = Result<Value>;
type MapOutcome = Result<Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Mqtt,
    Local,
}

struct ChannelInner {
    duid: String,
    security: SecurityData,
    mqtt: Arc<dyn DeviceChannel>,
    local_session: LocalSession,
    local: Mutex<Option<Arc<dyn DeviceChannel>>>,
    cache: Arc<dyn Cache>,
    clock: Arc<dyn Clock>,
    ids: RequestIdGenerator,
    map_ids: RequestIdGenerator,
    pending: PendingRpcs<u32, RpcOutcome>,
    map_pending: PendingRpcs<u16, MapOutcome>,
    mqtt_unsub: Mutex<Option<Unsubscribe>>,
    local_unsub: Mutex<Option<Unsubscribe>>,
    external: Mutex<Option<MessageCallback>>,
    mqtt_health: Mutex<Option<HealthManager>>,
    local_health: Mutex<Option<HealthManager>>,
    diagnostics: Diagnostics,
    command_timeout: Mutex<Duration>,
}

/// One device's RPC surface over MQTT and local TCP.
///
/// Cheap to clone; all clones share the connections and pending tables.
#[derive(Clone)]
pub struct V1Channel {
    inner: Arc<ChannelInner>,
}

impl V1Channel {
    /// Creates the channel for one device.
    ///
    /// `local_session` defers local transport construction until the
    /// device's LAN address is known.
    #[must_use]
    pub fn new(
        duid: impl Into<String>,
        security: SecurityData,
        mqtt: Arc<dyn DeviceChannel>,
        local_session: LocalSession,
        cache: Arc<dyn Cache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let channel = Self {
            inner: Arc::new(ChannelInner {
                duid: duid.into(),
                security,
                mqtt,
                local_session,
                local: Mutex::new(None),
                cache,
                clock,
                ids: RequestIdGenerator::new(RPC_ID_RANGE.0, RPC_ID_RANGE.1),
                map_ids: RequestIdGenerator::new(MAP_ID_RANGE.0, MAP_ID_RANGE.1),
                pending: PendingRpcs::new(),
                map_pending: PendingRpcs::new(),
                mqtt_unsub: Mutex::new(None),
                local_unsub: Mutex::new(None),
                external: Mutex::new(None),
                mqtt_health: Mutex::new(None),
                local_health: Mutex::new(None),
                diagnostics: Diagnostics::new(),
                command_timeout: Mutex::new(COMMAND_TIMEOUT),
            }),
        };

        // Repeated local timeouts tear the LAN connection down and
        // rebuild it with fresh network info.
        let restart_target = channel.clone();
        let local_health = HealthManager::new(move || {
            let channel = restart_target.clone();
            async move {
                channel.restart_local().await;
            }
        });
        *channel.inner.local_health.lock() = Some(local_health);
        channel
    }

    /// Installs the health manager watching the MQTT transport.
    pub fn set_mqtt_health(&self, health: HealthManager) {
        *self.inner.mqtt_health.lock() = Some(health);
    }

    /// Overrides the RPC deadline.
    #[must_use]
    pub fn with_command_timeout(self, timeout: Duration) -> Self {
        *self.inner.command_timeout.lock() = timeout;
        self
    }

    fn command_timeout(&self) -> Duration {
        *self.inner.command_timeout.lock()
    }

    /// Returns the device id this channel serves.
    #[must_use]
    pub fn duid(&self) -> &str {
        &self.inner.duid
    }

    /// Returns this channel's diagnostics collector.
    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.inner.diagnostics
    }

    /// Whether the MQTT leg is subscribed and the session connected.
    #[must_use]
    pub fn is_mqtt_connected(&self) -> bool {
        self.inner.mqtt_unsub.lock().is_some() && self.inner.mqtt.is_connected()
    }

    /// Whether the local TCP leg is up.
    #[must_use]
    pub fn is_local_connected(&self) -> bool {
        self.inner
            .local
            .lock()
            .as_ref()
            .is_some_and(|local| local.is_connected())
    }

    /// The default RPC surface: local-preferred with MQTT retry.
    #[must_use]
    pub fn rpc_channel(&self) -> V1RpcChannel {
        V1RpcChannel::new(self.clone(), RpcFlavor::LocalPreferred)
    }

    /// RPC surface pinned to MQTT.
    #[must_use]
    pub fn mqtt_rpc_channel(&self) -> V1RpcChannel {
        V1RpcChannel::new(self.clone(), RpcFlavor::Mqtt)
    }

    /// Map-blob RPC surface; always MQTT.
    #[must_use]
    pub fn map_rpc_channel(&self) -> MapRpcChannel {
        MapRpcChannel::new(self.clone())
    }

    /// Attaches the single external subscriber and brings up transports.
    ///
    /// Messages from both transports reach `callback`. Local setup
    /// failures are logged and leave the channel MQTT-only.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::AlreadySubscribed`] when a subscriber is
    /// active, or with the MQTT subscribe error.
    pub async fn subscribe(
        &self,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<Unsubscribe> {
        {
            let mut external = self.inner.external.lock();
            if external.is_some() {
                return Err(Error::AlreadySubscribed);
            }
            *external = Some(Arc::new(callback));
        }

        let mqtt_unsub = match self
            .inner
            .mqtt
            .subscribe(self.message_dispatcher(Transport::Mqtt))
            .await
        {
            Ok(unsub) => unsub,
            Err(err) => {
                *self.inner.external.lock() = None;
                return Err(err);
            }
        };
        *self.inner.mqtt_unsub.lock() = Some(mqtt_unsub);

        if let Err(err) = self.local_connect(false).await {
            tracing::warn!(
                duid = %self.inner.duid,
                error = %err,
                "Could not establish local connection for device"
            );
            self.inner.diagnostics.increment("local_connect_failed");
        }

        let channel = self.clone();
        Ok(Unsubscribe::new(move || {
            channel.release_subscriptions();
        }))
    }

    /// Releases transports and pending work; idempotent.
    pub async fn close(&self) {
        self.release_subscriptions();
        let local = self.inner.local.lock().take();
        if let Some(local) = local {
            local.close().await;
        }
        self.inner.pending.fail_all(|| Err(Error::Cancelled));
        self.inner.map_pending.fail_all(|| Err(Error::Cancelled));
        self.inner.mqtt.close().await;
    }

    fn release_subscriptions(&self) {
        if let Some(unsub) = self.inner.mqtt_unsub.lock().take() {
            unsub.unsubscribe();
        }
        if let Some(unsub) = self.inner.local_unsub.lock().take() {
            unsub.unsubscribe();
        }
        *self.inner.external.lock() = None;
    }

    fn message_dispatcher(&self, transport: Transport) -> MessageCallback {
        let channel = self.clone();
        Arc::new(move |message: &Message| {
            channel.handle_message(transport, message);
        })
    }

    /// Fans a decoded message out to the subscriber and resolves any
    /// pending RPC it answers.
    fn handle_message(&self, transport: Transport, message: &Message) {
        if let Some(callback) = self.inner.external.lock().clone() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(message);
            }));
            if result.is_err() {
                tracing::error!(
                    duid = %self.inner.duid,
                    "Uncaught panic in message handler callback"
                );
            }
        }

        match message.protocol {
            MessageProtocol::RpcResponse | MessageProtocol::GeneralResponse => {
                match decode_rpc_response(message) {
                    Ok(response) => {
                        self.inner.pending.resolve(response.request_id, response.result);
                    }
                    Err(err) => {
                        tracing::debug!(
                            duid = %self.inner.duid,
                            transport = ?transport,
                            error = %err,
                            "Undecodable RPC response"
                        );
                    }
                }
            }
            MessageProtocol::MapResponse => {
                match decode_map_response(&self.inner.security, message) {
                    Ok(Some(map)) => {
                        self.inner.map_pending.resolve(map.request_id, Ok(map.data));
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::debug!(
                            duid = %self.inner.duid,
                            error = %err,
                            "Undecodable map response"
                        );
                    }
                }
            }
            _ => {}
        }
    }

    /// Resolves the device's LAN address: cache first, then a live
    /// `get_network_info` over MQTT whose result is persisted.
    ///
    /// With `refresh`, the live call runs first and the cache only
    /// serves as fallback when it fails.
    async fn network_info(&self, refresh: bool) -> Result<NetworkInfo> {
        let cached = self
            .inner
            .cache
            .get()
            .await
            .ok()
            .and_then(|data| data.network_info(&self.inner.duid).cloned());

        if !refresh && let Some(info) = cached.clone() {
            tracing::debug!(duid = %self.inner.duid, ip = %info.ip, "Using cached network info");
            return Ok(info);
        }

        match self.fetch_network_info().await {
            Ok(info) => {
                if let Err(err) = self.persist_network_info(&info).await {
                    tracing::warn!(duid = %self.inner.duid, error = %err, "Failed to cache network info");
                }
                Ok(info)
            }
            Err(err) => match cached {
                Some(info) => {
                    tracing::warn!(
                        duid = %self.inner.duid,
                        error = %err,
                        "Network info fetch failed, using cached address"
                    );
                    Ok(info)
                }
                None => Err(err),
            },
        }
    }

    async fn fetch_network_info(&self) -> Result<NetworkInfo> {
        let value = self
            .send_rpc(RpcFlavor::Mqtt, commands::GET_NETWORK_INFO, None)
            .await?;
        RpcValue::new(value).decode(commands::GET_NETWORK_INFO)
    }

    async fn persist_network_info(&self, info: &NetworkInfo) -> Result<()> {
        let mut data = self.inner.cache.get().await?;
        data.device_mut(&self.inner.duid).network_info = Some(info.clone());
        self.inner.cache.set(data).await?;
        self.inner.cache.flush().await
    }

    /// Opens and subscribes the local transport.
    async fn local_connect(&self, refresh: bool) -> Result<()> {
        let info = self.network_info(refresh).await?;
        let local = (self.inner.local_session)(&info.ip);
        local.connect().await?;
        let unsub = local
            .subscribe(self.message_dispatcher(Transport::Local))
            .await?;
        *self.inner.local.lock() = Some(local);
        *self.inner.local_unsub.lock() = Some(unsub);
        tracing::debug!(duid = %self.inner.duid, ip = %info.ip, "Local connection established");
        Ok(())
    }

    /// Drops the local leg and rebuilds it with fresh network info.
    pub(crate) async fn restart_local(&self) {
        if let Some(unsub) = self.inner.local_unsub.lock().take() {
            unsub.unsubscribe();
        }
        let local = self.inner.local.lock().take();
        if let Some(local) = local {
            local.close().await;
        }
        if let Err(err) = self.local_connect(true).await {
            tracing::warn!(
                duid = %self.inner.duid,
                error = %err,
                "Local restart failed, staying MQTT-only"
            );
        }
    }

    /// Errors that justify abandoning the local attempt and retrying
    /// the same request over MQTT.
    fn is_transport_error(err: &Error) -> bool {
        matches!(
            err,
            Error::ConnectionLost(_)
                | Error::Timeout(_)
                | Error::ChannelBusy
                | Error::Session(_)
                | Error::Codec(_)
        )
    }

    async fn note_health(&self, transport: Transport, outcome: &Result<Value>) {
        let health = match transport {
            Transport::Mqtt => self.inner.mqtt_health.lock().clone(),
            Transport::Local => self.inner.local_health.lock().clone(),
        };
        let Some(health) = health else { return };
        match outcome {
            Ok(_) => health.on_success(),
            Err(Error::Timeout(_)) => health.on_timeout().await,
            Err(_) => {}
        }
    }

    pub(crate) async fn send_rpc(
        &self,
        flavor: RpcFlavor,
        command: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        let _timer = self.inner.diagnostics.timer("send_command");
        let request_id = self.inner.ids.next_u32();
        let mut rx = self.inner.pending.start(request_id)?;
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id: request_id,
        };

        match flavor {
            RpcFlavor::Mqtt => {
                self.send_rpc_mqtt(request_id, command, params.as_ref(), &mut rx)
                    .await
            }
            RpcFlavor::LocalPreferred => {
                self.send_rpc_local_preferred(request_id, command, params.as_ref(), &mut rx)
                    .await
            }
        }
    }

    async fn send_rpc_mqtt(
        &self,
        request_id: u32,
        command: &str,
        params: Option<&Value>,
        rx: &mut oneshot::Receiver<RpcOutcome>,
    ) -> Result<Value> {
        let request = RequestMessage {
            request_id,
            command,
            params: params.cloned(),
        };
        let message = request.encode_message(
            MessageProtocol::RpcRequest,
            self.inner.clock.unix_seconds(),
            Some(&self.inner.security),
        );
        self.inner.mqtt.publish(message).await?;
        let outcome = self.await_rpc(rx, None).await;
        self.note_health(Transport::Mqtt, &outcome).await;
        outcome
    }

    async fn send_rpc_local_preferred(
        &self,
        request_id: u32,
        command: &str,
        params: Option<&Value>,
        rx: &mut oneshot::Receiver<RpcOutcome>,
    ) -> Result<Value> {
        let local = self
            .inner
            .local
            .lock()
            .clone()
            .filter(|local| local.is_connected());

        if let Some(local) = local {
            let request = RequestMessage {
                request_id,
                command,
                params: params.cloned(),
            };
            let message = request.encode_message(
                MessageProtocol::GeneralRequest,
                self.inner.clock.unix_seconds(),
                None,
            );
            let attempt: Result<Value> = async {
                local.publish(message).await?;
                self.await_rpc(rx, Some(local.watch_connected())).await
            }
            .await;
            self.note_health(Transport::Local, &attempt).await;
            match attempt {
                Ok(value) => return Ok(value),
                Err(err) if Self::is_transport_error(&err) => {
                    tracing::warn!(
                        duid = %self.inner.duid,
                        command = %command,
                        error = %err,
                        "Local command failed, retrying over MQTT"
                    );
                    self.inner.diagnostics.increment("local_fallback");
                }
                Err(err) => return Err(err),
            }
        }

        self.send_rpc_mqtt(request_id, command, params, rx).await
    }

    /// Waits for the response, a disconnect of the answering transport,
    /// or the deadline.
    async fn await_rpc(
        &self,
        rx: &mut oneshot::Receiver<RpcOutcome>,
        connection: Option<watch::Receiver<bool>>,
    ) -> Result<Value> {
        let timeout = self.command_timeout();
        match connection {
            Some(mut connected) => {
                tokio::select! {
                    outcome = &mut *rx => flatten(outcome),
                    () = wait_disconnected(&mut connected) => {
                        Err(Error::ConnectionLost(
                            "connection lost while awaiting response".into(),
                        ))
                    }
                    () = tokio::time::sleep(timeout) => Err(Error::Timeout(timeout)),
                }
            }
            None => {
                tokio::select! {
                    outcome = &mut *rx => flatten(outcome),
                    () = tokio::time::sleep(timeout) => Err(Error::Timeout(timeout)),
                }
            }
        }
    }

    pub(crate) async fn send_map_rpc(
        &self,
        command: &str,
        params: Option<Value>,
    ) -> Result<Vec<u8>> {
        let _timer = self.inner.diagnostics.timer("send_map_command");
        let request_id = u16::try_from(self.inner.map_ids.next_id()).unwrap_or(10_000);
        let mut rx = self.inner.map_pending.start(request_id)?;
        let _guard = PendingGuard {
            pending: &self.inner.map_pending,
            id: request_id,
        };

        let request = RequestMessage {
            request_id: u32::from(request_id),
            command,
            params,
        };
        let message = request.encode_message(
            MessageProtocol::RpcRequest,
            self.inner.clock.unix_seconds(),
            Some(&self.inner.security),
        );
        self.inner.mqtt.publish(message).await?;

        let timeout = self.command_timeout();
        tokio::select! {
            outcome = &mut rx => flatten(outcome),
            () = tokio::time::sleep(timeout) => Err(Error::Timeout(timeout)),
        }
    }
}

impl std::fmt::Debug for V1Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V1Channel")
            .field("duid", &self.inner.duid)
            .field("mqtt_connected", &self.is_mqtt_connected())
            .field("local_connected", &self.is_local_connected())
            .finish()
    }
}

fn flatten<T>(outcome: std::result::Result<Result<T>, oneshot::error::RecvError>) -> Result<T> {
    match outcome {
        Ok(result) => result,
        Err(_) => Err(Error::Cancelled),
    }
}

async fn wait_disconnected(connected: &mut watch::Receiver<bool>) {
    loop {
        if !*connected.borrow() {
            return;
        }
        if connected.changed().await.is_err() {
            return;
        }
    }
}

/// Removes the pending entry when the requester unwinds, so timeouts
/// and cancellation never leak table entries.
struct PendingGuard<'a, K, V>
where
    K: Eq + std::hash::Hash + Copy + std::fmt::Display + Send,
    V: Send,
{
    pending: &'a PendingRpcs<K, V>,
    id: K,
}

impl<K, V> Drop for PendingGuard<'_, K, V>
where
    K: Eq + std::hash::Hash + Copy + std::fmt::Display + Send,
    V: Send,
{
    fn drop(&mut self) {
        self.pending.pop(self.id);
    }
}
