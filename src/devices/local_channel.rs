// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Direct TCP channel to a device on the LAN.
//!
//! One TCP connection per device on port 58867. `connect()` runs the
//! HELLO handshake: a `1.0` HELLO first, and when the device stays
//! silent or answers garbage, one retry as `L01`. The nonce pair
//! exchanged in the handshake keys the L01 cipher for the rest of the
//! session. Any framing, crypto, or I/O error drops the connection;
//! reconnecting is the owner's job.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::protocol::{Codec, Message, MessageProtocol, ProtocolVersion, SessionNonces, StreamDecoder};
use crate::subscription::Unsubscribe;
use crate::util::Clock;

use super::channel::{DeviceChannel, MessageCallback};

/// TCP port devices listen on.
pub const LOCAL_PORT: u16 = 58_867;

/// TCP connect deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for one HELLO response before falling back.
const HELLO_TIMEOUT: Duration = Duration::from_millis(1500);
/// Keepalive interval on an established connection.
const PING_INTERVAL: Duration = Duration::from_secs(10);
/// Bounded send queue; a full queue fails the publish.
const SEND_QUEUE_CAPACITY: usize = 32;
/// Read buffer size for the receive loop.
const READ_BUFFER_SIZE: usize = 4096;

/// Factory producing a local channel for a device host address.
///
/// The device manager resolves the host at subscribe time (network info
/// comes in over MQTT), so channel construction is deferred behind this
/// factory. Tests substitute in-memory channels.
pub type LocalSession = Arc<dyn Fn(&str) -> Arc<dyn DeviceChannel> + Send + Sync>;

/// Creates the production [`LocalSession`] backed by TCP.
#[must_use]
pub fn tcp_local_session(
    local_key: String,
    duid: String,
    clock: Arc<dyn Clock>,
) -> LocalSession {
    Arc::new(move |host: &str| {
        Arc::new(LocalChannel::new(
            host,
            local_key.clone(),
            duid.clone(),
            clock.clone(),
        )) as Arc<dyn DeviceChannel>
    })
}

struct LocalInner {
    host: String,
    local_key: String,
    duid: String,
    clock: Arc<dyn Clock>,
    subscribers: Mutex<Vec<(u64, MessageCallback)>>,
    next_subscription: AtomicU64,
    seq: AtomicU32,
    connected: watch::Sender<bool>,
    protocol_version: Mutex<Option<ProtocolVersion>>,
    codec: Mutex<Codec>,
    send_queue: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// A single TCP connection to one device.
#[derive(Clone)]
pub struct LocalChannel {
    inner: Arc<LocalInner>,
}

impl LocalChannel {
    /// Creates a channel for a device at `host`; call
    /// [`connect`](DeviceChannel::connect) before publishing.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        local_key: impl Into<String>,
        duid: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let local_key = local_key.into();
        Self {
            inner: Arc::new(LocalInner {
                host: host.into(),
                codec: Mutex::new(Codec::new(local_key.clone())),
                local_key,
                duid: duid.into(),
                clock,
                subscribers: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                seq: AtomicU32::new(1),
                connected: watch::channel(false).0,
                protocol_version: Mutex::new(None),
                send_queue: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns the protocol version negotiated by the handshake.
    #[must_use]
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        *self.inner.protocol_version.lock()
    }

    /// Sends one HELLO and waits for the device's HELLO response.
    async fn hello_attempt(
        &self,
        read: &mut OwnedReadHalf,
        write: &mut OwnedWriteHalf,
        version: ProtocolVersion,
        connect_nonce: u32,
    ) -> Result<u32> {
        let codec = Codec::new(self.inner.local_key.clone());
        let hello = Message {
            version,
            seq: 1,
            random: connect_nonce,
            timestamp: self.inner.clock.unix_seconds(),
            protocol: MessageProtocol::HelloRequest,
            payload: Vec::new(),
        };
        let frame = codec.encode(&hello)?;
        write
            .write_all(&frame)
            .await
            .map_err(|err| Error::ConnectionLost(format!("HELLO write failed: {err}")))?;

        let mut decoder = StreamDecoder::new(codec);
        let response = tokio::time::timeout(HELLO_TIMEOUT, async {
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            loop {
                let n = read
                    .read(&mut buffer)
                    .await
                    .map_err(|err| Error::ConnectionLost(format!("HELLO read failed: {err}")))?;
                if n == 0 {
                    return Err(Error::ConnectionLost(
                        "connection closed during handshake".into(),
                    ));
                }
                for message in decoder.decode(&buffer[..n]) {
                    if message.protocol == MessageProtocol::HelloResponse {
                        return Ok(message.random);
                    }
                    tracing::debug!(
                        protocol = ?message.protocol,
                        "Ignoring non-HELLO message during handshake"
                    );
                }
            }
        })
        .await
        .map_err(|_| Error::Timeout(HELLO_TIMEOUT))??;
        Ok(response)
    }

    /// Runs the handshake with automatic V1 → L01 fallback.
    async fn handshake(
        &self,
        read: &mut OwnedReadHalf,
        write: &mut OwnedWriteHalf,
    ) -> Result<(ProtocolVersion, SessionNonces)> {
        let connect_nonce: u32 = rand::thread_rng().r#gen();

        match self
            .hello_attempt(read, write, ProtocolVersion::V1, connect_nonce)
            .await
        {
            Ok(ack_nonce) => Ok((
                ProtocolVersion::V1,
                SessionNonces {
                    connect: connect_nonce,
                    ack: ack_nonce,
                },
            )),
            Err(Error::Timeout(_) | Error::Codec(_)) => {
                tracing::debug!(
                    duid = %self.inner.duid,
                    "1.0 HELLO unanswered, retrying as L01"
                );
                let ack_nonce = self
                    .hello_attempt(read, write, ProtocolVersion::L01, connect_nonce)
                    .await?;
                Ok((
                    ProtocolVersion::L01,
                    SessionNonces {
                        connect: connect_nonce,
                        ack: ack_nonce,
                    },
                ))
            }
            Err(err) => Err(err),
        }
    }

    /// Marks the channel disconnected and drops the transport tasks.
    fn connection_lost(&self, reason: &str) {
        let was_connected = *self.inner.connected.borrow();
        let _ = self.inner.connected.send(false);
        *self.inner.send_queue.lock() = None;
        if was_connected {
            tracing::warn!(
                host = %self.inner.host,
                duid = %self.inner.duid,
                reason = %reason,
                "Connection lost to device"
            );
        }
    }

    /// Fans one inbound message out to every subscriber.
    fn dispatch(&self, message: &Message) {
        let callbacks: Vec<MessageCallback> = {
            let subscribers = self.inner.subscribers.lock();
            subscribers.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for callback in callbacks {
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
    }

    fn spawn_writer(&self, mut write: OwnedWriteHalf, mut queue: mpsc::Receiver<Vec<u8>>) {
        let channel = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if let Err(err) = write.write_all(&frame).await {
                    channel.connection_lost(&format!("write failed: {err}"));
                    return;
                }
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    fn spawn_pinger(&self) {
        let channel = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(PING_INTERVAL).await;
                if !channel.is_connected() {
                    return;
                }
                let ping = Message::new(MessageProtocol::PingRequest, Vec::new());
                match channel.publish(ping).await {
                    Ok(()) | Err(Error::ChannelBusy) => {}
                    Err(_) => return,
                }
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    fn spawn_reader(&self, mut read: OwnedReadHalf, codec: Codec) {
        let channel = self.clone();
        let handle = tokio::spawn(async move {
            let mut decoder = StreamDecoder::new(codec);
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            loop {
                match read.read(&mut buffer).await {
                    Ok(0) => {
                        channel.connection_lost("connection closed by device");
                        return;
                    }
                    Ok(n) => {
                        for message in decoder.decode(&buffer[..n]) {
                            channel.dispatch(&message);
                        }
                    }
                    Err(err) => {
                        channel.connection_lost(&format!("read failed: {err}"));
                        return;
                    }
                }
            }
        });
        self.inner.tasks.lock().push(handle);
    }
}

#[async_trait]
impl DeviceChannel for LocalChannel {
    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            tracing::warn!(host = %self.inner.host, "Already connected");
            return Ok(());
        }

        // A host may carry an explicit `ip:port`; the default device
        // port applies otherwise.
        let address = if self.inner.host.contains(':') {
            self.inner.host.clone()
        } else {
            format!("{}:{LOCAL_PORT}", self.inner.host)
        };
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address))
            .await
            .map_err(|_| Error::ConnectionLost(format!("Failed to connect to {address}: timed out")))?
            .map_err(|err| Error::ConnectionLost(format!("Failed to connect to {address}: {err}")))?;
        let (mut read, mut write) = stream.into_split();

        let (version, nonces) = self.handshake(&mut read, &mut write).await?;
        tracing::debug!(
            host = %self.inner.host,
            duid = %self.inner.duid,
            version = %version,
            "Local handshake complete"
        );

        let codec = Codec::with_nonces(self.inner.local_key.clone(), nonces);
        *self.inner.codec.lock() = codec.clone();
        *self.inner.protocol_version.lock() = Some(version);

        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        *self.inner.send_queue.lock() = Some(tx);
        self.spawn_writer(write, rx);
        self.spawn_reader(read, codec);
        let _ = self.inner.connected.send(true);
        self.spawn_pinger();
        Ok(())
    }

    async fn publish(&self, mut message: Message) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ConnectionLost("Not connected to device".into()));
        }
        if let Some(version) = *self.inner.protocol_version.lock() {
            message.version = version;
        }
        if message.seq == 0 {
            message.seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        }
        if message.random == 0 {
            message.random = rand::thread_rng().r#gen();
        }
        if message.timestamp == 0 {
            message.timestamp = self.inner.clock.unix_seconds();
        }

        let frame = self.inner.codec.lock().encode(&message)?;
        let sender = self
            .inner
            .send_queue
            .lock()
            .clone()
            .ok_or_else(|| Error::ConnectionLost("Not connected to device".into()))?;
        match sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::ChannelBusy),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::ConnectionLost("Not connected to device".into()))
            }
        }
    }

    async fn subscribe(&self, callback: MessageCallback) -> Result<Unsubscribe> {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, callback));

        let channel = self.clone();
        Ok(Unsubscribe::new(move || {
            channel
                .inner
                .subscribers
                .lock()
                .retain(|(sub_id, _)| *sub_id != id);
        }))
    }

    fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    fn watch_connected(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    async fn close(&self) {
        let _ = self.inner.connected.send(false);
        *self.inner.send_queue.lock() = None;
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        tracing::debug!(host = %self.inner.host, duid = %self.inner.duid, "Local channel closed");
    }
}

impl std::fmt::Debug for LocalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalChannel")
            .field("host", &self.inner.host)
            .field("duid", &self.inner.duid)
            .field("connected", &self.is_connected())
            .field("protocol_version", &*self.inner.protocol_version.lock())
            .finish()
    }
}
