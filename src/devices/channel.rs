// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The transport seam shared by both device channels.
//!
//! A [`DeviceChannel`] moves decoded [`Message`]s to and from one device
//! over one transport. [`MqttChannel`](super::MqttChannel) and
//! [`LocalChannel`](super::LocalChannel) both implement it, and the RPC
//! layer is written against the trait so tests can drive it with
//! in-memory fakes.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::protocol::Message;
use crate::subscription::Unsubscribe;

/// Callback receiving every decoded inbound message on a channel.
pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// A bidirectional, framed message transport to one device.
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    /// Establishes the transport.
    ///
    /// Channels without a connection phase (MQTT rides the account
    /// session) succeed immediately.
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Sends one message to the device.
    ///
    /// The channel stamps `seq`, `random`, and `timestamp` before
    /// encoding when the caller left them zero.
    async fn publish(&self, message: Message) -> Result<()>;

    /// Registers a callback for every successfully decoded inbound
    /// message. The channel never interprets message contents.
    async fn subscribe(&self, callback: MessageCallback) -> Result<Unsubscribe>;

    /// Latest known connection state.
    fn is_connected(&self) -> bool;

    /// Watches connection state changes.
    fn watch_connected(&self) -> watch::Receiver<bool>;

    /// Releases the transport; idempotent.
    async fn close(&self);
}
