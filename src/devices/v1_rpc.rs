// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RPC surfaces over a [`V1Channel`](super::V1Channel).
//!
//! Three flavors exist in composition: the default channel prefers the
//! local transport with one MQTT retry, the MQTT channel always uses the
//! cloud, and the map channel speaks the MAP_RESPONSE protocol whose
//! payload is a raw map blob rather than JSON.

use serde_json::Value;

use crate::error::Result;
use crate::protocol::v1::RpcValue;

use super::v1_channel::V1Channel;

/// Transport selection for a [`V1RpcChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RpcFlavor {
    /// Always publish over MQTT.
    Mqtt,
    /// Publish on the local channel when connected; retry once over
    /// MQTT on transport-level failure.
    LocalPreferred,
}

/// Request/response RPC over one device channel.
#[derive(Debug, Clone)]
pub struct V1RpcChannel {
    channel: V1Channel,
    flavor: RpcFlavor,
}

impl V1RpcChannel {
    pub(crate) fn new(channel: V1Channel, flavor: RpcFlavor) -> Self {
        Self { channel, flavor }
    }

    /// Sends a command and returns the raw result value.
    ///
    /// # Errors
    ///
    /// Returns transport errors, [`Error::Timeout`](crate::Error::Timeout)
    /// after the RPC deadline, [`Error::DeviceBusy`](crate::Error::DeviceBusy)
    /// when the device asks for a retry, and [`Error::Api`](crate::Error::Api)
    /// for device-reported failures.
    pub async fn send_command(&self, command: &str, params: Option<Value>) -> Result<Value> {
        self.channel.send_rpc(self.flavor, command, params).await
    }

    /// Sends a command and decodes the result into `T`.
    ///
    /// Accepts both a bare object result and a single-element array
    /// around it.
    ///
    /// # Errors
    ///
    /// As [`send_command`](Self::send_command), plus
    /// [`ApiError::UnexpectedShape`](crate::error::ApiError::UnexpectedShape)
    /// when the result does not fit `T`.
    pub async fn send_decoded_command<T: serde::de::DeserializeOwned>(
        &self,
        command: &str,
        params: Option<Value>,
    ) -> Result<T> {
        let value = self.send_command(command, params).await?;
        RpcValue::new(value).decode(command)
    }
}

/// Map-blob RPC; always MQTT.
#[derive(Debug, Clone)]
pub struct MapRpcChannel {
    channel: V1Channel,
}

impl MapRpcChannel {
    pub(crate) fn new(channel: V1Channel) -> Self {
        Self { channel }
    }

    /// Requests a map and returns the decrypted, decompressed bytes.
    ///
    /// # Errors
    ///
    /// Returns transport errors or a timeout; responses addressed to
    /// other clients are ignored while waiting.
    pub async fn send_command(&self, command: &str, params: Option<Value>) -> Result<Vec<u8>> {
        self.channel.send_map_rpc(command, params).await
    }
}
