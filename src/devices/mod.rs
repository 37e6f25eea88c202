// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device channels, caching, and the device manager.
//!
//! The layering, bottom up: [`DeviceChannel`] is the transport seam,
//! implemented by [`MqttChannel`] (the device's topic pair on the
//! account session) and [`LocalChannel`] (direct TCP with the HELLO
//! handshake). [`V1Channel`] composes both under one RPC surface with
//! local-preferred routing; [`A01Channel`] and [`B01Channel`] cover the
//! appliance families that only speak MQTT. [`DeviceManager`] owns the
//! roster and the per-device connect lifecycles.

mod a01_channel;
mod b01_channel;
pub mod cache;
mod channel;
mod device;
mod device_manager;
mod local_channel;
mod mqtt_channel;
mod pending;
mod v1_channel;
mod v1_rpc;

pub use a01_channel::A01Channel;
pub use b01_channel::B01Channel;
pub use cache::{Cache, CacheData, CacheFormat, DeviceCacheEntry, FileCache, InMemoryCache, MapInfo, NoCache};
pub use channel::{DeviceChannel, MessageCallback};
pub use device::{DeviceVersion, ReadyCallback, RoborockDevice};
pub use device_manager::{DeviceManager, DeviceManagerBuilder, HomeDataApi, create_device_manager};
pub use local_channel::{LOCAL_PORT, LocalChannel, LocalSession, tcp_local_session};
pub use mqtt_channel::MqttChannel;
pub use pending::PendingRpcs;
pub use v1_channel::V1Channel;
pub use v1_rpc::{MapRpcChannel, V1RpcChannel};
