// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `RoboVac` Lib - a Rust client library for Roborock robot vacuums and
//! adjacent appliances.
//!
//! The library discovers the devices owned by an account, establishes
//! encrypted sessions to each one over two parallel transports (the
//! vendor's MQTT broker and a direct TCP connection on the LAN), and
//! exposes per-device RPC channels for issuing commands and observing
//! state.
//!
//! # Architecture
//!
//! ```text
//! DeviceManager ── owns ──> RoborockDevice (one per roster entry)
//!                                │
//!                 ┌──────────────┴──────────────┐
//!             V1Channel                  A01/B01 channel
//!          (dual transport)                (MQTT only)
//!           │           │                      │
//!      LocalChannel  MqttChannel ───────> MqttSession
//!       (TCP 58867)  (topic pair)       (one per account)
//!           └───────────┴── Codec: framing + V1 CBC / L01 GCM
//! ```
//!
//! Commands prefer the local transport when it is up and transparently
//! retry over MQTT when it is not. The account-wide [`mqtt::MqttSession`]
//! reference-counts topic subscriptions and keeps idle topics subscribed
//! for a grace period so short device dropouts do not thrash the broker.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use robovac_lib::devices::{HomeDataApi, create_device_manager};
//! use robovac_lib::types::{HomeData, UserParams};
//!
//! struct WebApi; // your HTTP client for the account API
//!
//! #[async_trait::async_trait]
//! impl HomeDataApi for WebApi {
//!     async fn get_home_data(&self) -> robovac_lib::Result<HomeData> {
//!         todo!("fetch https://.../v3/home")
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> robovac_lib::Result<()> {
//!     let user_params: UserParams = todo!("from your login flow");
//!     let manager = create_device_manager(user_params, Arc::new(WebApi)).await?;
//!
//!     for device in manager.get_devices()? {
//!         println!("{} connected={}", device.name(), device.is_connected());
//!         if let Some(rpc) = device.rpc_channel() {
//!             let status: robovac_lib::types::Status =
//!                 rpc.send_decoded_command("get_status", None).await?;
//!             println!("battery: {}%", status.battery);
//!         }
//!     }
//!
//!     manager.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Caching
//!
//! Network addresses, capability flags, and map snapshots can be
//! persisted through the [`devices::Cache`] seam; see
//! [`devices::FileCache`] for the file-backed store.

pub mod devices;
pub mod diagnostics;
pub mod error;
pub mod mqtt;
pub mod protocol;
pub mod subscription;
pub mod types;
pub mod util;

pub use devices::{DeviceManager, RoborockDevice, create_device_manager};
pub use error::{ApiError, CacheError, CodecError, Error, Result, SessionError};
pub use protocol::{Codec, Message, MessageProtocol, ProtocolVersion, SecurityData};
pub use subscription::Unsubscribe;
