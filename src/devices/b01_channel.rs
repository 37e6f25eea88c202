// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thin RPC wrapper for B01-family devices.
//!
//! B01 devices correlate by a string `msgId` and signal failures through
//! a numeric `code` in the response body. `*.get` commands must answer
//! with an object-shaped `data`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{ApiError, Error, Result};
use crate::protocol::b01;
use crate::util::RequestIdGenerator;

use super::channel::DeviceChannel;

/// RPC response deadline.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
/// B01 message id range; ids travel as 12-digit strings.
const MSG_ID_RANGE: (u64, u64) = (100_000_000_000, 999_999_999_999);

/// RPC over one B01 device's MQTT channel.
pub struct B01Channel {
    mqtt: Arc<dyn DeviceChannel>,
    duid: String,
    msg_ids: RequestIdGenerator,
    timeout: Duration,
}

impl B01Channel {
    /// Creates the channel over the device's MQTT channel.
    #[must_use]
    pub fn new(mqtt: Arc<dyn DeviceChannel>, duid: impl Into<String>) -> Self {
        Self {
            mqtt,
            duid: duid.into(),
            msg_ids: RequestIdGenerator::new(MSG_ID_RANGE.0, MSG_ID_RANGE.1),
            timeout: COMMAND_TIMEOUT,
        }
    }

    /// Returns the device id this channel serves.
    #[must_use]
    pub fn duid(&self) -> &str {
        &self.duid
    }

    /// Whether the underlying MQTT leg is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.mqtt.is_connected()
    }

    /// Sends a command under the given data point and awaits its answer.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::ErrorCode`] when the device reports a
    /// non-zero code, [`ApiError::UnexpectedShape`] when a `*.get`
    /// command answers without an object, and [`Error::Timeout`] after
    /// the deadline.
    pub async fn send_command(
        &self,
        dps: u32,
        command: &str,
        params: Value,
    ) -> Result<Value> {
        let msg_id = self.msg_ids.next_id().to_string();
        tracing::debug!(
            duid = %self.duid,
            dps,
            method = %command,
            msg_id = %msg_id,
            "Sending B01 command"
        );
        let message = b01::encode_request(dps, command, &params, &msg_id, 0);

        let (tx, rx) = oneshot::channel::<Result<Value>>();
        let sender = Arc::new(Mutex::new(Some(tx)));

        let cb_sender = sender.clone();
        let cb_msg_id = msg_id.clone();
        let cb_command = command.to_string();
        let unsub = self
            .mqtt
            .subscribe(Arc::new(move |message: &crate::protocol::Message| {
                let Ok(responses) = b01::decode_response(message) else {
                    return;
                };
                for response in responses {
                    if response.msg_id != cb_msg_id {
                        continue;
                    }
                    let outcome = if response.code != 0 {
                        Err(Error::Api(ApiError::ErrorCode {
                            code: response.code,
                            command: cb_command.clone(),
                        }))
                    } else if cb_command.ends_with(".get") && !response.data.is_object() {
                        Err(Error::Api(ApiError::UnexpectedShape {
                            command: cb_command.clone(),
                            message: format!("expected object data, got {}", response.data),
                        }))
                    } else {
                        Ok(response.data)
                    };
                    if let Some(tx) = cb_sender.lock().take() {
                        let _ = tx.send(outcome);
                    }
                }
            }))
            .await?;

        let result = async {
            self.mqtt.publish(message).await?;
            match tokio::time::timeout(self.timeout, rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(Error::Cancelled),
                Err(_) => Err(Error::Timeout(self.timeout)),
            }
        }
        .await;
        unsub.unsubscribe();
        result
    }
}

impl std::fmt::Debug for B01Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("B01Channel")
            .field("duid", &self.duid)
            .finish_non_exhaustive()
    }
}
