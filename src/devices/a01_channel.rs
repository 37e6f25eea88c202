// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thin RPC wrapper for A01-family appliances.
//!
//! A01 devices answer queries with one or more messages, each carrying a
//! subset of the requested data point codes. The channel merges partial
//! answers until every queried code is present. Commands that query
//! nothing are fire-and-forget.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::protocol::a01;

use super::channel::DeviceChannel;

/// RPC response deadline.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Query-style RPC over one A01 device's MQTT channel.
pub struct A01Channel {
    mqtt: Arc<dyn DeviceChannel>,
    duid: String,
    timeout: Duration,
}

impl A01Channel {
    /// Creates the channel over the device's MQTT channel.
    #[must_use]
    pub fn new(mqtt: Arc<dyn DeviceChannel>, duid: impl Into<String>) -> Self {
        Self {
            mqtt,
            duid: duid.into(),
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

    /// Sends data point values, collecting answers for any queried ids.
    ///
    /// When `params` carries [`a01::ID_QUERY`], the returned map holds a
    /// value for every queried code, merged across response messages.
    /// Without a query the publish is fire-and-forget and the result is
    /// empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the queried codes are not fully
    /// answered within the deadline, or the underlying publish error.
    pub async fn send_command(
        &self,
        params: BTreeMap<u32, Value>,
    ) -> Result<BTreeMap<u32, Value>> {
        tracing::debug!(duid = %self.duid, ?params, "Sending A01 command");
        let message = a01::encode_request(&params, 0);

        let queried: BTreeSet<u32> = params
            .get(&a01::ID_QUERY)
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_u64)
                    .filter_map(|id| u32::try_from(id).ok())
                    .collect()
            })
            .unwrap_or_default();

        if queried.is_empty() {
            self.mqtt.publish(message).await?;
            return Ok(BTreeMap::new());
        }

        let collected: Arc<Mutex<BTreeMap<u32, Value>>> = Arc::new(Mutex::new(BTreeMap::new()));
        let complete = Arc::new(Notify::new());

        let cb_collected = collected.clone();
        let cb_complete = complete.clone();
        let cb_queried = queried.clone();
        let unsub = self
            .mqtt
            .subscribe(Arc::new(move |message: &crate::protocol::Message| {
                let Ok(values) = a01::decode_response(message) else {
                    return;
                };
                let mut collected = cb_collected.lock();
                for (code, value) in values {
                    if cb_queried.contains(&code) {
                        collected.insert(code, value);
                    }
                }
                if collected.len() == cb_queried.len() {
                    cb_complete.notify_one();
                }
            }))
            .await?;

        let result = async {
            self.mqtt.publish(message).await?;
            tokio::time::timeout(self.timeout, complete.notified())
                .await
                .map_err(|_| Error::Timeout(self.timeout))?;
            Ok(std::mem::take(&mut *collected.lock()))
        }
        .await;
        unsub.unsubscribe();

        if let Ok(values) = &result {
            tracing::debug!(duid = %self.duid, ?values, "Received A01 query response");
        }
        result
    }
}

impl std::fmt::Debug for A01Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("A01Channel")
            .field("duid", &self.duid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::watch;

    use crate::protocol::{Message, MessageProtocol, ProtocolVersion};
    use crate::subscription::Unsubscribe;

    use super::super::channel::MessageCallback;
    use super::*;

    struct FakeMqtt {
        subscribers: Mutex<Vec<MessageCallback>>,
        published: Mutex<Vec<Message>>,
        connected: watch::Sender<bool>,
        responses: Mutex<Vec<BTreeMap<u32, Value>>>,
    }

    impl FakeMqtt {
        fn new(responses: Vec<BTreeMap<u32, Value>>) -> Arc<Self> {
            Arc::new(Self {
                subscribers: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                connected: watch::channel(true).0,
                responses: Mutex::new(responses),
            })
        }

        fn response_message(values: &BTreeMap<u32, Value>) -> Message {
            let mut message = a01::encode_request(values, 1_700_000_000);
            message.protocol = MessageProtocol::RpcResponse;
            message
        }
    }

    #[async_trait]
    impl DeviceChannel for FakeMqtt {
        async fn publish(&self, message: Message) -> Result<()> {
            self.published.lock().push(message);
            let responses: Vec<_> = self.responses.lock().drain(..).collect();
            let subscribers: Vec<MessageCallback> =
                self.subscribers.lock().iter().cloned().collect();
            for response in responses {
                let message = Self::response_message(&response);
                for callback in &subscribers {
                    callback(&message);
                }
            }
            Ok(())
        }

        async fn subscribe(&self, callback: MessageCallback) -> Result<Unsubscribe> {
            self.subscribers.lock().push(callback);
            Ok(Unsubscribe::noop())
        }

        fn is_connected(&self) -> bool {
            *self.connected.borrow()
        }

        fn watch_connected(&self) -> watch::Receiver<bool> {
            self.connected.subscribe()
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn query_collects_all_requested_codes() {
        let mqtt = FakeMqtt::new(vec![
            BTreeMap::from([(200, json!(75))]),
            BTreeMap::from([(201, json!("drying"))]),
        ]);
        let channel = A01Channel::new(mqtt.clone(), "a01-device");

        let result = channel
            .send_command(BTreeMap::from([(a01::ID_QUERY, json!([200, 201]))]))
            .await
            .unwrap();

        assert_eq!(result[&200], json!(75));
        assert_eq!(result[&201], json!("drying"));
        // The request itself went out as an A01 frame.
        let published = mqtt.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].version, ProtocolVersion::A01);
    }

    #[tokio::test]
    async fn unqueried_codes_in_responses_are_ignored() {
        let mqtt = FakeMqtt::new(vec![BTreeMap::from([
            (200, json!(75)),
            (999, json!("noise")),
        ])]);
        let channel = A01Channel::new(mqtt, "a01-device");

        let result = channel
            .send_command(BTreeMap::from([(a01::ID_QUERY, json!([200]))]))
            .await
            .unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[&200], json!(75));
    }

    #[tokio::test]
    async fn command_without_query_is_fire_and_forget() {
        let mqtt = FakeMqtt::new(vec![]);
        let channel = A01Channel::new(mqtt.clone(), "a01-device");

        let result = channel
            .send_command(BTreeMap::from([(203, json!(1))]))
            .await
            .unwrap();

        assert!(result.is_empty());
        assert_eq!(mqtt.published.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_answers_time_out() {
        // Only one of the two queried codes is ever answered.
        let mqtt = FakeMqtt::new(vec![BTreeMap::from([(200, json!(75))])]);
        let channel = A01Channel::new(mqtt, "a01-device");

        let result = channel
            .send_command(BTreeMap::from([(a01::ID_QUERY, json!([200, 201]))]))
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
