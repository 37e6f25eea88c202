// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device MQTT channel.
//!
//! Narrows the account-wide [`MqttSession`] down to one device's topic
//! pair and the device's `local_key` crypto. Commands go out on
//! `rr/m/i/{rriot.u}/{username}/{duid}` and responses arrive on
//! `rr/m/o/{rriot.u}/{username}/{duid}` as length-prefixed frames.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;

use crate::error::Result;
use crate::mqtt::MqttSession;
use crate::protocol::{Codec, Message};
use crate::subscription::Unsubscribe;
use crate::util::Clock;

use super::channel::{DeviceChannel, MessageCallback};

/// One device's window onto the account MQTT session.
pub struct MqttChannel {
    session: MqttSession,
    duid: String,
    publish_topic: String,
    subscribe_topic: String,
    codec: Codec,
    clock: Arc<dyn Clock>,
    seq: AtomicU32,
}

impl MqttChannel {
    /// Creates the channel for one device.
    ///
    /// `rriot_u` is the account MQTT user id and `username` the derived
    /// broker username; together with the duid they form the topic pair.
    pub fn new(
        session: MqttSession,
        duid: impl Into<String>,
        rriot_u: &str,
        username: &str,
        local_key: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let duid = duid.into();
        Self {
            publish_topic: format!("rr/m/i/{rriot_u}/{username}/{duid}"),
            subscribe_topic: format!("rr/m/o/{rriot_u}/{username}/{duid}"),
            session,
            codec: Codec::new(local_key),
            clock,
            seq: AtomicU32::new(1),
            duid,
        }
    }

    /// Returns the device id this channel serves.
    #[must_use]
    pub fn duid(&self) -> &str {
        &self.duid
    }
}

#[async_trait]
impl DeviceChannel for MqttChannel {
    async fn publish(&self, mut message: Message) -> Result<()> {
        if message.seq == 0 {
            message.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        }
        if message.random == 0 {
            message.random = rand::thread_rng().r#gen();
        }
        if message.timestamp == 0 {
            message.timestamp = self.clock.unix_seconds();
        }
        let payload = self.codec.encode_mqtt(&message)?;
        tracing::debug!(
            duid = %self.duid,
            topic = %self.publish_topic,
            protocol = ?message.protocol,
            "Publishing MQTT message"
        );
        self.session.publish(&self.publish_topic, payload).await
    }

    async fn subscribe(&self, callback: MessageCallback) -> Result<Unsubscribe> {
        let codec = self.codec.clone();
        let duid = self.duid.clone();
        self.session
            .subscribe(&self.subscribe_topic, move |payload| {
                match codec.decode_mqtt(payload) {
                    Ok(messages) => {
                        for message in messages {
                            callback(&message);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(duid = %duid, error = %err, "Failed to decode MQTT message");
                    }
                }
            })
            .await
    }

    fn is_connected(&self) -> bool {
        self.session.connected()
    }

    fn watch_connected(&self) -> watch::Receiver<bool> {
        self.session.watch_connected()
    }

    async fn close(&self) {
        // Subscriptions are released through their handles; the session
        // itself belongs to the account and outlives this device.
        tracing::debug!(duid = %self.duid, "MQTT channel closed");
    }
}

impl std::fmt::Debug for MqttChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttChannel")
            .field("duid", &self.duid)
            .field("publish_topic", &self.publish_topic)
            .field("subscribe_topic", &self.subscribe_topic)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::protocol::MessageProtocol;
    use crate::util::SystemClock;

    use super::*;

    fn channel_with_session() -> (MqttChannel, MqttSession, Arc<FakeBroker>) {
        let broker = Arc::new(FakeBroker::default());
        let session = MqttSession::new_for_test(broker.clone(), Duration::from_secs(60));
        let channel = MqttChannel::new(
            session.clone(),
            "abc123",
            "user123",
            "hashed99",
            "local_key",
            Arc::new(SystemClock),
        );
        (channel, session, broker)
    }

    #[derive(Default)]
    struct FakeBroker {
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl crate::mqtt::session::MqttIo for FakeBroker {
        async fn subscribe(&self, _topic: &str) -> std::result::Result<(), crate::error::SessionError> {
            Ok(())
        }

        async fn unsubscribe(
            &self,
            _topic: &str,
        ) -> std::result::Result<(), crate::error::SessionError> {
            Ok(())
        }

        async fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
        ) -> std::result::Result<(), crate::error::SessionError> {
            self.published.lock().push((topic.to_string(), payload));
            Ok(())
        }

        async fn disconnect(&self) {}
    }

    #[test]
    fn topics_follow_the_device_pattern() {
        let (channel, _session, _broker) = channel_with_session();
        assert_eq!(channel.publish_topic, "rr/m/i/user123/hashed99/abc123");
        assert_eq!(channel.subscribe_topic, "rr/m/o/user123/hashed99/abc123");
    }

    #[tokio::test]
    async fn publish_encodes_and_stamps_header() {
        let (channel, _session, broker) = channel_with_session();

        let message = Message::new(MessageProtocol::RpcRequest, b"{\"dps\":{}}".to_vec());
        channel.publish(message).await.unwrap();

        let published = broker.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "rr/m/i/user123/hashed99/abc123");

        let decoded = Codec::new("local_key").decode_mqtt(&published[0].1).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].payload, b"{\"dps\":{}}");
        assert_ne!(decoded[0].seq, 0);
        assert_ne!(decoded[0].timestamp, 0);
    }

    #[tokio::test]
    async fn subscribe_decodes_inbound_frames() {
        let (channel, session, _broker) = channel_with_session();

        let received: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        let _unsub = channel
            .subscribe(Arc::new(move |message: &Message| {
                r.lock().push(message.clone());
            }))
            .await
            .unwrap();

        let inbound = Message {
            seq: 7,
            random: 9,
            timestamp: 1_700_000_000,
            ..Message::new(MessageProtocol::RpcResponse, b"{\"dps\":{}}".to_vec())
        };
        let payload = Codec::new("local_key").encode_mqtt(&inbound).unwrap();
        session.inject_publish("rr/m/o/user123/hashed99/abc123", &payload);

        assert_eq!(*received.lock(), vec![inbound]);
    }

    #[tokio::test]
    async fn undecodable_inbound_payload_is_dropped() {
        let (channel, session, _broker) = channel_with_session();

        let received: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        let _unsub = channel
            .subscribe(Arc::new(move |message: &Message| {
                r.lock().push(message.clone());
            }))
            .await
            .unwrap();

        session.inject_publish("rr/m/o/user123/hashed99/abc123", b"not a frame");
        assert!(received.lock().is_empty());
    }
}
