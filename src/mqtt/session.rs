// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The account-wide MQTT session.
//!
//! One session carries the traffic of every device on an account. A
//! dedicated task runs `connect → subscribe known topics → read →
//! reconnect on error` with exponential backoff. Topic subscriptions are
//! reference counted: the broker sees one SUBSCRIBE when the first
//! consumer arrives and one UNSUBSCRIBE only after the last consumer has
//! left *and* an idle window has passed, so a device that briefly drops
//! offline does not thrash the broker.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::watch;

use crate::diagnostics::Diagnostics;
use crate::error::{Error, SessionError};
use crate::subscription::Unsubscribe;

use super::{MqttParams, generate_client_id};

/// First reconnect delay; doubles up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Reconnect delay cap.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// How long an unused topic keeps its broker subscription.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Request queue capacity handed to the MQTT client.
const CLIENT_CHANNEL_CAPACITY: usize = 32;

/// Callback receiving the raw payload of an inbound publish.
pub type PayloadCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Hook invoked when the broker rejects the session credentials.
pub type UnauthorizedHook = Arc<dyn Fn() + Send + Sync>;

/// Broker-facing operations the session issues.
///
/// Production sessions drive a `rumqttc` client; tests substitute an
/// in-memory recorder.
#[async_trait]
pub(crate) trait MqttIo: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), SessionError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), SessionError>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError>;
    async fn disconnect(&self);
}

struct RumqttcIo {
    client: AsyncClient,
}

#[async_trait]
impl MqttIo for RumqttcIo {
    async fn subscribe(&self, topic: &str) -> Result<(), SessionError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(SessionError::Mqtt)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), SessionError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(SessionError::Mqtt)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(SessionError::Mqtt)
    }

    async fn disconnect(&self) {
        if let Err(err) = self.client.disconnect().await {
            tracing::debug!(error = %err, "MQTT disconnect request failed");
        }
    }
}

/// Configuration for an [`MqttSession`].
pub struct MqttSessionConfig {
    /// Broker connection parameters.
    pub params: MqttParams,
    /// How long an unused topic keeps its broker subscription.
    pub topic_idle_timeout: Duration,
    /// Invoked when the broker reports an auth-class error.
    pub unauthorized_hook: Option<UnauthorizedHook>,
    /// Diagnostics collector for this session.
    pub diagnostics: Diagnostics,
}

impl MqttSessionConfig {
    /// Creates a configuration with default timeouts and no hook.
    #[must_use]
    pub fn new(params: MqttParams) -> Self {
        Self {
            params,
            topic_idle_timeout: DEFAULT_IDLE_TIMEOUT,
            unauthorized_hook: None,
            diagnostics: Diagnostics::new(),
        }
    }
}

struct TopicEntry {
    callbacks: Vec<(u64, PayloadCallback)>,
    idle_timer: Option<tokio::task::JoinHandle<()>>,
}

struct SessionInner {
    config: MqttSessionConfig,
    topics: Mutex<HashMap<String, TopicEntry>>,
    io: Mutex<Option<Arc<dyn MqttIo>>>,
    connected: watch::Sender<bool>,
    closed: AtomicBool,
    next_subscription: AtomicU64,
}

/// A single logical MQTT connection for an entire account.
///
/// Cheap to clone; all clones share the connection and topic registry.
#[derive(Clone)]
pub struct MqttSession {
    inner: Arc<SessionInner>,
}

impl MqttSession {
    /// Opens the session and starts its connection loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] when the broker rejects the
    /// derived credentials and [`Error::Session`] for any other failure
    /// of the initial connect. Later disconnects are retried with
    /// backoff by the session task instead of surfacing here.
    pub async fn start(config: MqttSessionConfig) -> Result<Self, Error> {
        let session = Self {
            inner: Arc::new(SessionInner {
                config,
                topics: Mutex::new(HashMap::new()),
                io: Mutex::new(None),
                connected: watch::channel(false).0,
                closed: AtomicBool::new(false),
                next_subscription: AtomicU64::new(1),
            }),
        };

        // The first connect runs inline so credential problems surface
        // to the caller instead of looping forever in the background.
        session.diagnostics().increment("start_attempt");
        let (client, event_loop) = session.create_client();
        let event_loop = match session.await_connack(event_loop).await {
            Ok(event_loop) => event_loop,
            Err(error) => {
                session.diagnostics().increment("start_failure");
                return Err(error);
            }
        };
        session.install_io(Arc::new(RumqttcIo { client }));
        session.diagnostics().increment("start_success");

        let run_session = session.clone();
        tokio::spawn(async move {
            run_session.run_loop(event_loop).await;
        });
        Ok(session)
    }

    /// Returns the latest known connection state.
    #[must_use]
    pub fn connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Waits for connection state changes; the receiver always sees the
    /// latest value.
    #[must_use]
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Registers a callback for a topic.
    ///
    /// The broker-side SUBSCRIBE is only issued when the topic has no
    /// prior consumers; a subscribe during the idle window reuses the
    /// existing broker subscription and cancels the pending UNSUBSCRIBE.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Session`] when the broker rejects the SUBSCRIBE.
    pub async fn subscribe(
        &self,
        topic: &str,
        callback: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Result<Unsubscribe, Error> {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let callback: PayloadCallback = Arc::new(callback);

        let needs_broker_subscribe = {
            let mut topics = self.inner.topics.lock();
            if let Some(entry) = topics.get_mut(topic) {
                if let Some(timer) = entry.idle_timer.take() {
                    tracing::debug!(topic = %topic, "Reusing subscription, cancelling idle timer");
                    timer.abort();
                }
                entry.callbacks.push((id, callback));
                false
            } else {
                topics.insert(
                    topic.to_string(),
                    TopicEntry {
                        callbacks: vec![(id, callback)],
                        idle_timer: None,
                    },
                );
                true
            }
        };

        if needs_broker_subscribe && let Some(io) = self.io() {
            if let Err(err) = io.subscribe(topic).await {
                // Roll the registry back so a retry issues SUBSCRIBE again.
                let mut topics = self.inner.topics.lock();
                if let Some(entry) = topics.get_mut(topic) {
                    entry.callbacks.retain(|(cb_id, _)| *cb_id != id);
                    if entry.callbacks.is_empty() {
                        topics.remove(topic);
                    }
                }
                return Err(err.into());
            }
        }

        self.diagnostics().increment("subscribe_count");
        let session = self.clone();
        let topic = topic.to_string();
        Ok(Unsubscribe::new(move || {
            session.remove_callback(&topic, id);
        }))
    }

    /// Publishes one payload to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] while disconnected and
    /// [`Error::Session`] for broker-level failures.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Error> {
        let io = self.io().ok_or(SessionError::NotConnected)?;
        io.publish(topic, payload).await?;
        self.diagnostics().increment("publish_count");
        Ok(())
    }

    /// Tears the connection down and reconnects with fresh backoff.
    ///
    /// Known topics are resubscribed once the new connection is up.
    pub async fn restart(&self) {
        tracing::info!("Restarting MQTT session");
        self.diagnostics().increment("restart");
        let io = self.take_io();
        if let Some(io) = io {
            io.disconnect().await;
        }
    }

    /// Orderly shutdown; idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries: Vec<TopicEntry> = {
            let mut topics = self.inner.topics.lock();
            topics.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            if let Some(timer) = entry.idle_timer {
                timer.abort();
            }
        }
        if let Some(io) = self.take_io() {
            io.disconnect().await;
        }
        self.diagnostics().increment("close");
        tracing::debug!("MQTT session closed");
    }

    fn diagnostics(&self) -> &Diagnostics {
        &self.inner.config.diagnostics
    }

    fn io(&self) -> Option<Arc<dyn MqttIo>> {
        self.inner.io.lock().clone()
    }

    fn install_io(&self, io: Arc<dyn MqttIo>) {
        *self.inner.io.lock() = Some(io);
        let _ = self.inner.connected.send(true);
    }

    fn take_io(&self) -> Option<Arc<dyn MqttIo>> {
        let io = self.inner.io.lock().take();
        let _ = self.inner.connected.send(false);
        io
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn create_client(&self) -> (AsyncClient, EventLoop) {
        let params = &self.inner.config.params;
        let mut options = MqttOptions::new(generate_client_id(), &params.host, params.port);
        options.set_keep_alive(params.keep_alive);
        options.set_clean_session(true);
        options.set_credentials(&params.username, &params.password);
        if params.tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY)
    }

    /// Polls the event loop until the broker acknowledges the connect.
    async fn await_connack(&self, mut event_loop: EventLoop) -> Result<EventLoop, Error> {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    tracing::debug!(?ack, "MQTT connected");
                    return Ok(event_loop);
                }
                Ok(_) => {}
                Err(err) => {
                    let error = self.classify_connection_error(&err);
                    return Err(error);
                }
            }
        }
    }

    /// Maps a connection error, firing the unauthorized hook for
    /// auth-class broker rejections.
    fn classify_connection_error(&self, err: &rumqttc::ConnectionError) -> Error {
        if let rumqttc::ConnectionError::ConnectionRefused(code) = err
            && matches!(
                code,
                rumqttc::ConnectReturnCode::BadUserNamePassword
                    | rumqttc::ConnectReturnCode::NotAuthorized
            )
        {
            if let Some(hook) = &self.inner.config.unauthorized_hook {
                hook();
            }
            return Error::Unauthorized;
        }
        Error::Session(SessionError::ConnectionFailed(err.to_string()))
    }

    /// The session task: read until the connection drops, then reconnect
    /// with exponential backoff until closed.
    async fn run_loop(&self, event_loop: EventLoop) {
        let mut current = Some(event_loop);
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if self.is_closed() {
                break;
            }
            let event_loop = match current.take() {
                Some(event_loop) => event_loop,
                None => {
                    self.diagnostics().increment("start_attempt");
                    let (client, event_loop) = self.create_client();
                    match self.await_connack(event_loop).await {
                        Ok(event_loop) => {
                            self.install_io(Arc::new(RumqttcIo { client }));
                            self.resubscribe_all().await;
                            event_loop
                        }
                        Err(error) => {
                            tracing::warn!(error = %error, "MQTT reconnect failed");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                            continue;
                        }
                    }
                }
            };

            self.diagnostics().increment("start_loop");
            backoff = INITIAL_BACKOFF;
            self.read_messages(event_loop).await;
            let _ = self.take_io();
        }
        let _ = self.take_io();
        tracing::debug!("MQTT session task exited");
    }

    /// Reads events until the connection drops or the session closes.
    async fn read_messages(&self, mut event_loop: EventLoop) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.dispatch(&publish.topic, &publish.payload);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    tracing::info!("MQTT broker disconnected");
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    if !self.is_closed() {
                        let error = self.classify_connection_error(&err);
                        tracing::warn!(error = %error, "MQTT connection error");
                    }
                    return;
                }
            }
            if self.is_closed() {
                return;
            }
        }
    }

    /// Re-issues SUBSCRIBE for every registered topic after a reconnect.
    async fn resubscribe_all(&self) {
        let topics: Vec<String> = self.inner.topics.lock().keys().cloned().collect();
        let Some(io) = self.io() else { return };
        for topic in topics {
            if let Err(err) = io.subscribe(&topic).await {
                tracing::warn!(topic = %topic, error = %err, "Resubscribe failed");
            }
        }
    }

    /// Delivers an inbound publish to the topic's callbacks.
    ///
    /// Each callback runs in a guarded wrapper so one faulty subscriber
    /// cannot take down the session task.
    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let callbacks: Vec<PayloadCallback> = {
            let topics = self.inner.topics.lock();
            match topics.get(topic) {
                Some(entry) => entry.callbacks.iter().map(|(_, cb)| cb.clone()).collect(),
                None => {
                    tracing::trace!(topic = %topic, "No subscribers for topic");
                    return;
                }
            }
        };
        self.diagnostics().increment("dispatch_message_count");
        for callback in callbacks {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(payload)));
            if result.is_err() {
                tracing::error!(topic = %topic, "Uncaught panic in message handler callback");
            }
        }
    }

    /// Detaches one callback; the last consumer starts the idle timer.
    fn remove_callback(&self, topic: &str, id: u64) {
        let start_idle = {
            let mut topics = self.inner.topics.lock();
            let Some(entry) = topics.get_mut(topic) else {
                return;
            };
            entry.callbacks.retain(|(cb_id, _)| *cb_id != id);
            entry.callbacks.is_empty() && entry.idle_timer.is_none()
        };
        if start_idle && !self.is_closed() {
            self.start_idle_timer(topic.to_string());
        }
    }

    fn start_idle_timer(&self, topic: String) {
        let session = self.clone();
        let timer_topic = topic.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(session.inner.config.topic_idle_timeout).await;
            session.finish_idle(&timer_topic).await;
        });
        let mut topics = self.inner.topics.lock();
        if let Some(entry) = topics.get_mut(&topic) {
            entry.idle_timer = Some(handle);
        } else {
            handle.abort();
        }
    }

    /// Idle timer expiry: drop the topic if still unused.
    async fn finish_idle(&self, topic: &str) {
        let remove = {
            let mut topics = self.inner.topics.lock();
            match topics.get(topic) {
                Some(entry) if entry.callbacks.is_empty() => {
                    topics.remove(topic);
                    true
                }
                _ => false,
            }
        };
        if remove {
            tracing::debug!(topic = %topic, "Idle timeout, unsubscribing");
            if let Some(io) = self.io() {
                if let Err(err) = io.unsubscribe(topic).await {
                    tracing::warn!(topic = %topic, error = %err, "Unsubscribe failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for MqttSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSession")
            .field("host", &self.inner.config.params.host)
            .field("connected", &self.connected())
            .field("topics", &self.inner.topics.lock().len())
            .finish()
    }
}

#[cfg(test)]
impl MqttSession {
    /// Builds a connected session around a fake broker, for tests.
    pub(crate) fn new_for_test(io: Arc<dyn MqttIo>, topic_idle_timeout: Duration) -> Self {
        let params = MqttParams {
            host: "broker.test".into(),
            port: 1883,
            tls: false,
            username: "user".into(),
            password: "pass".into(),
            keep_alive: Duration::from_secs(30),
        };
        let mut config = MqttSessionConfig::new(params);
        config.topic_idle_timeout = topic_idle_timeout;
        let session = Self {
            inner: Arc::new(SessionInner {
                config,
                topics: Mutex::new(HashMap::new()),
                io: Mutex::new(None),
                connected: watch::channel(false).0,
                closed: AtomicBool::new(false),
                next_subscription: AtomicU64::new(1),
            }),
        };
        session.install_io(io);
        session
    }

    /// Injects an inbound publish, as if read from the broker.
    pub(crate) fn inject_publish(&self, topic: &str, payload: &[u8]) {
        self.dispatch(topic, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeIo {
        subscribes: Mutex<Vec<String>>,
        unsubscribes: Mutex<Vec<String>>,
        publishes: Mutex<Vec<(String, Vec<u8>)>>,
        fail_subscribe: AtomicBool,
    }

    #[async_trait]
    impl MqttIo for FakeIo {
        async fn subscribe(&self, topic: &str) -> Result<(), SessionError> {
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return Err(SessionError::ConnectionFailed("subscribe refused".into()));
            }
            self.subscribes.lock().push(topic.to_string());
            Ok(())
        }

        async fn unsubscribe(&self, topic: &str) -> Result<(), SessionError> {
            self.unsubscribes.lock().push(topic.to_string());
            Ok(())
        }

        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError> {
            self.publishes.lock().push((topic.to_string(), payload));
            Ok(())
        }

        async fn disconnect(&self) {}
    }

    fn session_with_io(idle: Duration) -> (MqttSession, Arc<FakeIo>) {
        let io = Arc::new(FakeIo::default());
        let session = MqttSession::new_for_test(io.clone(), idle);
        (session, io)
    }

    #[tokio::test]
    async fn messages_reach_only_their_topic() {
        let (session, _io) = session_with_io(Duration::from_secs(60));

        let received1 = Arc::new(Mutex::new(Vec::new()));
        let received2 = Arc::new(Mutex::new(Vec::new()));
        let r1 = received1.clone();
        let r2 = received2.clone();
        let _unsub1 = session
            .subscribe("topic-1", move |payload| r1.lock().push(payload.to_vec()))
            .await
            .unwrap();
        let _unsub2 = session
            .subscribe("topic-2", move |payload| r2.lock().push(payload.to_vec()))
            .await
            .unwrap();

        session.inject_publish("topic-1", b"12345");
        session.inject_publish("topic-2", b"67890");
        session.inject_publish("topic-1", b"ABC");

        assert_eq!(*received1.lock(), vec![b"12345".to_vec(), b"ABC".to_vec()]);
        assert_eq!(*received2.lock(), vec![b"67890".to_vec()]);
    }

    #[tokio::test]
    async fn unsubscribed_callback_stops_receiving() {
        let (session, _io) = session_with_io(Duration::from_secs(60));

        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        let unsub = session
            .subscribe("topic-1", move |payload| r.lock().push(payload.to_vec()))
            .await
            .unwrap();

        session.inject_publish("topic-1", b"one");
        unsub.unsubscribe();
        session.inject_publish("topic-1", b"two");

        assert_eq!(*received.lock(), vec![b"one".to_vec()]);
    }

    #[tokio::test]
    async fn broker_subscribe_only_on_first_consumer() {
        let (session, io) = session_with_io(Duration::from_secs(60));

        let _unsub1 = session.subscribe("topic-1", |_| {}).await.unwrap();
        assert_eq!(io.subscribes.lock().len(), 1);

        let _unsub2 = session.subscribe("topic-1", |_| {}).await.unwrap();
        assert_eq!(io.subscribes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_unsubscribes_after_last_consumer() {
        let (session, io) = session_with_io(Duration::from_millis(50));

        let unsub1 = session.subscribe("test/topic", |_| {}).await.unwrap();
        let unsub2 = session.subscribe("test/topic", |_| {}).await.unwrap();

        unsub1.unsubscribe();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(io.unsubscribes.lock().is_empty());

        unsub2.unsubscribe();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*io.unsubscribes.lock(), vec!["test/topic".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_during_idle_cancels_unsubscribe() {
        let (session, io) = session_with_io(Duration::from_millis(50));

        let unsub = session.subscribe("test/topic", |_| {}).await.unwrap();
        unsub.unsubscribe();

        // Resubscribe before the idle window ends.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _unsub2 = session.subscribe("test/topic", |_| {}).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(io.unsubscribes.lock().is_empty());
        // The broker subscription was reused, not re-issued.
        assert_eq!(io.subscribes.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_broker_subscribe_rolls_back() {
        let (session, io) = session_with_io(Duration::from_secs(60));
        io.fail_subscribe.store(true, Ordering::SeqCst);

        assert!(session.subscribe("topic-1", |_| {}).await.is_err());

        // The topic is gone from the registry, so a later attempt issues
        // SUBSCRIBE again.
        io.fail_subscribe.store(false, Ordering::SeqCst);
        let _unsub = session.subscribe("topic-1", |_| {}).await.unwrap();
        assert_eq!(io.subscribes.lock().len(), 1);
    }

    #[tokio::test]
    async fn publish_goes_to_broker() {
        let (session, io) = session_with_io(Duration::from_secs(60));
        session.publish("topic-1", b"payload".to_vec()).await.unwrap();
        assert_eq!(
            *io.publishes.lock(),
            vec![("topic-1".to_string(), b"payload".to_vec())]
        );
    }

    #[tokio::test]
    async fn publish_when_closed_fails() {
        let (session, _io) = session_with_io(Duration::from_secs(60));
        session.close().await;
        assert!(!session.connected());
        assert!(session.publish("topic-1", b"payload".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (session, _io) = session_with_io(Duration::from_secs(60));
        session.close().await;
        session.close().await;
        assert_eq!(session.diagnostics().get("close"), Some(1));
    }

    #[tokio::test]
    async fn unsubscribe_after_close_is_safe() {
        let (session, io) = session_with_io(Duration::from_secs(60));
        let unsub = session.subscribe("topic-1", |_| {}).await.unwrap();
        session.close().await;
        unsub.unsubscribe();
        assert!(io.unsubscribes.lock().is_empty());
    }

    #[tokio::test]
    async fn panicking_callback_does_not_poison_dispatch() {
        let (session, _io) = session_with_io(Duration::from_secs(60));

        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        let _unsub1 = session
            .subscribe("topic-1", |_| panic!("bad subscriber"))
            .await
            .unwrap();
        let _unsub2 = session
            .subscribe("topic-1", move |payload| r.lock().push(payload.to_vec()))
            .await
            .unwrap();

        session.inject_publish("topic-1", b"still delivered");
        assert_eq!(*received.lock(), vec![b"still delivered".to_vec()]);
    }

    #[tokio::test]
    async fn diagnostics_track_session_events() {
        let (session, _io) = session_with_io(Duration::from_secs(60));
        let _unsub = session.subscribe("topic-1", |_| {}).await.unwrap();
        session.inject_publish("topic-1", b"x");
        session.publish("topic-1", b"y".to_vec()).await.unwrap();

        let diagnostics = session.diagnostics();
        assert_eq!(diagnostics.get("subscribe_count"), Some(1));
        assert_eq!(diagnostics.get("dispatch_message_count"), Some(1));
        assert_eq!(diagnostics.get("publish_count"), Some(1));
    }
}
