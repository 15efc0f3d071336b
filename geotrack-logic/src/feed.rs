use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use anyhow::anyhow;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    lock,
    prelude::*,
    publisher::{LocationSink, PublishError},
    sample::{LocationSample, OutboundLocation},
    settings::TrackingSettings,
    transport::{Credentials, FeedLink, FeedMessage, FeedTransport},
};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

type SampleListener = Arc<dyn Fn(&LocationSample) + Send + Sync>;
type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    samples: Mutex<Vec<SampleListener>>,
    states: Mutex<Vec<StateListener>>,
}

impl Listeners {
    fn notify_sample(&self, sample: &LocationSample) {
        // Cloned out so a listener never runs while we hold the lock
        let listeners = lock(&self.samples).clone();
        for listener in listeners {
            listener(sample);
        }
    }

    fn notify_state(&self, state: ConnectionState) {
        let listeners = lock(&self.states).clone();
        for listener in listeners {
            listener(state);
        }
    }
}

struct Lifecycle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

enum LinkEnd {
    Cancelled,
    Lost(anyhow::Error),
}

type Queue<T> = (mpsc::Sender<T>, AsyncMutex<mpsc::Receiver<T>>);

struct FeedInner<T: FeedTransport> {
    transport: T,
    settings: TrackingSettings,
    state: watch::Sender<ConnectionState>,
    latest: watch::Sender<Option<LocationSample>>,
    established: AtomicU64,
    /// Bumped by every [LocationFeedConnection::connect], a loop only reports its own exit
    /// while it's still the latest one
    generation: AtomicU64,
    listeners: Listeners,
    outgoing: Queue<String>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

/// A single logical subscription to the backend's location broadcast, handles connecting,
/// reconnecting after failures, and queueing outbound location updates on the current
/// link.
///
/// Dropping the connection cancels its connection loop.
pub struct LocationFeedConnection<T: FeedTransport> {
    inner: Arc<FeedInner<T>>,
}

impl<T: FeedTransport> LocationFeedConnection<T> {
    pub fn new(transport: T, settings: TrackingSettings) -> Self {
        let (otx, orx) = mpsc::channel(15);
        Self {
            inner: Arc::new(FeedInner {
                transport,
                settings,
                state: watch::Sender::new(ConnectionState::Disconnected),
                latest: watch::Sender::new(None),
                established: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                listeners: Listeners::default(),
                outgoing: (otx, AsyncMutex::new(orx)),
                lifecycle: Mutex::new(None),
            }),
        }
    }

    /// Start connecting with the given bearer token. Does nothing if the connection loop
    /// is already running, including while it waits to retry.
    pub fn connect(&self, auth_token: &str) {
        let mut lifecycle = lock(&self.inner.lifecycle);

        if lifecycle.as_ref().is_some_and(|l| !l.task.is_finished()) {
            debug!("Location feed already active, ignoring connect");
            return;
        }

        let cancel = CancellationToken::new();
        let credentials = Credentials::bearer(auth_token);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.set_state(ConnectionState::Connecting);

        let task = tokio::spawn({
            let inner = self.inner.clone();
            let cancel = cancel.clone();
            async move {
                inner.connection_loop(credentials, cancel, generation).await;
            }
        });

        *lifecycle = Some(Lifecycle { cancel, task });
    }

    /// Tear down the connection, no reconnect is attempted afterwards.
    pub async fn disconnect(&self) {
        let lifecycle = lock(&self.inner.lifecycle).take();

        if let Some(Lifecycle { cancel, task }) = lifecycle {
            cancel.cancel();
            if let Err(why) = task.await {
                error!("Location feed loop did not exit cleanly: {why:?}");
            }
        }

        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Signal the connection loop to stop without waiting for it
    pub(crate) fn cancel(&self) {
        if let Some(lifecycle) = lock(&self.inner.lifecycle).take() {
            lifecycle.cancel.cancel();
        }
    }

    /// Register a listener called for every valid sample received, in arrival order.
    pub fn on_sample(&self, listener: impl Fn(&LocationSample) + Send + Sync + 'static) {
        lock(&self.inner.listeners.samples).push(Arc::new(listener));
    }

    /// Register a listener called on every change of [ConnectionState].
    pub fn on_state(&self, listener: impl Fn(ConnectionState) + Send + Sync + 'static) {
        lock(&self.inner.listeners.states).push(Arc::new(listener));
    }

    /// Queue a location update to be sent on the current link
    pub async fn publish(&self, update: OutboundLocation) -> Result<(), PublishError> {
        let state = self.state();
        if !state.is_connected() {
            warn!("Not publishing location update, feed is {state:?}");
            return Err(PublishError::NotConnected);
        }

        let body =
            serde_json::to_string(&update).map_err(|why| PublishError::Encode(why.to_string()))?;

        self.inner
            .outgoing
            .0
            .send(body)
            .await
            .map_err(|_| PublishError::Closed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn latest_sample(&self) -> Option<LocationSample> {
        self.inner.latest.borrow().clone()
    }

    /// How many links have been successfully established so far
    pub fn established_count(&self) -> u64 {
        self.inner.established.load(Ordering::SeqCst)
    }
}

impl<T: FeedTransport> Drop for LocationFeedConnection<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<T: FeedTransport> LocationSink for LocationFeedConnection<T> {
    async fn send_location(&self, update: OutboundLocation) -> Result<(), PublishError> {
        self.publish(update).await
    }
}

impl<T: FeedTransport> FeedInner<T> {
    fn set_state(&self, new: ConnectionState) {
        let old = self.state.send_replace(new);
        if old != new {
            debug!("Location feed {old:?} -> {new:?}");
            self.listeners.notify_state(new);
        }
    }

    async fn open_link(&self, credentials: &Credentials) -> Result<T::Link> {
        let mut link = self
            .transport
            .open(credentials)
            .await
            .context("Failed to open link")?;

        let topic = &self.settings.location_topic;
        if let Err(why) = link.subscribe(topic).await {
            link.close().await;
            return Err(why.context(format!("Failed to subscribe to {topic}")));
        }

        Ok(link)
    }

    /// Connect, pump messages, and retry on failure until cancelled.
    async fn connection_loop(
        &self,
        credentials: Credentials,
        cancel: CancellationToken,
        generation: u64,
    ) {
        loop {
            self.set_state(ConnectionState::Connecting);

            let opened = tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                res = self.open_link(&credentials) => res,
            };

            match opened {
                Ok(link) => {
                    self.established.fetch_add(1, Ordering::SeqCst);
                    info!("Connected to location feed");
                    self.set_state(ConnectionState::Connected);

                    match self.pump(link, &cancel).await {
                        LinkEnd::Cancelled => break,
                        LinkEnd::Lost(why) => warn!("Location feed lost: {why:?}"),
                    }
                }
                Err(why) => error!("Couldn't connect to location feed: {why:?}"),
            }

            self.set_state(ConnectionState::Error);
            self.discard_outgoing().await;

            let delay = self.settings.reconnect_delay;
            debug!("Reconnecting to location feed in {delay:?}");

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.generation.load(Ordering::SeqCst) == generation {
            self.set_state(ConnectionState::Disconnected);
        } else {
            debug!("Superseded location feed loop exited");
        }
    }

    async fn pump(&self, mut link: T::Link, cancel: &CancellationToken) -> LinkEnd {
        let mut outgoing = self.outgoing.1.lock().await;
        let destination = &self.settings.update_destination;

        let end = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    break LinkEnd::Cancelled;
                }

                msg = link.receive() => match msg {
                    Ok(Some(msg)) => self.handle_message(msg),
                    Ok(None) => break LinkEnd::Lost(anyhow!("Link closed by the server")),
                    Err(why) => break LinkEnd::Lost(why),
                },

                Some(body) = outgoing.recv() => {
                    if let Err(why) = link.send(destination, body).await {
                        break LinkEnd::Lost(why.context("Failed to send location update"));
                    }
                }
            }
        };

        drop(outgoing);

        if let LinkEnd::Cancelled = end {
            link.close().await;
        }

        end
    }

    fn handle_message(&self, msg: FeedMessage) {
        if msg.topic != self.settings.location_topic {
            debug!("Ignoring message on unexpected topic {}", msg.topic);
            return;
        }

        match LocationSample::from_feed_body(&msg.body, Utc::now()) {
            Ok(sample) => {
                self.latest.send_replace(Some(sample.clone()));
                self.listeners.notify_sample(&sample);
            }
            Err(why) => {
                warn!("Dropping location message ({why}): {}", msg.body);
            }
        }
    }

    async fn discard_outgoing(&self) {
        let mut outgoing = self.outgoing.1.lock().await;
        let mut dropped = 0;
        while outgoing.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("Dropped {dropped} location update(s) queued on a lost link");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use super::*;
    use crate::{
        sample::Coordinates,
        tests::{MockFeed, settle},
    };
    use tokio::{test, time::sleep};

    const RECONNECT: Duration = Duration::from_secs(5);

    type TestConnection = LocationFeedConnection<MockFeed>;

    fn mk_connection() -> (MockFeed, TestConnection) {
        tokio::time::pause();
        let feed = MockFeed::default();
        let connection = TestConnection::new(feed.clone(), TrackingSettings::default());
        (feed, connection)
    }

    fn body(lat: f64, lng: f64, distance: f64) -> String {
        format!(r#"{{"latitude": {lat}, "longitude": {lng}, "distance": {distance}, "dataTime": "t"}}"#)
    }

    fn record_samples(connection: &TestConnection) -> Arc<Mutex<Vec<LocationSample>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        connection.on_sample({
            let seen = seen.clone();
            move |s| seen.lock().unwrap().push(s.clone())
        });
        seen
    }

    fn record_states(connection: &TestConnection) -> Arc<Mutex<Vec<ConnectionState>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        connection.on_state({
            let seen = seen.clone();
            move |s| seen.lock().unwrap().push(s)
        });
        seen
    }

    #[test]
    async fn test_connect_subscribes_with_token() {
        let (feed, connection) = mk_connection();

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        connection.connect("tok");
        assert_eq!(connection.state(), ConnectionState::Connecting);
        settle().await;

        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(feed.opens(), 1);
        assert_eq!(feed.subscriptions(), vec!["/topic/location".to_string()]);
        assert_eq!(feed.last_authorization().as_deref(), Some("Bearer tok"));
        assert_eq!(connection.latest_sample(), None);
    }

    #[test]
    async fn test_samples_in_arrival_order() {
        let (feed, connection) = mk_connection();
        let seen = record_samples(&connection);

        connection.connect("tok");
        settle().await;

        for i in 1..=5 {
            assert!(feed.push_location(body(i as f64, 2.0, i as f64 / 10.0)));
        }
        settle().await;

        let seen = seen.lock().unwrap();
        let lats = seen.iter().map(|s| s.latitude).collect::<Vec<_>>();
        assert_eq!(lats, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(connection.latest_sample().as_ref(), seen.last());
    }

    #[test]
    async fn test_malformed_messages_dropped() {
        let (feed, connection) = mk_connection();
        let seen = record_samples(&connection);

        connection.connect("tok");
        settle().await;

        feed.push_location(body(1.0, 1.0, 0.1));
        feed.push_location(r#"{"longitude": 3.0, "distance": 0.1}"#.to_string());
        feed.push_location(r#"{"latitude": 3.0}"#.to_string());
        feed.push_location("garbage".to_string());
        settle().await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(
            connection.latest_sample().map(|s| s.coordinates()),
            Some(Coordinates::new(1.0, 1.0))
        );
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[test]
    async fn test_other_topics_ignored() {
        let (feed, connection) = mk_connection();
        let seen = record_samples(&connection);

        connection.connect("tok");
        settle().await;

        feed.push("/topic/other", body(1.0, 1.0, 0.1));
        settle().await;

        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    async fn test_connect_is_idempotent() {
        let (feed, connection) = mk_connection();

        connection.connect("tok");
        connection.connect("tok");
        settle().await;
        connection.connect("tok");
        settle().await;

        assert_eq!(feed.opens(), 1);
        assert_eq!(connection.established_count(), 1);
    }

    #[test]
    async fn test_publish_requires_connection() {
        let (feed, connection) = mk_connection();
        let update = OutboundLocation::new("dev-1", Coordinates::new(1.0, 2.0));

        assert_eq!(
            connection.publish(update.clone()).await,
            Err(PublishError::NotConnected)
        );

        connection.connect("tok");
        settle().await;

        connection.publish(update).await.expect("Failed to publish");
        settle().await;

        let sent = feed.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "/app/update-location");
        let value = serde_json::from_str::<serde_json::Value>(&sent[0].1).unwrap();
        assert_eq!(value["device"]["deviceId"], "dev-1");
        assert_eq!(value["latitude"], 1.0);
    }

    #[test]
    async fn test_failed_connect_retries_forever() {
        let (feed, connection) = mk_connection();
        feed.set_failing(true);

        connection.connect("tok");
        settle().await;
        assert_eq!(feed.opens(), 1);
        assert_eq!(connection.state(), ConnectionState::Error);

        // Connecting again while waiting to retry doesn't add an attempt
        connection.connect("tok");
        settle().await;
        assert_eq!(feed.opens(), 1);

        for expected in 2..=6 {
            sleep(RECONNECT).await;
            assert_eq!(feed.opens(), expected, "Expected one attempt per delay");
        }

        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        sleep(RECONNECT * 4).await;
        assert_eq!(feed.opens(), 6, "Reconnected after explicit disconnect");
    }

    #[test]
    async fn test_unexpected_drop_reconnects() {
        let (feed, connection) = mk_connection();
        let states = record_states(&connection);

        connection.connect("tok");
        settle().await;

        feed.drop_link();
        settle().await;
        assert_eq!(connection.state(), ConnectionState::Error);

        sleep(RECONNECT / 2).await;
        assert_eq!(feed.opens(), 1, "Reconnected before the delay");

        sleep(RECONNECT / 2).await;
        assert_eq!(feed.opens(), 2);
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(connection.established_count(), 2);

        connection.disconnect().await;

        use ConnectionState::*;
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                Connecting,
                Connected,
                Error,
                Connecting,
                Connected,
                Disconnected
            ]
        );
    }

    #[test]
    async fn test_explicit_disconnect() {
        let (feed, connection) = mk_connection();

        connection.connect("tok");
        settle().await;

        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(feed.closes(), 1, "Link wasn't closed gracefully");
        assert!(!feed.is_linked());

        sleep(RECONNECT * 3).await;
        assert_eq!(feed.opens(), 1);

        // Safe to repeat
        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[test]
    async fn test_send_failure_loses_link() {
        let (feed, connection) = mk_connection();

        connection.connect("tok");
        settle().await;

        feed.set_send_failing(true);
        let update = OutboundLocation::new("dev-1", Coordinates::new(1.0, 2.0));
        connection.publish(update).await.expect("Failed to publish");
        settle().await;

        assert_eq!(connection.state(), ConnectionState::Error);
        assert!(feed.sent().is_empty());
    }

    #[test]
    async fn test_drop_cancels_loop() {
        let (feed, connection) = mk_connection();

        connection.connect("tok");
        settle().await;
        assert!(feed.is_linked());

        drop(connection);
        settle().await;

        assert!(!feed.is_linked());
        sleep(RECONNECT * 2).await;
        assert_eq!(feed.opens(), 1);
    }

    #[test]
    async fn test_stale_loop_exit_keeps_new_state() {
        let (feed, connection) = mk_connection();
        feed.set_slow_close(true);

        connection.connect("tok");
        settle().await;
        assert_eq!(connection.state(), ConnectionState::Connected);

        // The old loop is still closing its link while the new one connects
        connection.cancel();
        connection.connect("tok");
        sleep(Duration::from_secs(2)).await;

        assert_eq!(feed.opens(), 2);
        assert_eq!(feed.closes(), 1);
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert!(feed.is_linked());

        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
