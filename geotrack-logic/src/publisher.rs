use std::{sync::Arc, sync::Mutex, time::Duration};

use chrono::Utc;
use log::{debug, info, warn};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    lock,
    location::{GeolocationError, GeolocationSource, PositionOptions},
    sample::{OutboundLocation, UtcDT},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("not connected to the location feed")]
    NotConnected,
    #[error("the location feed has shut down")]
    Closed,
    #[error("couldn't encode location update: {0}")]
    Encode(String),
}

/// Where the publisher sends location fixes
pub trait LocationSink: Send + Sync + 'static {
    fn send_location(
        &self,
        update: OutboundLocation,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}

#[derive(Debug, Clone, PartialEq)]
/// Result of a single publisher tick
pub enum PublishOutcome {
    /// A fix was taken and handed to the sink
    Published {
        at: UtcDT,
        location: OutboundLocation,
    },
    /// The sink refused the update, the next tick tries again
    Refused(PublishError),
    /// Getting a fix failed, the user may be able to do something about this
    GeolocationFailed(GeolocationError),
}

pub trait PublishObserver: Send + Sync + 'static {
    fn observe(&self, outcome: PublishOutcome);
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Periodically takes a fix from a [GeolocationSource] and sends it to a [LocationSink]
/// while started. At most one timer runs at a time.
pub struct LocationPublisher<G: GeolocationSource, S: LocationSink, O: PublishObserver> {
    geolocation: Arc<G>,
    sink: Arc<S>,
    observer: Arc<O>,
    interval: Duration,
    options: PositionOptions,
    running: Mutex<Option<Running>>,
}

impl<G: GeolocationSource, S: LocationSink, O: PublishObserver> LocationPublisher<G, S, O> {
    pub fn new(
        geolocation: Arc<G>,
        sink: Arc<S>,
        observer: Arc<O>,
        interval: Duration,
        options: PositionOptions,
    ) -> Self {
        Self {
            geolocation,
            sink,
            observer,
            interval: interval.max(MIN_INTERVAL),
            options,
            running: Mutex::new(None),
        }
    }

    /// Start publishing for `device_id`, returns `false` if we were already running.
    pub fn start(&self, device_id: &str) -> bool {
        let mut running = lock(&self.running);

        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            debug!("Publisher already running, ignoring start");
            return false;
        }

        info!("Publishing location for {device_id} every {:?}", self.interval);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::publish_loop(
            self.geolocation.clone(),
            self.sink.clone(),
            self.observer.clone(),
            self.interval,
            self.options,
            device_id.to_string(),
            cancel.clone(),
        ));

        *running = Some(Running { cancel, task });
        true
    }

    /// Stop publishing, returns `false` if we weren't running.
    pub fn stop(&self) -> bool {
        if let Some(Running { cancel, task }) = lock(&self.running).take() {
            cancel.cancel();
            task.abort();
            info!("Stopped publishing location");
            true
        } else {
            false
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running)
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    async fn publish_loop(
        geolocation: Arc<G>,
        sink: Arc<S>,
        observer: Arc<O>,
        period: Duration,
        options: PositionOptions,
        device_id: String,
        cancel: CancellationToken,
    ) {
        // First fix is one period after starting
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = interval.tick() => {}
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                outcome = Self::publish_once(&*geolocation, &*sink, &options, &device_id) => {
                    observer.observe(outcome);
                }
            }
        }
    }

    async fn publish_once(
        geolocation: &G,
        sink: &S,
        options: &PositionOptions,
        device_id: &str,
    ) -> PublishOutcome {
        let fix = tokio::time::timeout(options.timeout, geolocation.current_position(options))
            .await
            .unwrap_or(Err(GeolocationError::Timeout(options.timeout)));

        let position = match fix {
            Ok(position) => position,
            Err(why) => {
                warn!("Failed to get a fix: {why}");
                return PublishOutcome::GeolocationFailed(why);
            }
        };

        let update = OutboundLocation::new(device_id, position.coords);

        match sink.send_location(update.clone()).await {
            Ok(()) => PublishOutcome::Published {
                at: Utc::now(),
                location: update,
            },
            Err(why) => {
                warn!("Location update dropped: {why}");
                PublishOutcome::Refused(why)
            }
        }
    }
}

impl<G: GeolocationSource, S: LocationSink, O: PublishObserver> Drop
    for LocationPublisher<G, S, O>
{
    fn drop(&mut self) {
        self.stop();
    }
}
