use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    feed::{ConnectionState, LocationFeedConnection},
    geofence::evaluate,
    location::GeolocationSource,
    lock,
    ownership::is_owner,
    publisher::{LocationPublisher, PublishObserver, PublishOutcome},
    sample::{Coordinates, DeviceHome, LocationSample, UtcDT},
    settings::TrackingSettings,
    transport::FeedTransport,
};

pub trait StateUpdateSender: Send + Sync + 'static {
    fn send_update(&self);
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ViewPhase {
    /// Not mounted yet, no connection requested
    Idle,
    /// Waiting for the first link to be established
    Connecting,
    /// Connected to the feed
    Live,
    /// Lost a previously established link, reconnecting
    Disrupted,
    /// Disposed, nothing else will happen
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TrackingError {
    #[error("this session doesn't own the device")]
    NotOwner,
    #[error("not connected to the location feed")]
    NotConnected,
    #[error("the tracking view has been closed")]
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Everything a map renderer needs: markers, the path between them, and the fence circle
pub struct MapOverlay {
    pub home_marker: Coordinates,
    pub device_marker: Option<Coordinates>,
    pub path: Vec<Coordinates>,
    pub geofence_radius_m: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// The state of a tracking view at a point in time
pub struct TrackingSnapshot {
    pub device_id: String,
    pub device_name: Option<String>,
    pub phase: ViewPhase,
    pub connection: ConnectionState,
    pub is_owner: bool,
    pub is_tracking: bool,
    /// Whether start/stop tracking should be offered
    pub controls_enabled: bool,
    pub home_location: Coordinates,
    pub geofence_radius_km: Option<f64>,
    /// Position from the latest sample relayed by the feed
    pub current_location: Option<Coordinates>,
    /// Last position this session published for the device
    pub last_known_location: Option<Coordinates>,
    pub last_sample: Option<LocationSample>,
    pub breached: bool,
    pub last_updated: Option<UtcDT>,
    /// Latest problem the user should know about
    pub error: Option<String>,
}

impl TrackingSnapshot {
    pub fn map_overlay(&self) -> MapOverlay {
        let device_marker = self.current_location;
        let path = device_marker
            .map(|device| vec![self.home_location, device])
            .unwrap_or_default();
        MapOverlay {
            home_marker: self.home_location,
            device_marker,
            path,
            geofence_radius_m: self.geofence_radius_km.map(|km| km * 1000.0),
        }
    }
}

#[derive(Default)]
struct ViewState {
    mounted: bool,
    closed: bool,
    last_sample: Option<LocationSample>,
    breached: bool,
    last_known_location: Option<Coordinates>,
    last_updated: Option<UtcDT>,
    error: Option<String>,
}

/// State shared with the feed listeners and the publisher
struct Shared<U: StateUpdateSender> {
    state: Mutex<ViewState>,
    radius_km: Option<f64>,
    updates: U,
}

impl<U: StateUpdateSender> Shared<U> {
    fn record_sample(&self, sample: &LocationSample) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.breached = evaluate(Some(sample), self.radius_km).breached;
        state.last_sample = Some(sample.clone());
        state.last_updated = Some(Utc::now());
        drop(state);
        self.updates.send_update();
    }
}

impl<U: StateUpdateSender> PublishObserver for Shared<U> {
    fn observe(&self, outcome: PublishOutcome) {
        let mut state = lock(&self.state);
        match outcome {
            PublishOutcome::Published { at, location } => {
                state.last_known_location = Some(location.coordinates());
                state.last_updated = Some(at);
            }
            PublishOutcome::GeolocationFailed(why) => {
                state.error = Some(why.to_string());
            }
            // Logged by the publisher, the next tick will try again
            PublishOutcome::Refused(_) => return,
        }
        drop(state);
        self.updates.send_update();
    }
}

type Connection<T> = LocationFeedConnection<T>;
type Publisher<T, G, U> = LocationPublisher<G, Connection<T>, Shared<U>>;

/// One live tracking view of a device. Owns its feed connection and publisher, both are
/// torn down by [TrackingViewModel::dispose] or when this is dropped.
pub struct TrackingViewModel<T: FeedTransport, G: GeolocationSource, U: StateUpdateSender> {
    device_id: String,
    home: DeviceHome,
    is_owner: bool,
    connection: Arc<Connection<T>>,
    publisher: Arc<Publisher<T, G, U>>,
    shared: Arc<Shared<U>>,
}

impl<T: FeedTransport, G: GeolocationSource, U: StateUpdateSender> TrackingViewModel<T, G, U> {
    /// Create a view of `device_id`, `owned_identifier` is the device identifier this
    /// session registered, if any.
    pub fn new(
        device_id: impl Into<String>,
        home: DeviceHome,
        owned_identifier: Option<&str>,
        transport: T,
        geolocation: G,
        updates: U,
        settings: TrackingSettings,
    ) -> Self {
        let is_owner = is_owner(owned_identifier, home.unique_id.as_deref());

        let shared = Arc::new(Shared {
            state: Mutex::new(ViewState {
                last_updated: Some(Utc::now()),
                ..Default::default()
            }),
            radius_km: home.geofence_radius_km,
            updates,
        });

        let connection = Arc::new(Connection::new(transport, settings.clone()));

        let publisher = Arc::new(Publisher::new(
            Arc::new(geolocation),
            connection.clone(),
            shared.clone(),
            settings.publish_interval,
            settings.position_options(),
        ));

        connection.on_sample({
            let shared = shared.clone();
            move |sample| shared.record_sample(sample)
        });

        connection.on_state({
            let shared = Arc::downgrade(&shared);
            let publisher = Arc::downgrade(&publisher);
            move |state| {
                if !state.is_connected() {
                    if let Some(publisher) = publisher.upgrade() {
                        if publisher.stop() {
                            info!("Feed is {state:?}, stopped tracking");
                        }
                    }
                }
                if let Some(shared) = shared.upgrade() {
                    shared.updates.send_update();
                }
            }
        });

        Self {
            device_id: device_id.into(),
            home,
            is_owner,
            connection,
            publisher,
            shared,
        }
    }

    /// Start the feed connection
    pub fn mount(&self, auth_token: &str) -> Result<(), TrackingError> {
        let mut state = lock(&self.shared.state);
        if state.closed {
            return Err(TrackingError::Closed);
        }
        state.mounted = true;
        drop(state);

        self.connection.connect(auth_token);
        self.shared.updates.send_update();
        Ok(())
    }

    /// Begin publishing this device's location, only the owner may do this, and only while
    /// connected.
    pub fn start_tracking(&self) -> Result<(), TrackingError> {
        if lock(&self.shared.state).closed {
            return Err(TrackingError::Closed);
        }
        if !self.is_owner {
            return Err(TrackingError::NotOwner);
        }
        if !self.connection.state().is_connected() {
            return Err(TrackingError::NotConnected);
        }

        if self.publisher.start(&self.device_id) {
            // The connection may have dropped while we were starting
            if !self.connection.state().is_connected() {
                self.publisher.stop();
                return Err(TrackingError::NotConnected);
            }
            lock(&self.shared.state).error = None;
            self.shared.updates.send_update();
        }

        Ok(())
    }

    pub fn stop_tracking(&self) {
        if self.publisher.stop() {
            self.shared.updates.send_update();
        }
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    pub fn is_tracking(&self) -> bool {
        self.publisher.is_running()
    }

    pub fn controls_enabled(&self) -> bool {
        self.is_owner && self.phase() == ViewPhase::Live
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn phase(&self) -> ViewPhase {
        let state = lock(&self.shared.state);
        Self::derive_phase(&state, &self.connection)
    }

    fn derive_phase(state: &ViewState, connection: &Connection<T>) -> ViewPhase {
        if state.closed {
            ViewPhase::Closed
        } else if !state.mounted {
            ViewPhase::Idle
        } else if connection.state().is_connected() {
            ViewPhase::Live
        } else if connection.established_count() > 0 {
            ViewPhase::Disrupted
        } else {
            ViewPhase::Connecting
        }
    }

    pub fn snapshot(&self) -> TrackingSnapshot {
        let state = lock(&self.shared.state);
        let phase = Self::derive_phase(&state, &self.connection);
        let is_tracking = self.publisher.is_running();

        TrackingSnapshot {
            device_id: self.device_id.clone(),
            device_name: self.home.device_name.clone(),
            phase,
            connection: self.connection.state(),
            is_owner: self.is_owner,
            is_tracking,
            controls_enabled: self.is_owner && phase == ViewPhase::Live,
            home_location: self.home.home,
            geofence_radius_km: self.home.geofence_radius_km,
            current_location: state.last_sample.as_ref().map(LocationSample::coordinates),
            last_known_location: state.last_known_location,
            last_sample: state.last_sample.clone(),
            breached: state.breached,
            last_updated: state.last_updated,
            error: state.error.clone(),
        }
    }

    /// Stop tracking and disconnect, the view can't be used after this.
    pub async fn dispose(&self) {
        {
            let mut state = lock(&self.shared.state);
            if state.closed {
                return;
            }
            state.closed = true;
        }

        debug!("Disposing tracking view for {}", self.device_id);
        self.publisher.stop();
        self.connection.disconnect().await;
        self.shared.updates.send_update();
    }
}

impl<T: FeedTransport, G: GeolocationSource, U: StateUpdateSender> Drop
    for TrackingViewModel<T, G, U>
{
    fn drop(&mut self) {
        self.publisher.stop();
        self.connection.cancel();
    }
}
