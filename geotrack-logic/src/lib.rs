mod feed;
mod geofence;
mod location;
mod ownership;
mod publisher;
mod sample;
mod settings;
mod transport;
mod view_model;

pub use feed::{ConnectionState, LocationFeedConnection};
pub use geofence::{GeofenceStatus, evaluate as evaluate_geofence};
pub use location::{GeolocationError, GeolocationSource, Position, PositionOptions};
pub use ownership::is_owner;
pub use publisher::{LocationPublisher, LocationSink, PublishError, PublishObserver, PublishOutcome};
pub use sample::{
    Coordinates, DeviceHome, DeviceRef, LocationSample, MalformedMessage, OutboundLocation,
    UtcDT,
};
pub use settings::TrackingSettings;
pub use transport::{Credentials, FeedLink, FeedMessage, FeedTransport};
pub use view_model::{
    MapOverlay, StateUpdateSender, TrackingError, TrackingSnapshot, TrackingViewModel, ViewPhase,
};

pub mod prelude {
    use anyhow::Error as AnyhowError;
    use std::result::Result as StdResult;
    pub type Result<T = (), E = AnyhowError> = StdResult<T, E>;
    pub use anyhow::Context;
}

/// Lock a std mutex, recovering the data if a listener panicked while holding it
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
