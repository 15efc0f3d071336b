use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::location::PositionOptions;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Settings for a tracking session, fixed for the lifetime of the session
pub struct TrackingSettings {
    /// Time between publishing our own location while tracking
    pub publish_interval: Duration,
    /// Delay before trying to reconnect after the feed connection fails or drops
    pub reconnect_delay: Duration,
    /// How long a single geolocation fix may take before it's considered failed
    pub fix_timeout: Duration,
    /// Ask the geolocation source for its most accurate fix
    pub high_accuracy: bool,
    /// Topic that broadcasts device locations
    pub location_topic: String,
    /// Destination our own location updates are sent to
    pub update_destination: String,
}

impl TrackingSettings {
    pub fn position_options(&self) -> PositionOptions {
        PositionOptions {
            enable_high_accuracy: self.high_accuracy,
            timeout: self.fix_timeout,
            maximum_age: Duration::ZERO,
        }
    }
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(5),
            fix_timeout: Duration::from_secs(10),
            high_accuracy: true,
            location_topic: "/topic/location".to_string(),
            update_destination: "/app/update-location".to_string(),
        }
    }
}
