use serde::{Deserialize, Serialize};

use crate::sample::LocationSample;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeofenceStatus {
    pub breached: bool,
}

/// Classify whether the device is outside its geofence.
///
/// Without a sample, a distance, or a radius there's nothing to assert a breach with, so
/// those cases are not breached. The boundary itself is inside the fence.
pub fn evaluate(last_sample: Option<&LocationSample>, radius_km: Option<f64>) -> GeofenceStatus {
    let distance = last_sample.and_then(|s| s.distance_from_home);
    let breached = match (distance, radius_km) {
        (Some(distance), Some(radius)) => radius < distance,
        _ => false,
    };
    GeofenceStatus { breached }
}
