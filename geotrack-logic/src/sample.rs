use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Convenience alias for UTC DT
pub type UtcDT = DateTime<Utc>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
/// A point on the map
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One location reading, either relayed by the server or produced locally.
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Distance from the device's home in kilometres, filled in by the server. Always
    /// [None] for samples produced locally.
    pub distance_from_home: Option<f64>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// Why an inbound feed message was not turned into a [LocationSample]
pub enum MalformedMessage {
    #[error("message body is not valid JSON: {0}")]
    NotJson(String),
    #[error("message has no numeric latitude and longitude")]
    MissingCoordinates,
}

impl LocationSample {
    /// Parse a message body from the location topic.
    ///
    /// The body must be a JSON object with numeric `latitude` and `longitude`. `distance`
    /// is taken when numeric, and `dataTime` becomes the timestamp when it's a string,
    /// otherwise the arrival time is used.
    pub fn from_feed_body(body: &str, received_at: UtcDT) -> Result<Self, MalformedMessage> {
        let value = serde_json::from_str::<Value>(body)
            .map_err(|why| MalformedMessage::NotJson(why.to_string()))?;

        let latitude = value.get("latitude").and_then(Value::as_f64);
        let longitude = value.get("longitude").and_then(Value::as_f64);

        let (Some(latitude), Some(longitude)) = (latitude, longitude) else {
            return Err(MalformedMessage::MissingCoordinates);
        };

        let distance_from_home = value.get("distance").and_then(Value::as_f64);
        let timestamp = value
            .get("dataTime")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| received_at.to_rfc3339());

        Ok(Self {
            latitude,
            longitude,
            distance_from_home,
            timestamp,
        })
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceRef {
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Payload pushed to the update destination when publishing our own position
pub struct OutboundLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub device: DeviceRef,
}

impl OutboundLocation {
    pub fn new(device_id: impl Into<String>, coords: Coordinates) -> Self {
        Self {
            latitude: coords.latitude,
            longitude: coords.longitude,
            device: DeviceRef {
                device_id: device_id.into(),
            },
        }
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Home location and geofence of a registered device
pub struct DeviceHome {
    pub home: Coordinates,
    /// Radius of the geofence around [DeviceHome::home], [None] if the device has none
    pub geofence_radius_km: Option<f64>,
    /// Identifier the device was registered with, compared against the locally owned one
    pub unique_id: Option<String>,
    pub device_name: Option<String>,
}
