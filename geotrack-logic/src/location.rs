use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sample::Coordinates;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
/// A fix as returned by a geolocation source
pub struct Position {
    pub coords: Coordinates,
    /// Accuracy radius in metres, if the source knows it
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionOptions {
    pub enable_high_accuracy: bool,
    pub timeout: Duration,
    /// Oldest cached fix the source may hand back, zero means always take a fresh one
    pub maximum_age: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeolocationError {
    #[error("Geolocation error: permission denied")]
    PermissionDenied,
    #[error("Geolocation error: position unavailable ({0})")]
    PositionUnavailable(String),
    #[error("Geolocation error: timed out after {0:?}")]
    Timeout(Duration),
}

pub trait GeolocationSource: Send + Sync + 'static {
    /// Get a one-shot fix of the local device's position. The caller enforces
    /// [PositionOptions::timeout].
    fn current_position(
        &self,
        options: &PositionOptions,
    ) -> impl Future<Output = Result<Position, GeolocationError>> + Send;
}
