use geotrack_logic::{Coordinates, GeolocationError, GeolocationSource, Position, PositionOptions};

const METRES_PER_DEGREE: f64 = 111_320.0;

/// Stands in for a GPS, reports random points within `wander_m` metres of an origin
pub struct SimulatedLocation {
    origin: Coordinates,
    wander_m: f64,
}

impl SimulatedLocation {
    pub fn new(origin: Coordinates, wander_m: f64) -> Self {
        Self {
            origin,
            wander_m: wander_m.max(0.0),
        }
    }

    fn sample(&self) -> Coordinates {
        if self.wander_m == 0.0 {
            return self.origin;
        }

        let distance = self.wander_m * rand::random_range(0.0..=1.0_f64).sqrt();
        let bearing = rand::random_range(0.0..std::f64::consts::TAU);

        let d_lat = distance * bearing.cos() / METRES_PER_DEGREE;
        let lng_scale = (METRES_PER_DEGREE * self.origin.latitude.to_radians().cos()).max(1.0);
        let d_lng = distance * bearing.sin() / lng_scale;

        Coordinates::new(self.origin.latitude + d_lat, self.origin.longitude + d_lng)
    }
}

impl GeolocationSource for SimulatedLocation {
    async fn current_position(
        &self,
        _options: &PositionOptions,
    ) -> Result<Position, GeolocationError> {
        Ok(Position {
            coords: self.sample(),
            accuracy: Some(self.wander_m),
        })
    }
}
