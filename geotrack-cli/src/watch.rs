use anyhow::{Context, anyhow};
use log::{error, info, warn};
use tokio::sync::mpsc;

use geotrack_logic::{
    Coordinates, StateUpdateSender, TrackingSettings, TrackingSnapshot, TrackingViewModel,
    ViewPhase,
};
use geotrack_transport::{BackendClient, GoogleGeocoder, StompTransport};

use crate::{Result, session::Session, simulated::SimulatedLocation};

struct UpdateSender(mpsc::Sender<()>);

impl StateUpdateSender for UpdateSender {
    fn send_update(&self) {
        // Full means an update is already pending
        let _ = self.0.try_send(());
    }
}

type ViewModel = TrackingViewModel<StompTransport, SimulatedLocation, UpdateSender>;

pub struct WatchOptions {
    pub device_id: String,
    pub track: bool,
    pub origin: Option<Coordinates>,
    pub wander_m: f64,
    pub feed_url: String,
    pub geocode_key: Option<String>,
}

fn format_coords(coords: &Coordinates) -> String {
    format!("{:.5}, {:.5}", coords.latitude, coords.longitude)
}

fn status_line(snapshot: &TrackingSnapshot) -> String {
    let mut parts = vec![format!("[{:?}]", snapshot.phase)];

    match &snapshot.last_sample {
        Some(sample) => {
            parts.push(format_coords(&sample.coordinates()));
            if let Some(distance) = sample.distance_from_home {
                parts.push(format!("{distance:.2} km from home"));
            }
            parts.push(format!("at {}", sample.timestamp));
        }
        None => parts.push("no location yet".to_string()),
    }

    if snapshot.geofence_radius_km.is_some() {
        parts.push(
            if snapshot.breached {
                "OUTSIDE GEOFENCE"
            } else {
                "inside geofence"
            }
            .to_string(),
        );
    }

    if snapshot.is_tracking {
        let published = snapshot
            .last_known_location
            .as_ref()
            .map(format_coords)
            .unwrap_or_else(|| "nothing yet".to_string());
        parts.push(format!("tracking (last sent {published})"));
    }

    if let Some(error) = &snapshot.error {
        parts.push(format!("error: {error}"));
    }

    parts.join(" | ")
}

async fn describe(geocoder: Option<&GoogleGeocoder>, coords: Coordinates) -> String {
    let Some(geocoder) = geocoder else {
        return format_coords(&coords);
    };
    match geocoder.reverse_geocode(coords).await {
        Ok(Some(address)) => format!("{address} ({})", format_coords(&coords)),
        Ok(None) => format!("Address not found ({})", format_coords(&coords)),
        Err(why) => {
            warn!("Reverse geocoding failed: {why:?}");
            format_coords(&coords)
        }
    }
}

pub async fn run(backend: &BackendClient, session: &Session, opts: WatchOptions) -> Result {
    let token = session
        .token
        .as_deref()
        .ok_or_else(|| anyhow!("Not logged in, run `geotrack login` first"))?;

    let home = backend
        .device_home(&opts.device_id, token)
        .await
        .with_context(|| format!("Couldn't load home of {}", opts.device_id))?;

    let geocoder = opts
        .geocode_key
        .as_deref()
        .map(GoogleGeocoder::new)
        .transpose()?;

    println!(
        "{} home: {}",
        home.device_name.as_deref().unwrap_or(&opts.device_id),
        describe(geocoder.as_ref(), home.home).await
    );
    match home.geofence_radius_km {
        Some(radius) => println!("Geofence radius: {radius} km"),
        None => println!("No geofence set"),
    }

    let origin = opts.origin.unwrap_or(home.home);
    let (tx, mut rx) = mpsc::channel(1);

    let view = ViewModel::new(
        opts.device_id.clone(),
        home,
        session.owned_device.as_deref(),
        StompTransport::new(opts.feed_url),
        SimulatedLocation::new(origin, opts.wander_m),
        UpdateSender(tx),
        TrackingSettings::default(),
    );

    if opts.track && !view.is_owner() {
        warn!("This machine doesn't own {}, watching read-only", opts.device_id);
    }

    view.mount(token)?;

    let mut last_line = String::new();
    let mut was_breached = false;

    loop {
        tokio::select! {
            biased;

            res = tokio::signal::ctrl_c() => {
                res.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted, shutting down");
                break;
            }

            update = rx.recv() => {
                if update.is_none() {
                    break;
                }

                let snapshot = view.snapshot();

                if snapshot.phase == ViewPhase::Closed {
                    break;
                }

                if opts.track && snapshot.controls_enabled && !snapshot.is_tracking {
                    if let Err(why) = view.start_tracking() {
                        error!("Couldn't start tracking: {why}");
                    }
                }

                if snapshot.breached && !was_breached {
                    if let Some(coords) = snapshot.current_location {
                        warn!(
                            "{} left its geofence, now at {}",
                            snapshot.device_id,
                            describe(geocoder.as_ref(), coords).await
                        );
                    }
                }
                was_breached = snapshot.breached;

                let line = status_line(&snapshot);
                if line != last_line {
                    println!("{line}");
                    last_line = line;
                }
            }
        }
    }

    view.dispose().await;
    Ok(())
}
