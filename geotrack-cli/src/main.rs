mod session;
mod simulated;
mod watch;

use std::{path::PathBuf, result::Result as StdResult};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use log::{LevelFilter, info};

use geotrack_logic::Coordinates;
use geotrack_transport::{BACKEND_HTTP_URL, BackendClient, feed_url_for};

use session::SessionStore;
use watch::WatchOptions;

type Result<T = (), E = anyhow::Error> = StdResult<T, E>;

#[derive(Parser)]
#[command(name = "geotrack", version, about)]
struct Cli {
    /// HTTP base URL of the tracking backend
    #[arg(long, env = "GEOTRACK_BACKEND", default_value = BACKEND_HTTP_URL)]
    backend: String,

    /// WebSocket URL of the location feed, derived from the backend URL if not given
    #[arg(long, env = "GEOTRACK_FEED_URL")]
    feed_url: Option<String>,

    /// Where to keep the login session and owned device identifier
    #[arg(long, env = "GEOTRACK_STORE", default_value = "geotrack-session.json")]
    store: PathBuf,

    /// Google Maps API key, enables printing addresses
    #[arg(long, env = "GEOTRACK_GEOCODE_KEY")]
    geocode_key: Option<String>,

    /// More logging, repeat for even more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and remember the session token
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "GEOTRACK_PASSWORD")]
        password: String,
    },
    /// Forget the session token
    Logout,
    /// Claim a device identifier for this machine, a new one is generated if not given
    Adopt {
        unique_id: Option<String>,
    },
    /// Watch a device's live location
    Watch {
        device_id: String,
        /// Publish this machine's (simulated) location while connected, owners only
        #[arg(long)]
        track: bool,
        /// Latitude to simulate around, defaults to the device's home
        #[arg(long, requires = "lng", allow_hyphen_values = true)]
        lat: Option<f64>,
        /// Longitude to simulate around, defaults to the device's home
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lng: Option<f64>,
        /// How far in metres the simulated location strays from its origin
        #[arg(long, default_value_t = 0.0)]
        wander_m: f64,
    },
}

fn init_logging(verbose: u8) {
    let mut builder = colog::default_builder();
    match verbose {
        0 => {}
        1 => {
            builder.filter_level(LevelFilter::Debug);
        }
        _ => {
            builder.filter_level(LevelFilter::Trace);
        }
    }
    builder.init();
}

#[tokio::main]
async fn main() -> Result {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let store = SessionStore::new(&cli.store);
    let backend = BackendClient::new(&cli.backend)?;

    match cli.command {
        Commands::Login { email, password } => {
            let login = backend.login(&email, &password).await.context("Login failed")?;
            store.update(|s| {
                s.token = Some(login.token);
                s.user = Some(login.user);
            })?;
            println!("Logged in as {email}");
        }
        Commands::Logout => {
            store.update(|s| {
                s.token = None;
                s.user = None;
            })?;
            println!("Logged out");
        }
        Commands::Adopt { unique_id } => {
            let id = unique_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            if id.trim().is_empty() {
                bail!("Device identifier can't be empty");
            }
            store.update(|s| s.owned_device = Some(id.clone()))?;
            info!("Saved owned device identifier to {}", store.path().display());
            println!("{id}");
        }
        Commands::Watch {
            device_id,
            track,
            lat,
            lng,
            wander_m,
        } => {
            let session = store.load()?;
            let origin = lat.zip(lng).map(|(lat, lng)| Coordinates::new(lat, lng));
            let feed_url = cli
                .feed_url
                .unwrap_or_else(|| feed_url_for(backend.base_url()));

            watch::run(
                &backend,
                &session,
                WatchOptions {
                    device_id,
                    track,
                    origin,
                    wander_m,
                    feed_url,
                    geocode_key: cli.geocode_key,
                },
            )
            .await?;
        }
    }

    Ok(())
}
