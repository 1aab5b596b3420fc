//! Drives a fake fleet along GeoJSON routes, pinging the tracker's update
//! endpoint the way the driver app does.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use geojson::{FeatureCollection, GeoJson};

const SUPPORTED_MODES: [&str; 6] = [
    "Podapoda",
    "Keke",
    "Taxi",
    "Paratransit Bus",
    "WAKA FINE Bus",
    "Motorbike",
];

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tracker update endpoint
    #[arg(long, default_value = "http://127.0.0.1:5000/api/location/update")]
    backend: String,
    /// GeoJSON FeatureCollection of route LineStrings with a `mode` property
    #[arg(long)]
    routes: PathBuf,
    #[arg(long, default_value_t = 10)]
    interval_secs: u64,
    #[arg(long, env = "FLEETWATCH_API_KEY")]
    api_key: Option<String>,
}

/// One simulated vehicle looping along a route
#[derive(Debug)]
struct SimVehicle {
    id: String,
    mode: String,
    /// (lon, lat) pairs as stored in GeoJSON
    path: Vec<(f64, f64)>,
    position_index: usize,
}

impl SimVehicle {
    /// Current (lat, lon), then step to the next point
    fn advance(&mut self) -> (f64, f64) {
        let (lon, lat) = self.path[self.position_index % self.path.len()];
        self.position_index = (self.position_index + 1) % self.path.len();
        (lat, lon)
    }
}

fn vehicle_id(mode: &str, index: usize) -> String {
    let compact: String = mode
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    format!("{}_{}", compact, index)
}

fn route_path(geometry: &geojson::Geometry) -> Option<Vec<(f64, f64)>> {
    let line = match &geometry.value {
        geojson::Value::LineString(line) => line,
        geojson::Value::MultiLineString(lines) => lines.first()?,
        _ => return None,
    };
    let path: Vec<(f64, f64)> = line
        .iter()
        .filter_map(|position| match position.as_slice() {
            [lon, lat, ..] => Some((*lon, *lat)),
            _ => None,
        })
        .collect();
    (!path.is_empty()).then_some(path)
}

/// One vehicle per supported mode, on the first route tagged with that mode
fn build_fleet(routes: &FeatureCollection) -> Vec<SimVehicle> {
    let mut vehicles = Vec::new();

    for (index, mode) in SUPPORTED_MODES.iter().enumerate() {
        let path = routes.features.iter().find_map(|feature| {
            let route_mode = feature.property("mode")?.as_str()?;
            if !route_mode.eq_ignore_ascii_case(mode) {
                return None;
            }
            route_path(feature.geometry.as_ref()?)
        });

        match path {
            Some(path) => {
                let position_index = rand::random_range(0..path.len());
                vehicles.push(SimVehicle {
                    id: vehicle_id(mode, index),
                    mode: mode.to_string(),
                    path,
                    position_index,
                });
            }
            None => tracing::warn!(mode, "No route found for mode"),
        }
    }

    vehicles
}

async fn ping(client: &reqwest::Client, args: &Args, vehicle: &mut SimVehicle) -> Result<()> {
    let (lat, lon) = vehicle.advance();

    let mut query = vec![
        ("id", vehicle.id.clone()),
        ("lat", lat.to_string()),
        ("lon", lon.to_string()),
        ("mode", vehicle.mode.clone()),
    ];
    if let Some(key) = &args.api_key {
        query.push(("api_key", key.clone()));
    }

    let response = client
        .get(&args.backend)
        .query(&query)
        .send()
        .await
        .context("Failed to reach tracker")?;

    if !response.status().is_success() {
        anyhow::bail!("Tracker returned error status: {}", response.status());
    }

    tracing::info!(id = %vehicle.id, mode = %vehicle.mode, lat, lon, "Sent position");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let raw = tokio::fs::read_to_string(&args.routes)
        .await
        .with_context(|| format!("Failed to read {}", args.routes.display()))?;
    let routes = match raw.parse::<GeoJson>().context("Invalid GeoJSON")? {
        GeoJson::FeatureCollection(collection) => collection,
        _ => anyhow::bail!("Routes file must be a FeatureCollection"),
    };

    let mut vehicles = build_fleet(&routes);
    if vehicles.is_empty() {
        anyhow::bail!("No routes matched any supported mode");
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create HTTP client")?;

    tracing::info!(
        vehicles = vehicles.len(),
        interval_secs = args.interval_secs,
        backend = %args.backend,
        "Simulator started"
    );

    let mut interval = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Simulator stopped");
                return Ok(());
            }
            _ = interval.tick() => {
                for vehicle in vehicles.iter_mut() {
                    if let Err(e) = ping(&client, &args, vehicle).await {
                        tracing::warn!(id = %vehicle.id, error = %e, "Ping failed, will retry on next interval");
                    }
                }
            }
        }
    }
}
