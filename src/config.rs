use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::registry::RegistrySettings;
use crate::sweeper::SweeperSettings;

/// Staleness presets for different deployments
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ChurnProfile {
    /// Vehicles disappear 30 seconds after their last report
    Fast,
    /// Vehicles disappear 10 minutes after their last report
    Slow,
}

impl ChurnProfile {
    pub fn staleness(self) -> Duration {
        match self {
            ChurnProfile::Fast => Duration::from_secs(30),
            ChurnProfile::Slow => Duration::from_secs(600),
        }
    }
}

/// Public transport tracker backend
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "FLEETWATCH_BIND", default_value = "0.0.0.0:5000")]
    pub bind: SocketAddr,

    /// SQLite file for the durable mirror; omit to run memory-only
    #[arg(long, env = "FLEETWATCH_DATABASE")]
    pub database: Option<PathBuf>,

    /// Staleness preset
    #[arg(long, env = "FLEETWATCH_CHURN", value_enum, default_value_t = ChurnProfile::Slow)]
    pub churn: ChurnProfile,

    /// Override the preset's staleness threshold
    #[arg(long, env = "FLEETWATCH_STALENESS_SECS")]
    pub staleness_secs: Option<u64>,

    #[arg(long, env = "FLEETWATCH_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Minimum spacing between accepted updates per vehicle; 0 disables
    #[arg(long, env = "FLEETWATCH_MIN_UPDATE_INTERVAL_MS", default_value_t = 2_000)]
    pub min_update_interval_ms: u64,

    #[arg(long, env = "FLEETWATCH_TRACKING_TIMEOUT_SECS", default_value_t = 300)]
    pub tracking_timeout_secs: u64,

    /// Upper bound on each durable mirror call
    #[arg(long, env = "FLEETWATCH_MIRROR_TIMEOUT_MS", default_value_t = 3_000)]
    pub mirror_timeout_ms: u64,

    /// Accepted API keys for write endpoints; empty leaves them open
    #[arg(long, env = "FLEETWATCH_API_KEYS", value_delimiter = ',')]
    pub api_keys: Vec<String>,

    /// Only list vehicles with an active tracking session
    #[arg(long, env = "FLEETWATCH_REQUIRE_TRACKING")]
    pub require_tracking: bool,
}

impl Config {
    pub fn staleness(&self) -> Duration {
        self.staleness_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.churn.staleness())
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        // Values past chrono's range saturate instead of panicking
        let min_update_interval = i64::try_from(self.min_update_interval_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .unwrap_or(chrono::Duration::MAX);
        let tracking_timeout = i64::try_from(self.tracking_timeout_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);

        RegistrySettings {
            min_update_interval,
            tracking_timeout,
        }
    }

    pub fn sweeper_settings(&self) -> SweeperSettings {
        SweeperSettings {
            staleness: self.staleness(),
            period: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }

    pub fn mirror_timeout(&self) -> Duration {
        Duration::from_millis(self.mirror_timeout_ms)
    }
}
