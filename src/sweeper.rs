//! Background eviction of stale vehicles.
//!
//! On every tick the sweeper drops records whose last update is older than
//! the staleness threshold, first from the registry and then from the
//! durable mirror. A failing mirror is logged and the next tick runs as
//! usual; in-memory eviction never waits on it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::mirror::MirrorHandle;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweeperSettings {
    /// Maximum record age before eviction, see [`crate::config::ChurnProfile`]
    pub staleness: Duration,
    /// Time between sweeps
    pub period: Duration,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(600),
            period: Duration::from_secs(60),
        }
    }
}

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepReport {
    pub cutoff: DateTime<Utc>,
    /// Records removed from the registry
    pub evicted: usize,
    /// Rows removed from the mirror; `None` if disabled or it failed
    pub mirror_deleted: Option<u64>,
}

pub struct Sweeper {
    registry: Arc<Registry>,
    mirror: MirrorHandle,
    settings: SweeperSettings,
}

impl Sweeper {
    pub fn new(registry: Arc<Registry>, mirror: MirrorHandle, settings: SweeperSettings) -> Self {
        Self {
            registry,
            mirror,
            settings,
        }
    }

    /// Run one eviction pass at the registry's current time
    pub async fn sweep_once(&self) -> SweepReport {
        let staleness = chrono::Duration::from_std(self.settings.staleness)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = self
            .registry
            .now()
            .checked_sub_signed(staleness)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let evicted = self.registry.evict(cutoff);
        let mirror_deleted = self.mirror.delete_before(cutoff).await;

        if evicted > 0 || mirror_deleted.is_some_and(|n| n > 0) {
            info!(
                evicted,
                mirror_deleted = mirror_deleted.unwrap_or(0),
                remaining = self.registry.len(),
                "Evicted stale vehicles"
            );
        } else {
            debug!(remaining = self.registry.len(), "No stale vehicles");
        }

        SweepReport {
            cutoff,
            evicted,
            mirror_deleted,
        }
    }

    /// Sweep on a fixed period until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            staleness_secs = self.settings.staleness.as_secs(),
            period_secs = self.settings.period.as_secs(),
            mirror = self.mirror.is_enabled(),
            "Eviction sweeper starting"
        );

        let mut interval = tokio::time::interval(self.settings.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the first immediate tick
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Eviction sweeper shutting down");
                    break;
                }

                _ = interval.tick() => {
                    self.sweep_once().await;
                }
            }
        }
    }

    /// Spawn [`Sweeper::run`] on the runtime
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
