//! Registry operations as seen by the transport layer: writes are mirrored
//! in the background and reads are enriched with ETAs.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::RegistryError;
use crate::mirror::MirrorHandle;
use crate::models::{FleetEntry, ListFilter, PositionReport, TrackingStatus, VehicleRecord};
use crate::proximity::{self, Coordinate};
use crate::registry::Registry;
use crate::sweeper::{Sweeper, SweeperSettings};

#[derive(Clone)]
pub struct FleetService {
    registry: Arc<Registry>,
    mirror: MirrorHandle,
}

impl FleetService {
    pub fn new(registry: Arc<Registry>, mirror: MirrorHandle) -> Self {
        Self { registry, mirror }
    }

    /// Seed the registry from the durable mirror. Returns the number of
    /// records loaded; zero if the mirror is disabled or unreachable.
    pub async fn restore(&self) -> usize {
        if !self.mirror.is_enabled() {
            return 0;
        }
        let records = self.mirror.load_all().await;
        let loaded = self.registry.seed(records);
        tracing::info!(loaded, "Restored vehicles from durable mirror");
        loaded
    }

    /// Sweeper bound to this service's registry and mirror
    pub fn sweeper(&self, settings: SweeperSettings) -> Sweeper {
        Sweeper::new(self.registry.clone(), self.mirror.clone(), settings)
    }

    /// Accept a position report. The mirror write happens after the
    /// registry lock is released and never affects the result.
    pub fn report_position(&self, report: PositionReport) -> Result<VehicleRecord, RegistryError> {
        let record = self.registry.upsert(report)?;
        self.mirror.queue_upsert(record.clone());
        Ok(record)
    }

    /// Fleet snapshot with an ETA for every vehicle
    pub fn fleet(&self, filter: &ListFilter, rider: Option<Coordinate>) -> Vec<FleetEntry> {
        let records = self.registry.list(filter);
        let now = self.registry.now();
        records
            .iter()
            .map(|record| fleet_entry(record, rider, now))
            .collect()
    }

    pub fn vehicle(&self, id: &str, rider: Option<Coordinate>) -> Result<FleetEntry, RegistryError> {
        let record = self.registry.get(id)?;
        Ok(fleet_entry(&record, rider, self.registry.now()))
    }

    pub fn remove(&self, id: &str) -> Result<VehicleRecord, RegistryError> {
        let record = self.registry.remove(id)?;
        self.mirror.queue_delete(record.id.clone());
        tracing::info!(id = %record.id, "Removed vehicle");
        Ok(record)
    }

    pub async fn clear_all(&self) -> usize {
        let removed = self.registry.clear_all();
        let mirror_removed = self.mirror.clear().await;
        tracing::info!(removed, mirror_removed = ?mirror_removed, "Cleared all vehicles");
        removed
    }

    /// Wait until every mirror write issued so far has been attempted
    pub async fn flush(&self) {
        self.mirror.flush().await;
    }

    pub fn start_tracking(&self, id: &str) -> Result<TrackingStatus, RegistryError> {
        self.registry.start_tracking(id)
    }

    pub fn stop_tracking(&self, id: &str) -> Result<TrackingStatus, RegistryError> {
        self.registry.stop_tracking(id)
    }

    pub fn tracking_status(&self, id: &str) -> TrackingStatus {
        self.registry.tracking_status(id)
    }
}

fn fleet_entry(record: &VehicleRecord, rider: Option<Coordinate>, now: DateTime<Utc>) -> FleetEntry {
    let eta = proximity::eta_for(record, rider, now);
    FleetEntry {
        id: record.id.clone(),
        lat: record.lat,
        lon: record.lon,
        mode: record.mode.clone(),
        route_id: record.route_id.clone(),
        sharing: record.sharing,
        role: record.role.clone(),
        eta_minutes: eta.eta_minutes,
        distance_meters: eta.distance_meters,
        age_seconds: record.age_seconds(now),
    }
}
