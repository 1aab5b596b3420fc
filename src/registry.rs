//! In-memory registry of live vehicle positions.
//!
//! Three tables live here: the vehicle records, the rate limiter's
//! last-accepted-write times, and the tracking subscriptions. Records and
//! rate-limit bookkeeping share one lock so that "check the gate, then write"
//! is a single critical section. Subscriptions have their own lock and are
//! never held at the same time as the fleet lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::clock::Clock;
use crate::error::RegistryError;
use crate::models::{
    ListFilter, PositionReport, TrackingState, TrackingStatus, TrackingSubscription,
    VehicleRecord,
};

/// Minimum spacing between accepted writes for one vehicle
pub const DEFAULT_MIN_UPDATE_INTERVAL_MS: i64 = 2_000;

/// How long a tracking session stays active without a refresh
pub const DEFAULT_TRACKING_TIMEOUT_SECS: i64 = 300;

/// Tunables for the registry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistrySettings {
    /// Writes for the same id closer together than this are rejected.
    /// Zero disables rate limiting.
    pub min_update_interval: chrono::Duration,

    /// Active subscriptions not refreshed within this window read as inactive
    pub tracking_timeout: chrono::Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            min_update_interval: chrono::Duration::milliseconds(DEFAULT_MIN_UPDATE_INTERVAL_MS),
            tracking_timeout: chrono::Duration::seconds(DEFAULT_TRACKING_TIMEOUT_SECS),
        }
    }
}

#[derive(Default)]
struct FleetTable {
    vehicles: HashMap<String, VehicleRecord>,
    last_accepted: HashMap<String, DateTime<Utc>>,
}

/// Authoritative table of current vehicle positions
pub struct Registry {
    fleet: RwLock<FleetTable>,
    subscriptions: RwLock<HashMap<String, TrackingSubscription>>,
    clock: Arc<dyn Clock>,
    settings: RegistrySettings,
}

impl Registry {
    pub fn new(clock: Arc<dyn Clock>, settings: RegistrySettings) -> Self {
        Self {
            fleet: RwLock::new(FleetTable::default()),
            subscriptions: RwLock::new(HashMap::new()),
            clock,
            settings,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Validate a report and replace the vehicle's record with it.
    ///
    /// The rate-limit check and the write happen under one lock, so two
    /// racing writes for the same id can never both be accepted inside the
    /// minimum interval. An active tracking session for the id is refreshed.
    pub fn upsert(&self, report: PositionReport) -> Result<VehicleRecord, RegistryError> {
        let mut record = report.into_record(self.clock.now())?;

        let now = {
            let mut fleet = self.fleet.write();
            let now = self.clock.now();

            let last = fleet.last_accepted.get(&record.id).copied();
            if let Some(remaining) = self.rate_limit_remaining(last, now) {
                let retry_after = remaining.to_std().unwrap_or_default();
                tracing::debug!(
                    id = %record.id,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rejected update, rate limited"
                );
                return Err(RegistryError::RateLimited {
                    id: record.id,
                    retry_after,
                });
            }

            record.last_update = match fleet.vehicles.get(&record.id) {
                Some(previous) => now.max(previous.last_update),
                None => now,
            };
            fleet.last_accepted.insert(record.id.clone(), now);
            fleet.vehicles.insert(record.id.clone(), record.clone());
            now
        };

        self.refresh_tracking(&record.id, now);

        tracing::debug!(vehicle = %record, "Accepted position update");
        Ok(record)
    }

    /// Point-in-time copy of every record matching `filter`, ordered by id
    pub fn list(&self, filter: &ListFilter) -> Vec<VehicleRecord> {
        let mut records: Vec<VehicleRecord> = {
            let fleet = self.fleet.read();
            fleet
                .vehicles
                .values()
                .filter(|record| filter.matches_record(record))
                .cloned()
                .collect()
        };

        if filter.tracking_only {
            let now = self.clock.now();
            let subscriptions = self.subscriptions.read();
            records.retain(|record| {
                subscriptions.get(&record.id).is_some_and(|sub| {
                    sub.resolve(now, self.settings.tracking_timeout) == TrackingState::Active
                })
            });
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn get(&self, id: &str) -> Result<VehicleRecord, RegistryError> {
        self.fleet
            .read()
            .vehicles
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(id))
    }

    /// Delete one vehicle. Its tracking subscription is left alone.
    pub fn remove(&self, id: &str) -> Result<VehicleRecord, RegistryError> {
        let mut fleet = self.fleet.write();
        fleet.last_accepted.remove(id);
        fleet
            .vehicles
            .remove(id)
            .ok_or_else(|| RegistryError::not_found(id))
    }

    /// Empty the registry and the rate limiter. Subscriptions survive.
    pub fn clear_all(&self) -> usize {
        let mut fleet = self.fleet.write();
        let removed = fleet.vehicles.len();
        fleet.vehicles.clear();
        fleet.last_accepted.clear();
        removed
    }

    /// Remove every record last updated strictly before `before`.
    /// Rate-limit entries older than the cutoff are pruned too.
    pub fn evict(&self, before: DateTime<Utc>) -> usize {
        let mut fleet = self.fleet.write();
        let count = fleet.vehicles.len();
        fleet.vehicles.retain(|_, record| record.last_update >= before);
        fleet.last_accepted.retain(|_, accepted| *accepted >= before);
        count - fleet.vehicles.len()
    }

    /// Load records recovered from the durable mirror. Existing entries that
    /// are at least as fresh win.
    pub fn seed(&self, records: impl IntoIterator<Item = VehicleRecord>) -> usize {
        let mut fleet = self.fleet.write();
        let mut loaded = 0;
        for record in records {
            let fresher = fleet
                .vehicles
                .get(&record.id)
                .map_or(true, |existing| existing.last_update < record.last_update);
            if fresher {
                fleet.vehicles.insert(record.id.clone(), record);
                loaded += 1;
            }
        }
        loaded
    }

    pub fn len(&self) -> usize {
        self.fleet.read().vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn start_tracking(&self, id: &str) -> Result<TrackingStatus, RegistryError> {
        let id = tracking_id(id)?;
        let now = self.clock.now();
        self.subscriptions.write().insert(
            id.to_string(),
            TrackingSubscription {
                active: true,
                last_active: now,
            },
        );
        tracing::info!(id, "Tracking started");
        Ok(TrackingStatus {
            id: id.to_string(),
            state: TrackingState::Active,
            last_active: Some(now),
        })
    }

    pub fn stop_tracking(&self, id: &str) -> Result<TrackingStatus, RegistryError> {
        let id = tracking_id(id)?;
        let now = self.clock.now();
        let last_active = {
            let mut subscriptions = self.subscriptions.write();
            let sub = subscriptions
                .entry(id.to_string())
                .or_insert(TrackingSubscription {
                    active: false,
                    last_active: now,
                });
            sub.active = false;
            sub.last_active
        };
        tracing::info!(id, "Tracking stopped");
        Ok(TrackingStatus {
            id: id.to_string(),
            state: TrackingState::Inactive,
            last_active: Some(last_active),
        })
    }

    /// Effective tracking state at the current time. Unseen ids are inactive.
    pub fn tracking_status(&self, id: &str) -> TrackingStatus {
        let now = self.clock.now();
        let subscriptions = self.subscriptions.read();
        match subscriptions.get(id) {
            Some(sub) => TrackingStatus {
                id: id.to_string(),
                state: sub.resolve(now, self.settings.tracking_timeout),
                last_active: Some(sub.last_active),
            },
            None => TrackingStatus {
                id: id.to_string(),
                state: TrackingState::Inactive,
                last_active: None,
            },
        }
    }

    /// Time left before `last` falls outside the minimum update interval
    fn rate_limit_remaining(
        &self,
        last: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<chrono::Duration> {
        let interval = self.settings.min_update_interval;
        if interval <= chrono::Duration::zero() {
            return None;
        }
        let elapsed = now - last?;
        (elapsed < interval).then(|| interval - elapsed)
    }

    fn refresh_tracking(&self, id: &str, now: DateTime<Utc>) {
        let mut subscriptions = self.subscriptions.write();
        if let Some(sub) = subscriptions.get_mut(id) {
            if sub.resolve(now, self.settings.tracking_timeout) == TrackingState::Active {
                sub.last_active = now;
            }
        }
    }
}

fn tracking_id(id: &str) -> Result<&str, RegistryError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(RegistryError::validation("id", "vehicle id is required"));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (Arc<ManualClock>, Registry) {
        let clock = Arc::new(ManualClock::new(t0()));
        let registry = Registry::new(clock.clone(), RegistrySettings::default());
        (clock, registry)
    }

    #[test]
    fn get_after_upsert_returns_written_fields() {
        let (clock, registry) = setup();

        let first = registry
            .upsert(PositionReport::new("v1", 10.0, 20.0).with_mode("Taxi"))
            .unwrap();
        assert_eq!(registry.get("v1").unwrap(), first);
        assert_eq!(first.last_update, t0());

        clock.advance(Duration::seconds(5));
        registry
            .upsert(PositionReport::new("v1", 11.0, 21.0).with_route("R2"))
            .unwrap();

        let stored = registry.get("v1").unwrap();
        assert_eq!(stored.lat, 11.0);
        assert_eq!(stored.lon, 21.0);
        assert_eq!(stored.route_id.as_deref(), Some("R2"));
        // Whole-record replace: the earlier mode is not merged in
        assert_eq!(stored.mode, "unknown");
        assert!(stored.last_update >= first.last_update);
    }

    #[test]
    fn last_update_never_goes_backwards() {
        let clock = Arc::new(ManualClock::new(t0()));
        let registry = Registry::new(
            clock.clone(),
            RegistrySettings {
                min_update_interval: Duration::zero(),
                ..Default::default()
            },
        );
        registry.upsert(PositionReport::new("v1", 1.0, 1.0)).unwrap();

        // Wall clock steps back a minute
        clock.set(t0() - Duration::seconds(60));
        let record = registry.upsert(PositionReport::new("v1", 2.0, 2.0)).unwrap();
        assert_eq!(record.last_update, t0());
        assert_eq!(record.lat, 2.0);
    }

    #[test]
    fn invalid_reports_are_rejected_without_side_effects() {
        let (_clock, registry) = setup();
        let err = registry
            .upsert(PositionReport::new("v1", "north", 1.0))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation { field: "lat", .. }));
        assert!(registry.is_empty());

        // A rejected write does not consume the rate-limit window
        registry.upsert(PositionReport::new("v1", 1.0, 1.0)).unwrap();
    }

    #[test]
    fn second_write_inside_interval_is_rate_limited() {
        let (clock, registry) = setup();
        let first = registry.upsert(PositionReport::new("v1", 1.0, 1.0)).unwrap();

        clock.advance(Duration::milliseconds(500));
        let err = registry
            .upsert(PositionReport::new("v1", 2.0, 2.0))
            .unwrap_err();
        match err {
            RegistryError::RateLimited { id, retry_after } => {
                assert_eq!(id, "v1");
                assert_eq!(retry_after, std::time::Duration::from_millis(1_500));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        assert_eq!(registry.get("v1").unwrap(), first);

        clock.advance(Duration::milliseconds(1_500));
        let accepted = registry.upsert(PositionReport::new("v1", 2.0, 2.0)).unwrap();
        assert_eq!(accepted.lat, 2.0);
    }

    #[test]
    fn rate_limit_is_per_vehicle() {
        let (_clock, registry) = setup();
        registry.upsert(PositionReport::new("v1", 1.0, 1.0)).unwrap();
        registry.upsert(PositionReport::new("v2", 1.0, 1.0)).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn zero_interval_disables_rate_limiting() {
        let clock = Arc::new(ManualClock::new(t0()));
        let registry = Registry::new(
            clock,
            RegistrySettings {
                min_update_interval: Duration::zero(),
                ..Default::default()
            },
        );
        registry.upsert(PositionReport::new("v1", 1.0, 1.0)).unwrap();
        registry.upsert(PositionReport::new("v1", 2.0, 2.0)).unwrap();
        assert_eq!(registry.get("v1").unwrap().lat, 2.0);
    }

    #[test]
    fn evict_boundary_is_strict() {
        let (_clock, registry) = setup();
        registry.upsert(PositionReport::new("v1", 1.0, 1.0)).unwrap();

        assert_eq!(registry.evict(t0()), 0);
        assert_eq!(registry.evict(t0() - Duration::seconds(1)), 0);
        assert!(registry.get("v1").is_ok());

        assert_eq!(registry.evict(t0() + Duration::seconds(1)), 1);
        assert!(matches!(
            registry.get("v1"),
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[test]
    fn evict_keeps_fresh_records() {
        let (clock, registry) = setup();
        registry.upsert(PositionReport::new("old", 1.0, 1.0)).unwrap();
        clock.advance(Duration::seconds(100));
        registry.upsert(PositionReport::new("new", 1.0, 1.0)).unwrap();

        assert_eq!(registry.evict(t0() + Duration::seconds(50)), 1);
        let ids: Vec<_> = registry
            .list(&ListFilter::default())
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["new".to_string()]);
    }

    #[test]
    fn clear_all_empties_registry_but_keeps_subscriptions() {
        let (_clock, registry) = setup();
        registry.upsert(PositionReport::new("v1", 10.0, 20.0).with_mode("taxi")).unwrap();
        registry.start_tracking("v1").unwrap();

        assert_eq!(registry.clear_all(), 1);
        assert!(registry.list(&ListFilter::default()).is_empty());
        assert_eq!(registry.tracking_status("v1").state, TrackingState::Active);

        // Rate limiter bookkeeping is reset with the table
        registry.upsert(PositionReport::new("v1", 10.0, 20.0)).unwrap();
    }

    #[test]
    fn remove_deletes_single_vehicle() {
        let (_clock, registry) = setup();
        registry.upsert(PositionReport::new("v1", 1.0, 1.0)).unwrap();
        registry.upsert(PositionReport::new("v2", 1.0, 1.0)).unwrap();

        assert_eq!(registry.remove("v1").unwrap().id, "v1");
        assert!(matches!(
            registry.remove("v1"),
            Err(RegistryError::NotFound { .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_clock, registry) = setup();
        assert!(matches!(
            registry.get("missing"),
            Err(RegistryError::NotFound { id }) if id == "missing"
        ));
    }

    #[test]
    fn list_filters_and_together() {
        let (_clock, registry) = setup();
        registry
            .upsert(PositionReport::new("a", 1.0, 1.0).with_route("R1").with_sharing(true))
            .unwrap();
        registry
            .upsert(PositionReport::new("b", 1.0, 1.0).with_route("R1"))
            .unwrap();
        registry
            .upsert(PositionReport::new("c", 1.0, 1.0).with_route("R2").with_sharing(true))
            .unwrap();
        registry.start_tracking("a").unwrap();
        registry.start_tracking("c").unwrap();

        let ids = |filter: ListFilter| -> Vec<String> {
            registry.list(&filter).into_iter().map(|r| r.id).collect()
        };

        assert_eq!(ids(ListFilter::default()), vec!["a", "b", "c"]);
        assert_eq!(ids(ListFilter::route("R1")), vec!["a", "b"]);
        assert_eq!(ids(ListFilter::tracking()), vec!["a", "c"]);
        assert_eq!(
            ids(ListFilter {
                tracking_only: true,
                route_id: Some("R1".to_string()),
                sharing_only: true,
            }),
            vec!["a"]
        );
    }

    #[test]
    fn start_tracking_twice_keeps_latest_timestamp() {
        let (clock, registry) = setup();
        registry.start_tracking("v1").unwrap();
        clock.advance(Duration::seconds(30));
        let status = registry.start_tracking("v1").unwrap();

        assert_eq!(status.state, TrackingState::Active);
        let seen = registry.tracking_status("v1");
        assert_eq!(seen.state, TrackingState::Active);
        assert_eq!(seen.last_active, Some(t0() + Duration::seconds(30)));
    }

    #[test]
    fn stop_tracking_is_idempotent_and_works_for_unseen_ids() {
        let (_clock, registry) = setup();
        assert_eq!(registry.tracking_status("v1").state, TrackingState::Inactive);
        assert_eq!(registry.tracking_status("v1").last_active, None);

        registry.stop_tracking("v1").unwrap();
        registry.stop_tracking("v1").unwrap();
        assert_eq!(registry.tracking_status("v1").state, TrackingState::Inactive);

        registry.start_tracking("v1").unwrap();
        registry.stop_tracking("v1").unwrap();
        assert_eq!(registry.tracking_status("v1").state, TrackingState::Inactive);
    }

    #[test]
    fn tracking_requires_an_id() {
        let (_clock, registry) = setup();
        assert!(matches!(
            registry.start_tracking(" "),
            Err(RegistryError::Validation { field: "id", .. })
        ));
    }

    #[test]
    fn tracking_times_out_lazily() {
        let (clock, registry) = setup();
        registry.start_tracking("v1").unwrap();

        clock.advance(Duration::seconds(DEFAULT_TRACKING_TIMEOUT_SECS + 1));
        assert_eq!(registry.tracking_status("v1").state, TrackingState::Inactive);
        assert!(registry.list(&ListFilter::tracking()).is_empty());

        // A report after expiry does not revive the session
        registry.upsert(PositionReport::new("v1", 1.0, 1.0)).unwrap();
        assert_eq!(registry.tracking_status("v1").state, TrackingState::Inactive);
    }

    #[test]
    fn position_reports_keep_tracking_alive() {
        let (clock, registry) = setup();
        registry.start_tracking("v1").unwrap();

        for _ in 0..5 {
            clock.advance(Duration::seconds(200));
            registry.upsert(PositionReport::new("v1", 1.0, 1.0)).unwrap();
        }

        let status = registry.tracking_status("v1");
        assert_eq!(status.state, TrackingState::Active);
        assert_eq!(status.last_active, Some(t0() + Duration::seconds(1_000)));
    }

    #[test]
    fn eviction_leaves_subscription_in_place() {
        let (clock, registry) = setup();
        registry.upsert(PositionReport::new("v1", 1.0, 1.0)).unwrap();
        registry.start_tracking("v1").unwrap();

        clock.advance(Duration::seconds(10));
        assert_eq!(registry.evict(clock.now()), 1);
        assert_eq!(registry.tracking_status("v1").state, TrackingState::Active);
    }

    #[test]
    fn seed_prefers_fresher_records() {
        let (_clock, registry) = setup();
        let old = PositionReport::new("v1", 1.0, 1.0)
            .into_record(t0() - Duration::seconds(30))
            .unwrap();
        let fresh = PositionReport::new("v1", 2.0, 2.0).into_record(t0()).unwrap();

        assert_eq!(registry.seed([fresh.clone()]), 1);
        assert_eq!(registry.seed([old]), 0);
        assert_eq!(registry.get("v1").unwrap(), fresh);
    }

    #[test]
    fn concurrent_writers_to_distinct_ids_are_all_visible() {
        let (_clock, registry) = setup();

        std::thread::scope(|scope| {
            for n in 0..32 {
                let registry = &registry;
                scope.spawn(move || {
                    registry
                        .upsert(PositionReport::new(format!("v{n}"), n as f64, n as f64))
                        .unwrap();
                });
            }
        });

        let records = registry.list(&ListFilter::default());
        assert_eq!(records.len(), 32);
        for n in 0..32 {
            assert_eq!(registry.get(&format!("v{n}")).unwrap().lat, n as f64);
        }
    }

    #[test]
    fn concurrent_writers_to_one_id_pass_the_gate_once() {
        let (_clock, registry) = setup();

        let accepted = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|n| {
                    let registry = &registry;
                    scope.spawn(move || registry.upsert(PositionReport::new("v1", n as f64, 0.0)))
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap().ok())
                .collect::<Vec<_>>()
        });

        assert_eq!(accepted.len(), 1);
        assert_eq!(registry.get("v1").unwrap(), accepted[0]);
    }
}
