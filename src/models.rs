use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Mode stored when a report carries no usable mode tag
pub const UNKNOWN_MODE: &str = "unknown";

/// Current state of a single vehicle as last reported by its device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    /// Unique vehicle identifier chosen by the driver device
    pub id: String,

    /// Latitude in degrees
    pub lat: f64,

    /// Longitude in degrees
    pub lon: f64,

    /// Lowercase transport mode tag (e.g. "taxi", "keke")
    pub mode: String,

    /// Route this vehicle is serving, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,

    /// Whether the driver opted in to location sharing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sharing: Option<bool>,

    /// Free-form role tag reported by some clients
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Time of the most recent accepted write
    pub last_update: DateTime<Utc>,
}

impl VehicleRecord {
    /// Seconds elapsed since the last accepted write, never negative
    pub fn age_seconds(&self, now: DateTime<Utc>) -> f64 {
        let millis = (now - self.last_update).num_milliseconds().max(0);
        millis as f64 / 1000.0
    }

    /// Check if this vehicle is serving the given route
    pub fn is_route(&self, route_id: &str) -> bool {
        self.route_id.as_deref() == Some(route_id)
    }

    pub fn is_sharing(&self) -> bool {
        self.sharing == Some(true)
    }
}

impl std::fmt::Display for VehicleRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} on route {} at ({:.6}, {:.6}) [{}]",
            self.mode,
            self.id,
            self.route_id.as_deref().unwrap_or("-"),
            self.lat,
            self.lon,
            self.last_update.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// A coordinate as delivered by a client: JSON numbers and query-string text
/// are both accepted. Anything else is kept as-is and rejected by `parse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoordinateInput {
    Number(f64),
    Text(String),
    Other(serde_json::Value),
}

impl CoordinateInput {
    /// Parse into finite degrees, naming `field` in the error
    pub fn parse(&self, field: &'static str) -> Result<f64, RegistryError> {
        let value = match self {
            CoordinateInput::Number(value) => *value,
            CoordinateInput::Text(text) => text.trim().parse::<f64>().map_err(|_| {
                RegistryError::validation(field, format!("{field} is not a number: {text:?}"))
            })?,
            CoordinateInput::Other(other) => {
                return Err(RegistryError::validation(
                    field,
                    format!("{field} must be a number, got {other}"),
                ));
            }
        };

        if !value.is_finite() {
            return Err(RegistryError::validation(
                field,
                format!("{field} must be a finite number"),
            ));
        }

        Ok(value)
    }
}

impl From<f64> for CoordinateInput {
    fn from(value: f64) -> Self {
        CoordinateInput::Number(value)
    }
}

impl From<&str> for CoordinateInput {
    fn from(value: &str) -> Self {
        CoordinateInput::Text(value.to_string())
    }
}

/// Raw position report, before validation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    pub id: Option<String>,
    pub lat: Option<CoordinateInput>,
    pub lon: Option<CoordinateInput>,
    pub mode: Option<String>,
    pub route_id: Option<String>,
    pub sharing: Option<bool>,
    pub role: Option<String>,
}

impl PositionReport {
    /// Build a report with the required fields set
    pub fn new(
        id: impl Into<String>,
        lat: impl Into<CoordinateInput>,
        lon: impl Into<CoordinateInput>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            lat: Some(lat.into()),
            lon: Some(lon.into()),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_route(mut self, route_id: impl Into<String>) -> Self {
        self.route_id = Some(route_id.into());
        self
    }

    pub fn with_sharing(mut self, sharing: bool) -> Self {
        self.sharing = Some(sharing);
        self
    }

    /// Validate required fields and normalize the rest into a record
    /// stamped with `now`.
    pub fn into_record(self, now: DateTime<Utc>) -> Result<VehicleRecord, RegistryError> {
        let id = self
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RegistryError::validation("id", "vehicle id is required"))?;

        let lat = self
            .lat
            .ok_or_else(|| RegistryError::validation("lat", "lat is required"))?
            .parse("lat")?;
        let lon = self
            .lon
            .ok_or_else(|| RegistryError::validation("lon", "lon is required"))?
            .parse("lon")?;

        Ok(VehicleRecord {
            id,
            lat,
            lon,
            mode: normalize_mode(self.mode.as_deref()),
            route_id: non_blank(self.route_id),
            sharing: self.sharing,
            role: non_blank(self.role),
            last_update: now,
        })
    }
}

/// Lowercase and trim a mode tag, falling back to "unknown"
pub fn normalize_mode(mode: Option<&str>) -> String {
    match mode.map(str::trim) {
        Some(mode) if !mode.is_empty() => mode.to_lowercase(),
        _ => UNKNOWN_MODE.to_string(),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Effective tracking state of a vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingState {
    Inactive,
    Active,
}

/// Stored tracking subscription for one vehicle id
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingSubscription {
    pub active: bool,
    pub last_active: DateTime<Utc>,
}

impl TrackingSubscription {
    /// Resolve the state observed at `now`. An active subscription that has
    /// not been refreshed within `timeout` reads as inactive. Pure, so
    /// concurrent readers always agree.
    pub fn resolve(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> TrackingState {
        if self.active && now - self.last_active <= timeout {
            TrackingState::Active
        } else {
            TrackingState::Inactive
        }
    }
}

/// Tracking status as reported to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingStatus {
    pub id: String,
    pub state: TrackingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active: Option<DateTime<Utc>>,
}

/// Predicates applied to a fleet listing. All set predicates must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListFilter {
    /// Only vehicles whose tracking subscription is effectively active
    pub tracking_only: bool,
    /// Only vehicles on this route
    pub route_id: Option<String>,
    /// Only vehicles with `sharing == true`
    pub sharing_only: bool,
}

impl ListFilter {
    pub fn route(route_id: impl Into<String>) -> Self {
        Self {
            route_id: Some(route_id.into()),
            ..Default::default()
        }
    }

    pub fn tracking() -> Self {
        Self {
            tracking_only: true,
            ..Default::default()
        }
    }

    /// Record-level predicates; tracking state is checked by the registry.
    pub(crate) fn matches_record(&self, record: &VehicleRecord) -> bool {
        if let Some(route_id) = &self.route_id {
            if !record.is_route(route_id) {
                return false;
            }
        }
        !self.sharing_only || record.is_sharing()
    }
}

/// One vehicle in a rider-facing fleet snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetEntry {
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sharing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub eta_minutes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<i64>,
    pub age_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn report_accepts_text_and_numeric_coordinates() {
        let record = PositionReport::new("v1", "8.4657", -13.2317)
            .with_mode("  Taxi ")
            .into_record(t0())
            .unwrap();

        assert_eq!(record.id, "v1");
        assert_eq!(record.lat, 8.4657);
        assert_eq!(record.lon, -13.2317);
        assert_eq!(record.mode, "taxi");
        assert_eq!(record.last_update, t0());
    }

    #[test]
    fn report_without_mode_is_unknown() {
        let record = PositionReport::new("v1", 1.0, 2.0).into_record(t0()).unwrap();
        assert_eq!(record.mode, UNKNOWN_MODE);

        let record = PositionReport::new("v1", 1.0, 2.0)
            .with_mode("   ")
            .into_record(t0())
            .unwrap();
        assert_eq!(record.mode, UNKNOWN_MODE);
    }

    #[test]
    fn report_rejects_missing_or_malformed_fields() {
        let missing_id = PositionReport {
            id: Some("  ".to_string()),
            ..PositionReport::new("x", 1.0, 2.0)
        };
        assert!(matches!(
            missing_id.into_record(t0()),
            Err(RegistryError::Validation { field: "id", .. })
        ));

        let missing_lat = PositionReport {
            lat: None,
            ..PositionReport::new("v1", 1.0, 2.0)
        };
        assert!(matches!(
            missing_lat.into_record(t0()),
            Err(RegistryError::Validation { field: "lat", .. })
        ));

        let bad_lon = PositionReport::new("v1", "1.0", "east");
        assert!(matches!(
            bad_lon.into_record(t0()),
            Err(RegistryError::Validation { field: "lon", .. })
        ));

        let nan = PositionReport::new("v1", "NaN", "1.0");
        assert!(matches!(
            nan.into_record(t0()),
            Err(RegistryError::Validation { field: "lat", .. })
        ));
    }

    #[test]
    fn out_of_range_coordinates_are_stored() {
        let record = PositionReport::new("v1", 123.0, -500.0)
            .into_record(t0())
            .unwrap();
        assert_eq!(record.lat, 123.0);
        assert_eq!(record.lon, -500.0);
    }

    #[test]
    fn untagged_coordinates_deserialize_from_json() {
        let report: PositionReport =
            serde_json::from_str(r#"{"id":"v1","lat":"10.5","lon":20}"#).unwrap();
        assert_eq!(report.lat, Some(CoordinateInput::Text("10.5".to_string())));
        assert_eq!(report.lon, Some(CoordinateInput::Number(20.0)));
    }

    #[test]
    fn non_numeric_json_coordinate_is_a_validation_error() {
        let report: PositionReport =
            serde_json::from_str(r#"{"id":"v1","lat":true,"lon":[1.0]}"#).unwrap();
        assert_eq!(
            report.lat,
            Some(CoordinateInput::Other(serde_json::Value::Bool(true)))
        );

        let err = report.into_record(t0()).unwrap_err();
        assert!(matches!(err, RegistryError::Validation { field: "lat", .. }));
    }

    #[test]
    fn subscription_expires_after_timeout() {
        let timeout = chrono::Duration::seconds(300);
        let sub = TrackingSubscription {
            active: true,
            last_active: t0(),
        };

        assert_eq!(sub.resolve(t0(), timeout), TrackingState::Active);
        assert_eq!(
            sub.resolve(t0() + chrono::Duration::seconds(300), timeout),
            TrackingState::Active
        );
        assert_eq!(
            sub.resolve(t0() + chrono::Duration::seconds(301), timeout),
            TrackingState::Inactive
        );

        let stopped = TrackingSubscription {
            active: false,
            last_active: t0(),
        };
        assert_eq!(stopped.resolve(t0(), timeout), TrackingState::Inactive);
    }

    #[test]
    fn filter_predicates_compose() {
        let record = PositionReport::new("v1", 1.0, 2.0)
            .with_route("R7")
            .with_sharing(true)
            .into_record(t0())
            .unwrap();

        assert!(ListFilter::default().matches_record(&record));
        assert!(ListFilter::route("R7").matches_record(&record));
        assert!(!ListFilter::route("R8").matches_record(&record));

        let both = ListFilter {
            route_id: Some("R7".to_string()),
            sharing_only: true,
            ..Default::default()
        };
        assert!(both.matches_record(&record));

        let mut not_sharing = record.clone();
        not_sharing.sharing = None;
        assert!(!both.matches_record(&not_sharing));
    }

    #[test]
    fn age_is_never_negative() {
        let record = PositionReport::new("v1", 1.0, 2.0).into_record(t0()).unwrap();
        assert_eq!(record.age_seconds(t0() - chrono::Duration::seconds(5)), 0.0);
        assert_eq!(record.age_seconds(t0() + chrono::Duration::milliseconds(1500)), 1.5);
    }
}
