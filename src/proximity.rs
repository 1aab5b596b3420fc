//! Rider-to-vehicle distance and walking ETA.

use chrono::{DateTime, Utc};
use geo::{Distance, Geodesic, Point};
use serde::Serialize;

use crate::models::VehicleRecord;

/// Assumed walking speed, meters per second
pub const WALKING_SPEED_MPS: f64 = 1.4;

/// Base of the age-only ETA used when the rider position is unknown
const PLACEHOLDER_BASE_MINUTES: f64 = 5.0;

/// A latitude/longitude pair in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }

    fn to_point(self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }
}

/// Distance and ETA from a rider to a vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    pub distance_meters: i64,
    pub eta_minutes: i64,
}

/// Geodesic (WGS84) distance from rider to vehicle, rounded to the meter,
/// with the ETA at walking speed rounded to the minute. Halves round to even.
///
/// Returns `None` when either coordinate is outside the valid lat/lon range.
pub fn estimate(rider: Coordinate, vehicle: Coordinate) -> Option<Estimate> {
    if !rider.is_valid() || !vehicle.is_valid() {
        return None;
    }

    let meters = Geodesic.distance(rider.to_point(), vehicle.to_point());
    if !meters.is_finite() {
        return None;
    }

    let distance_meters = meters.round_ties_even();
    let eta_minutes = (distance_meters / (WALKING_SPEED_MPS * 60.0)).round_ties_even();

    Some(Estimate {
        distance_meters: distance_meters as i64,
        eta_minutes: eta_minutes as i64,
    })
}

/// Age-only ETA: `5 + age/60` minutes, halves rounded to even
pub fn placeholder_eta(age_seconds: f64) -> i64 {
    (PLACEHOLDER_BASE_MINUTES + age_seconds / 60.0).round_ties_even() as i64
}

/// ETA shown for one vehicle in a fleet listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eta {
    pub eta_minutes: i64,
    pub distance_meters: Option<i64>,
}

/// The single read-path decision between distance-based and age-based ETA.
/// Falls back to the age estimate when the rider is unknown or either
/// coordinate cannot be measured.
pub fn eta_for(record: &VehicleRecord, rider: Option<Coordinate>, now: DateTime<Utc>) -> Eta {
    let measured = rider.and_then(|rider| estimate(rider, Coordinate::new(record.lat, record.lon)));

    match measured {
        Some(estimate) => Eta {
            eta_minutes: estimate.eta_minutes,
            distance_meters: Some(estimate.distance_meters),
        },
        None => Eta {
            eta_minutes: placeholder_eta(record.age_seconds(now)),
            distance_meters: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionReport;
    use chrono::TimeZone;

    #[test]
    fn same_point_is_zero() {
        let origin = Coordinate::new(0.0, 0.0);
        assert_eq!(
            estimate(origin, origin),
            Some(Estimate {
                distance_meters: 0,
                eta_minutes: 0
            })
        );
    }

    #[test]
    fn one_degree_of_longitude_at_equator() {
        let est = estimate(Coordinate::new(0.0, 0.0), Coordinate::new(0.0, 1.0)).unwrap();

        assert!(
            (est.distance_meters - 111_320).abs() <= 5,
            "got {} m",
            est.distance_meters
        );
        let expected_eta = (est.distance_meters as f64 / 84.0).round_ties_even() as i64;
        assert_eq!(est.eta_minutes, expected_eta);
        assert_eq!(est.eta_minutes, 1325);
    }

    #[test]
    fn short_walk_in_freetown() {
        // Roughly 1.1 km north along the coast road
        let est = estimate(
            Coordinate::new(8.4840, -13.2340),
            Coordinate::new(8.4940, -13.2340),
        )
        .unwrap();
        assert!((1_100..1_110).contains(&est.distance_meters), "{est:?}");
        assert_eq!(est.eta_minutes, 13);
    }

    #[test]
    fn out_of_range_coordinates_are_not_measured() {
        assert_eq!(
            estimate(Coordinate::new(95.0, 0.0), Coordinate::new(0.0, 0.0)),
            None
        );
        assert_eq!(
            estimate(Coordinate::new(0.0, 0.0), Coordinate::new(0.0, 181.0)),
            None
        );
    }

    #[test]
    fn placeholder_grows_with_age() {
        assert_eq!(placeholder_eta(0.0), 5);
        assert_eq!(placeholder_eta(29.0), 5);
        assert_eq!(placeholder_eta(600.0), 15);
    }

    #[test]
    fn placeholder_halves_round_to_even() {
        // 6.5 and 7.5 minutes
        assert_eq!(placeholder_eta(90.0), 6);
        assert_eq!(placeholder_eta(150.0), 8);
        assert_eq!(placeholder_eta(91.0), 7);
    }

    #[test]
    fn eta_for_picks_one_mode() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let record = PositionReport::new("v1", 0.0, 1.0).into_record(t0).unwrap();
        let later = t0 + chrono::Duration::seconds(120);

        let with_rider = eta_for(&record, Some(Coordinate::new(0.0, 0.0)), later);
        assert_eq!(with_rider.eta_minutes, 1325);
        assert!(with_rider.distance_meters.is_some());

        let without_rider = eta_for(&record, None, later);
        assert_eq!(without_rider.eta_minutes, 7);
        assert_eq!(without_rider.distance_meters, None);

        let mut bad = record.clone();
        bad.lat = 123.0;
        let fallback = eta_for(&bad, Some(Coordinate::new(0.0, 0.0)), later);
        assert_eq!(fallback.distance_meters, None);
        assert_eq!(fallback.eta_minutes, 7);
    }
}
