use chrono::{Datelike, Timelike};

use crate::timeline::IntegratedRow;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let to_rad = |deg: f64| deg.to_radians();
    let dlat = to_rad(lat2 - lat1);
    let dlon = to_rad(lon2 - lon1);
    let a = (dlat / 2.0).sin().powi(2)
        + to_rad(lat1).cos() * to_rad(lat2).cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

/// Recomputes the calendar, interval, distance and speed columns from each
/// row's timestamp and resolved position. Rows must be ordered by timestamp.
pub fn derive_motion(rows: &mut [IntegratedRow]) {
    let mut prev: Option<(chrono::DateTime<chrono::Utc>, Option<(f64, f64)>)> = None;
    for row in rows.iter_mut() {
        row.hour = row.timestamp.hour();
        row.day_of_year = row.timestamp.ordinal();

        let position = row.position();
        let (time_diff, distance) = match prev {
            None => (None, None),
            Some((prev_time, prev_position)) => {
                let dt = (row.timestamp - prev_time)
                    .num_microseconds()
                    .map(|us| us as f64 / 1e6)
                    .unwrap_or_else(|| (row.timestamp - prev_time).num_seconds() as f64);
                let distance = match (prev_position, position) {
                    (Some((lat1, lon1)), Some((lat2, lon2))) => {
                        Some(haversine_km(lat1, lon1, lat2, lon2)).filter(|d| d.is_finite())
                    }
                    _ => None,
                };
                (Some(dt), distance)
            }
        };

        row.time_diff_seconds = time_diff;
        row.distance_km = distance;
        row.speed_kmh = match (distance, time_diff) {
            (Some(d), Some(dt)) => Some(d / (dt / 3600.0)).filter(|v| v.is_finite()),
            _ => None,
        };
        prev = Some((row.timestamp, position));
    }
}
