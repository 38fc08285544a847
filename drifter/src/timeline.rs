//! Unified timeline construction and per-source joins.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::interpolate::{interpolate_with_report, InterpolationReport};
use crate::{
    FieldKey, FieldValue, IntegrationError, IntegrationParams, InterpolationMethod, Sample,
    SourceKind, TrackPoint,
};

static NULL_VALUE: FieldValue = FieldValue::Null;

#[derive(Clone, Debug, PartialEq)]
pub struct IntegratedRow {
    pub timestamp: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub is_interpolated: bool,
    pub values: BTreeMap<FieldKey, FieldValue>,
    pub hour: u32,
    pub day_of_year: u32,
    pub time_diff_seconds: Option<f64>,
    pub distance_km: Option<f64>,
    pub speed_kmh: Option<f64>,
}

impl IntegratedRow {
    fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            latitude: None,
            longitude: None,
            is_interpolated: true,
            values: BTreeMap::new(),
            hour: 0,
            day_of_year: 0,
            time_diff_seconds: None,
            distance_km: None,
            speed_kmh: None,
        }
    }

    /// Joined value for a source field; `Null` when the source had no sample here.
    pub fn value(&self, source: SourceKind, field: &str) -> &FieldValue {
        self.values
            .get(&FieldKey::new(source, field))
            .unwrap_or(&NULL_VALUE)
    }

    pub fn position(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    pub fn has_source_data(&self, source: SourceKind) -> bool {
        self.values
            .iter()
            .any(|(key, value)| key.source == source && !value.is_null())
    }

    pub fn speed_mps(&self) -> Option<f64> {
        self.speed_kmh.map(|v| v / 3.6)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntegratedTable {
    pub columns: Vec<FieldKey>,
    pub rows: Vec<IntegratedRow>,
    pub method: InterpolationMethod,
    pub params_hash: String,
}

impl IntegratedTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.rows.iter().map(|r| r.timestamp).collect()
    }

    pub fn source_columns(&self, source: SourceKind) -> Vec<&FieldKey> {
        self.columns.iter().filter(|c| c.source == source).collect()
    }

    pub fn sources(&self) -> BTreeSet<SourceKind> {
        self.columns.iter().map(|c| c.source).collect()
    }

    pub fn row_at(&self, timestamp: &DateTime<Utc>) -> Option<&IntegratedRow> {
        self.rows
            .binary_search_by(|r| r.timestamp.cmp(timestamp))
            .ok()
            .map(|idx| &self.rows[idx])
    }

    /// Flat column names in export order.
    pub fn column_names(&self) -> Vec<String> {
        let mut names: Vec<String> = ["timestamp", "latitude", "longitude", "is_interpolated"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        names.extend(self.columns.iter().map(|c| c.to_string()));
        names.extend(
            [
                "hour",
                "day_of_year",
                "time_diff_seconds",
                "distance_km",
                "speed_kmh",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        names
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct IntegrationDiagnostics {
    pub timeline_len: usize,
    pub gps_points: usize,
    pub fluorometer_samples: usize,
    pub water_quality_samples: usize,
    pub duplicate_samples_collapsed: BTreeMap<SourceKind, usize>,
    pub interpolation: InterpolationReport,
}

/// Builds the unified timeline, interpolates positions onto it and left-joins
/// every non-empty sample source by exact timestamp.
///
/// The calendar, interval, distance and speed columns of the returned rows are
/// left unset (`hour`/`day_of_year` are 0) until [`crate::derive_motion`] runs.
pub fn merge_sources(
    gps: Option<&[TrackPoint]>,
    fluorometer: Option<&[Sample]>,
    water_quality: Option<&[Sample]>,
    params: &IntegrationParams,
) -> Result<(IntegratedTable, IntegrationDiagnostics), IntegrationError> {
    let gps = gps.filter(|t| !t.is_empty());
    let fluorometer = fluorometer.filter(|s| !s.is_empty());
    let water_quality = water_quality.filter(|s| !s.is_empty());

    let mut all_times: BTreeSet<DateTime<Utc>> = BTreeSet::new();
    if let Some(track) = gps {
        all_times.extend(track.iter().map(|p| p.timestamp));
    }
    for samples in [fluorometer, water_quality].into_iter().flatten() {
        all_times.extend(samples.iter().map(|s| s.timestamp));
    }
    if all_times.is_empty() {
        return Err(IntegrationError::NoData);
    }
    let timeline: Vec<DateTime<Utc>> = all_times.into_iter().collect();
    info!("Integrating data over {} timestamps", timeline.len());

    let (fixes, report) = interpolate_with_report(gps.unwrap_or(&[]), &timeline, params);
    let mut rows: Vec<IntegratedRow> = fixes
        .into_iter()
        .map(|fix| {
            let mut row = IntegratedRow::new(fix.timestamp);
            if fix.has_position() {
                row.latitude = Some(fix.latitude);
                row.longitude = Some(fix.longitude);
            }
            row.is_interpolated = fix.is_interpolated;
            row
        })
        .collect();

    let mut diagnostics = IntegrationDiagnostics {
        timeline_len: timeline.len(),
        gps_points: gps.map_or(0, |t| t.len()),
        fluorometer_samples: fluorometer.map_or(0, |s| s.len()),
        water_quality_samples: water_quality.map_or(0, |s| s.len()),
        interpolation: report,
        ..IntegrationDiagnostics::default()
    };

    let mut columns = Vec::new();
    for (kind, samples) in [
        (SourceKind::Fluorometer, fluorometer),
        (SourceKind::WaterQuality, water_quality),
    ] {
        let Some(samples) = samples else { continue };
        let (source_columns, collapsed) = join_source(&mut rows, kind, samples);
        if collapsed > 0 {
            warn!(
                "{} {} samples shared a timestamp with a later sample and were dropped",
                collapsed,
                kind.label()
            );
            diagnostics.duplicate_samples_collapsed.insert(kind, collapsed);
        }
        debug!("Joined {} {} columns", source_columns.len(), kind.label());
        columns.extend(source_columns);
    }

    Ok((
        IntegratedTable {
            columns,
            rows,
            method: params.method,
            params_hash: params.params_hash_sha256(),
        },
        diagnostics,
    ))
}

/// Sorted merge of one source onto the timeline rows. Every sample timestamp is
/// already on the timeline, so each sample lands on exactly one row.
fn join_source(
    rows: &mut [IntegratedRow],
    kind: SourceKind,
    samples: &[Sample],
) -> (Vec<FieldKey>, usize) {
    let excluded = kind.excluded_fields();
    let mut ordered: Vec<&Sample> = samples.iter().collect();
    ordered.sort_by_key(|s| s.timestamp);

    let mut names: BTreeSet<&str> = BTreeSet::new();
    let mut collapsed = 0usize;
    let mut cursor = 0usize;
    for (i, sample) in ordered.iter().enumerate() {
        if ordered
            .get(i + 1)
            .is_some_and(|next| next.timestamp == sample.timestamp)
        {
            collapsed += 1;
            continue;
        }
        while cursor < rows.len() && rows[cursor].timestamp < sample.timestamp {
            cursor += 1;
        }
        let Some(row) = rows.get_mut(cursor) else { break };
        if row.timestamp != sample.timestamp {
            continue;
        }
        for (name, value) in &sample.fields {
            if excluded.contains(&name.as_str()) {
                continue;
            }
            names.insert(name.as_str());
            row.values.insert(FieldKey::new(kind, name.as_str()), value.clone());
        }
    }

    let columns = names.into_iter().map(|n| FieldKey::new(kind, n)).collect();
    (columns, collapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_690_000_000 + seconds, 0).unwrap()
    }

    fn fluoro(seconds: i64, temp: f64) -> Sample {
        Sample::new(at(seconds))
            .with_field("temperature_c", temp)
            .with_field("serial_number", "FL-0042")
    }

    fn aqua(seconds: i64, ph: f64) -> Sample {
        Sample::new(at(seconds))
            .with_field("ph", ph)
            .with_field("latitude", 0.0)
            .with_field("longitude", 0.0)
    }

    #[test]
    fn no_sources_is_an_error() {
        let err = merge_sources(None, None, None, &IntegrationParams::default()).unwrap_err();
        assert_eq!(err, IntegrationError::NoData);
        let err = merge_sources(Some(&[]), Some(&[]), None, &IntegrationParams::default())
            .unwrap_err();
        assert_eq!(err, IntegrationError::NoData);
    }

    #[test]
    fn timeline_contains_every_source_timestamp_once() {
        let track = vec![
            TrackPoint::new(at(0), 10.0, 20.0),
            TrackPoint::new(at(120), 10.1, 20.1),
        ];
        let fl = vec![fluoro(30, 12.0), fluoro(120, 12.5)];
        let aq = vec![aqua(60, 7.9), aqua(30, 8.0)];
        let (table, diag) =
            merge_sources(Some(&track), Some(&fl), Some(&aq), &IntegrationParams::default())
                .unwrap();
        assert_eq!(table.timestamps(), vec![at(0), at(30), at(60), at(120)]);
        assert_eq!(diag.timeline_len, 4);
        assert!(table.rows.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn source_fields_join_under_their_namespace() {
        let fl = vec![fluoro(30, 12.0), fluoro(90, 12.5)];
        let aq = vec![aqua(60, 7.9)];
        let (table, _) =
            merge_sources(None, Some(&fl), Some(&aq), &IntegrationParams::default()).unwrap();

        for sample in &fl {
            let row = table.row_at(&sample.timestamp).unwrap();
            for (name, value) in &sample.fields {
                assert_eq!(row.value(SourceKind::Fluorometer, name), value);
            }
        }
        let row = table.row_at(&at(60)).unwrap();
        assert_eq!(row.value(SourceKind::WaterQuality, "ph"), &FieldValue::Number(7.9));
        assert!(row.value(SourceKind::Fluorometer, "temperature_c").is_null());
        assert!(!row.has_source_data(SourceKind::Fluorometer));

        let names: Vec<String> = table.columns.iter().map(|c| c.to_string()).collect();
        assert_eq!(names, vec!["fluoro_serial_number", "fluoro_temperature_c", "aqua_ph"]);
    }

    #[test]
    fn water_quality_coordinates_never_replace_track_position() {
        let track = vec![
            TrackPoint::new(at(0), 41.0, -70.0),
            TrackPoint::new(at(100), 41.1, -70.1),
        ];
        let aq = vec![aqua(0, 8.1)];
        let (table, _) =
            merge_sources(Some(&track), None, Some(&aq), &IntegrationParams::default()).unwrap();
        let row = table.row_at(&at(0)).unwrap();
        assert_eq!(row.position(), Some((41.0, -70.0)));
        assert!(row.value(SourceKind::WaterQuality, "latitude").is_null());
        assert!(table
            .columns
            .iter()
            .all(|c| c.name != "latitude" && c.name != "longitude"));
    }

    #[test]
    fn no_gps_leaves_positions_empty() {
        let fl = vec![fluoro(0, 11.0), fluoro(60, 11.5)];
        let (table, diag) =
            merge_sources(None, Some(&fl), None, &IntegrationParams::default()).unwrap();
        assert!(table.rows.iter().all(|r| r.position().is_none() && r.is_interpolated));
        assert_eq!(diag.gps_points, 0);
    }

    #[test]
    fn duplicate_source_timestamps_collapse_last_wins() {
        let fl = vec![fluoro(30, 12.0), fluoro(30, 13.0), fluoro(60, 14.0)];
        let (table, diag) =
            merge_sources(None, Some(&fl), None, &IntegrationParams::default()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.rows[0].value(SourceKind::Fluorometer, "temperature_c"),
            &FieldValue::Number(13.0)
        );
        assert_eq!(
            diag.duplicate_samples_collapsed.get(&SourceKind::Fluorometer),
            Some(&1)
        );
    }

    #[test]
    fn gps_fixes_mark_rows_exact() {
        let track = vec![
            TrackPoint::new(at(0), 10.0, 20.0),
            TrackPoint::new(at(600), 10.6, 20.6),
        ];
        let fl = vec![fluoro(300, 12.0)];
        let (table, _) =
            merge_sources(Some(&track), Some(&fl), None, &IntegrationParams::default()).unwrap();
        assert!(!table.rows[0].is_interpolated);
        assert!(table.rows[1].is_interpolated);
        assert!((table.rows[1].latitude.unwrap() - 10.3).abs() < 1e-9);
        assert!(!table.rows[2].is_interpolated);
    }

    #[test]
    fn calendar_columns_wait_for_motion_derivation() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap();
        let (mut table, _) = merge_sources(
            Some(&[TrackPoint::new(ts, 1.0, 2.0)]),
            None,
            None,
            &IntegrationParams::default(),
        )
        .unwrap();
        assert_eq!(table.rows[0].day_of_year, 0);
        crate::derive_motion(&mut table.rows);
        assert_eq!(table.rows[0].hour, 6);
        assert_eq!(table.rows[0].day_of_year, 61);
    }

    #[test]
    fn column_names_follow_export_order() {
        let fl = vec![fluoro(0, 11.0)];
        let (table, _) =
            merge_sources(None, Some(&fl), None, &IntegrationParams::default()).unwrap();
        let names = table.column_names();
        assert_eq!(names[0], "timestamp");
        assert_eq!(names[4], "fluoro_serial_number");
        assert_eq!(names.last().map(String::as_str), Some("speed_kmh"));
    }
}
