use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::timeline::IntegratedTable;
use crate::{InterpolationMethod, SourceKind};

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_hours: f64,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SourceCoverage {
    pub columns: usize,
    pub records_with_data: usize,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SpatialExtent {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
    pub total_distance_km: f64,
    pub interpolated_positions: usize,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct IntegrationSummary {
    pub total_records: usize,
    pub time_range: Option<TimeRange>,
    pub data_sources: BTreeMap<SourceKind, SourceCoverage>,
    pub spatial_extent: Option<SpatialExtent>,
    pub columns: Vec<String>,
    pub method: InterpolationMethod,
    pub params_hash: String,
}

pub fn summarize(table: &IntegratedTable) -> IntegrationSummary {
    let rows = &table.rows;

    let time_range = match (
        rows.iter().map(|r| r.timestamp).min(),
        rows.iter().map(|r| r.timestamp).max(),
    ) {
        (Some(start), Some(end)) => Some(TimeRange {
            start,
            end,
            duration_hours: (end - start).num_milliseconds() as f64 / 3_600_000.0,
        }),
        _ => None,
    };

    let mut data_sources = BTreeMap::new();
    for source in table.sources() {
        let columns = table.source_columns(source).len();
        let records_with_data = rows.iter().filter(|r| r.has_source_data(source)).count();
        data_sources.insert(
            source,
            SourceCoverage {
                columns,
                records_with_data,
            },
        );
    }

    let mut extent: Option<SpatialExtent> = None;
    for (lat, lon) in rows.iter().filter_map(|r| r.position()) {
        let e = extent.get_or_insert(SpatialExtent {
            lat_min: lat,
            lat_max: lat,
            lon_min: lon,
            lon_max: lon,
            total_distance_km: 0.0,
            interpolated_positions: 0,
        });
        e.lat_min = e.lat_min.min(lat);
        e.lat_max = e.lat_max.max(lat);
        e.lon_min = e.lon_min.min(lon);
        e.lon_max = e.lon_max.max(lon);
    }
    if let Some(e) = extent.as_mut() {
        e.total_distance_km = rows.iter().filter_map(|r| r.distance_km).sum();
        e.interpolated_positions = rows.iter().filter(|r| r.is_interpolated).count();
    }

    IntegrationSummary {
        total_records: rows.len(),
        time_range,
        data_sources,
        spatial_extent: extent,
        columns: table.column_names(),
        method: table.method,
        params_hash: table.params_hash.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{derive_motion, merge_sources, IntegrationParams, Sample, TrackPoint};
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn summary_reports_span_coverage_and_extent() {
        let track = vec![
            TrackPoint::new(at(0), 41.00, -70.00),
            TrackPoint::new(at(3600), 41.02, -70.05),
            TrackPoint::new(at(7200), 41.05, -70.04),
        ];
        let fluoro = vec![
            Sample::new(at(1800)).with_field("sensor_ppb_rwt", 2.5),
            Sample::new(at(5400)).with_field("sensor_ppb_rwt", 2.7),
        ];
        let aqua = vec![Sample::new(at(1800))
            .with_field("ph", 8.0)
            .with_field("salinity", crate::FieldValue::Null)];
        let (mut table, _) = merge_sources(
            Some(&track),
            Some(&fluoro),
            Some(&aqua),
            &IntegrationParams::default(),
        )
        .unwrap();
        derive_motion(&mut table.rows);
        let summary = summarize(&table);

        assert_eq!(summary.total_records, 5);
        let range = summary.time_range.unwrap();
        assert_eq!(range.start, at(0));
        assert!((range.duration_hours - 2.0).abs() < 1e-9);

        let fl = &summary.data_sources[&SourceKind::Fluorometer];
        assert_eq!(fl.columns, 1);
        assert_eq!(fl.records_with_data, 2);
        let aq = &summary.data_sources[&SourceKind::WaterQuality];
        assert_eq!(aq.columns, 2);
        assert_eq!(aq.records_with_data, 1);

        let extent = summary.spatial_extent.unwrap();
        assert_eq!(extent.lat_min, 41.00);
        assert_eq!(extent.lat_max, 41.05);
        assert_eq!(extent.lon_min, -70.05);
        assert_eq!(extent.lon_max, -70.00);
        assert_eq!(extent.interpolated_positions, 2);
        let expected: f64 = table.rows.iter().filter_map(|r| r.distance_km).sum();
        assert!((extent.total_distance_km - expected).abs() < 1e-12);
        assert!(extent.total_distance_km > 0.0);
    }

    #[test]
    fn summary_without_positions_omits_extent() {
        let fluoro = vec![Sample::new(at(0)).with_field("gain", 10.0)];
        let (table, _) =
            merge_sources(None, Some(&fluoro), None, &IntegrationParams::default()).unwrap();
        let summary = summarize(&table);
        assert!(summary.spatial_extent.is_none());
        assert_eq!(summary.total_records, 1);
        assert_eq!(summary.time_range.unwrap().duration_hours, 0.0);
    }

    #[test]
    fn summary_serializes_source_keys() {
        let fluoro = vec![Sample::new(at(0)).with_field("gain", 10.0)];
        let (table, _) =
            merge_sources(None, Some(&fluoro), None, &IntegrationParams::default()).unwrap();
        let json = serde_json::to_value(summarize(&table)).unwrap();
        assert_eq!(json["data_sources"]["fluorometer"]["columns"], 1);
        assert!(json["spatial_extent"].is_null());
        assert_eq!(json["columns"][4], "fluoro_gain");
    }
}
