use tracing::{info, info_span, Span};

use crate::motion::derive_motion;
use crate::summary::{summarize, IntegrationSummary};
use crate::timeline::{merge_sources, IntegratedTable, IntegrationDiagnostics};
use crate::{IntegrationError, IntegrationParams, InterpolationMethod, Sample, SourceKind, TrackPoint};

#[derive(Clone, Debug, PartialEq)]
pub enum SourceData {
    Gps(Vec<TrackPoint>),
    Fluorometer(Vec<Sample>),
    WaterQuality(Vec<Sample>),
}

impl SourceData {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceData::Gps(_) => SourceKind::Gps,
            SourceData::Fluorometer(_) => SourceKind::Fluorometer,
            SourceData::WaterQuality(_) => SourceKind::WaterQuality,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SourceData::Gps(points) => points.len(),
            SourceData::Fluorometer(samples) | SourceData::WaterQuality(samples) => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns the loaded source tables of one deployment and the table produced
/// from them. Log events are emitted inside the span given at construction.
#[derive(Debug)]
pub struct DrifterIntegrator {
    params: IntegrationParams,
    span: Span,
    gps: Option<Vec<TrackPoint>>,
    fluorometer: Option<Vec<Sample>>,
    water_quality: Option<Vec<Sample>>,
    integrated: Option<IntegratedTable>,
    diagnostics: Option<IntegrationDiagnostics>,
}

impl Default for DrifterIntegrator {
    fn default() -> Self {
        Self::new(IntegrationParams::default())
    }
}

impl DrifterIntegrator {
    pub fn new(params: IntegrationParams) -> Self {
        Self::with_span(params, info_span!("drifter_integration"))
    }

    pub fn with_span(params: IntegrationParams, span: Span) -> Self {
        Self {
            params,
            span,
            gps: None,
            fluorometer: None,
            water_quality: None,
            integrated: None,
            diagnostics: None,
        }
    }

    pub fn params(&self) -> &IntegrationParams {
        &self.params
    }

    /// Replaces any previously loaded table of the same kind.
    pub fn load(&mut self, data: SourceData) {
        let _guard = self.span.enter();
        info!("Loaded {} {} records", data.len(), data.kind().label());
        match data {
            SourceData::Gps(points) => self.gps = Some(points),
            SourceData::Fluorometer(samples) => self.fluorometer = Some(samples),
            SourceData::WaterQuality(samples) => self.water_quality = Some(samples),
        }
    }

    pub fn loaded(&self, kind: SourceKind) -> usize {
        match kind {
            SourceKind::Gps => self.gps.as_ref().map_or(0, Vec::len),
            SourceKind::Fluorometer => self.fluorometer.as_ref().map_or(0, Vec::len),
            SourceKind::WaterQuality => self.water_quality.as_ref().map_or(0, Vec::len),
        }
    }

    pub fn integrate(
        &mut self,
        method: InterpolationMethod,
    ) -> Result<&IntegratedTable, IntegrationError> {
        let _guard = self.span.enter();
        self.integrated = None;
        self.diagnostics = None;
        info!("Starting data integration ({} interpolation)", method);
        let params = self.params.with_method(method);
        let (mut table, diagnostics) = merge_sources(
            self.gps.as_deref(),
            self.fluorometer.as_deref(),
            self.water_quality.as_deref(),
            &params,
        )?;
        derive_motion(&mut table.rows);
        info!(
            "Integration complete: {} records with {} columns",
            table.len(),
            table.column_names().len()
        );
        self.diagnostics = Some(diagnostics);
        Ok(self.integrated.insert(table))
    }

    pub fn integrated(&self) -> Option<&IntegratedTable> {
        self.integrated.as_ref()
    }

    pub fn diagnostics(&self) -> Option<&IntegrationDiagnostics> {
        self.diagnostics.as_ref()
    }

    pub fn summary(&self) -> Result<IntegrationSummary, IntegrationError> {
        self.integrated
            .as_ref()
            .map(summarize)
            .ok_or(IntegrationError::NotIntegrated)
    }
}

/// One-shot integration of whichever sources are present.
pub fn integrate_drifter_data(
    gps: Option<Vec<TrackPoint>>,
    fluorometer: Option<Vec<Sample>>,
    water_quality: Option<Vec<Sample>>,
    params: &IntegrationParams,
) -> Result<IntegratedTable, IntegrationError> {
    let mut integrator = DrifterIntegrator::new(params.clone());
    if let Some(points) = gps {
        integrator.load(SourceData::Gps(points));
    }
    if let Some(samples) = fluorometer {
        integrator.load(SourceData::Fluorometer(samples));
    }
    if let Some(samples) = water_quality {
        integrator.load(SourceData::WaterQuality(samples));
    }
    integrator.integrate(params.method)?;
    integrator.integrated.take().ok_or(IntegrationError::NotIntegrated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldValue;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_688_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn integrate_without_sources_is_no_data() {
        let mut integrator = DrifterIntegrator::default();
        assert_eq!(
            integrator.integrate(InterpolationMethod::Linear).unwrap_err(),
            IntegrationError::NoData
        );
        integrator.load(SourceData::Fluorometer(Vec::new()));
        assert_eq!(
            integrator.integrate(InterpolationMethod::Linear).unwrap_err(),
            IntegrationError::NoData
        );
    }

    #[test]
    fn summary_before_integrate_is_not_integrated() {
        let mut integrator = DrifterIntegrator::default();
        integrator.load(SourceData::Gps(vec![TrackPoint::new(at(0), 1.0, 2.0)]));
        assert_eq!(integrator.summary().unwrap_err(), IntegrationError::NotIntegrated);
    }

    #[test]
    fn full_run_derives_motion_and_summary() {
        let mut integrator = DrifterIntegrator::default();
        integrator.load(SourceData::Gps(vec![
            TrackPoint::new(at(0), 0.0, 0.0),
            TrackPoint::new(at(3600), 0.0, 1.0),
        ]));
        integrator.load(SourceData::Fluorometer(vec![Sample::new(at(1800))
            .with_field("temperature_c", 18.2)]));
        assert_eq!(integrator.loaded(SourceKind::Gps), 2);

        let table = integrator.integrate(InterpolationMethod::Linear).unwrap();
        assert_eq!(table.len(), 3);
        let mid = &table.rows[1];
        assert!(mid.is_interpolated);
        assert!((mid.longitude.unwrap() - 0.5).abs() < 1e-9);
        assert_eq!(mid.time_diff_seconds, Some(1800.0));
        assert_eq!(mid.value(SourceKind::Fluorometer, "temperature_c"), &FieldValue::Number(18.2));

        let summary = integrator.summary().unwrap();
        let extent = summary.spatial_extent.unwrap();
        assert!((extent.total_distance_km - 111.19).abs() < 0.05);
        assert_eq!(extent.interpolated_positions, 1);
        assert_eq!(integrator.diagnostics().unwrap().timeline_len, 3);
    }

    #[test]
    fn integrate_method_overrides_params() {
        let track: Vec<_> = (0..5)
            .map(|i| TrackPoint::new(at(i * 600), (i as f64 * 0.9).sin(), i as f64 * 0.1))
            .collect();
        let mut integrator = DrifterIntegrator::default();
        integrator.load(SourceData::Gps(track));
        integrator.load(SourceData::WaterQuality(vec![Sample::new(at(900)).with_field("ph", 8.0)]));

        let linear = integrator.integrate(InterpolationMethod::Linear).unwrap().clone();
        let cubic = integrator.integrate(InterpolationMethod::Cubic).unwrap().clone();
        assert_eq!(cubic.method, InterpolationMethod::Cubic);
        assert_ne!(linear.params_hash, cubic.params_hash);
        assert_eq!(linear.rows[2].timestamp, at(900));
        assert_ne!(linear.rows[2].latitude, cubic.rows[2].latitude);
        assert_eq!(
            integrator.diagnostics().unwrap().interpolation.applied,
            Some(InterpolationMethod::Cubic)
        );
    }

    #[test]
    fn failed_integration_discards_previous_table() {
        let mut integrator = DrifterIntegrator::default();
        integrator.load(SourceData::Gps(vec![TrackPoint::new(at(0), 1.0, 2.0)]));
        integrator.integrate(InterpolationMethod::Linear).unwrap();
        assert_eq!(integrator.summary().unwrap().total_records, 1);

        integrator.load(SourceData::Gps(Vec::new()));
        assert_eq!(
            integrator.integrate(InterpolationMethod::Linear).unwrap_err(),
            IntegrationError::NoData
        );
        assert_eq!(integrator.summary().unwrap_err(), IntegrationError::NotIntegrated);
        assert!(integrator.integrated().is_none());
        assert!(integrator.diagnostics().is_none());
    }

    #[test]
    fn reloading_replaces_source() {
        let mut integrator = DrifterIntegrator::default();
        integrator.load(SourceData::Gps(vec![TrackPoint::new(at(0), 1.0, 2.0)]));
        integrator.load(SourceData::Gps(vec![
            TrackPoint::new(at(10), 1.0, 2.0),
            TrackPoint::new(at(20), 1.0, 2.0),
        ]));
        let table = integrator.integrate(InterpolationMethod::Linear).unwrap();
        assert_eq!(table.timestamps(), vec![at(10), at(20)]);
    }

    #[test]
    fn convenience_entry_point() {
        let table = integrate_drifter_data(
            Some(vec![
                TrackPoint::new(at(0), 10.0, 20.0),
                TrackPoint::new(at(100), 10.01, 20.01),
            ]),
            None,
            Some(vec![Sample::new(at(50)).with_field("ph", 7.7)]),
            &IntegrationParams::default(),
        )
        .unwrap();
        assert_eq!(table.len(), 3);
        assert!((table.rows[1].latitude.unwrap() - 10.005).abs() < 1e-9);
        assert!(table.rows[1].speed_kmh.is_some());

        assert_eq!(
            integrate_drifter_data(None, None, None, &IntegrationParams::default()).unwrap_err(),
            IntegrationError::NoData
        );
    }
}
