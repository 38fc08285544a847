//! Drifter telemetry integration: merges GPS fixes, fluorometer logs and
//! water-quality logs onto one timeline with interpolated positions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod aquatroll;
pub mod fluorometer;
pub mod gpx_reader;
pub mod integrator;
pub mod interpolate;
pub mod motion;
pub mod summary;
pub mod timeline;

pub use aquatroll::{
    parse_aquatroll, parse_aquatroll_file, parse_aquatroll_folder, AquaTrollReport, ColumnInfo,
};
pub use fluorometer::{
    fluorometer_summary, parse_fluorometer, parse_fluorometer_file, parse_fluorometer_folder,
    FluorometerSummary,
};
pub use gpx_reader::{gpx_file_summary, gpx_summary, parse_gpx, parse_gpx_file, GpxSummary};
pub use integrator::{integrate_drifter_data, DrifterIntegrator, SourceData};
pub use interpolate::{interpolate_positions, InterpolationReport, PositionFix};
pub use motion::{derive_motion, haversine_km, EARTH_RADIUS_KM};
pub use summary::{summarize, IntegrationSummary, SourceCoverage, SpatialExtent, TimeRange};
pub use timeline::{merge_sources, IntegratedRow, IntegratedTable, IntegrationDiagnostics};

pub const DEFAULT_EXACT_FIX_TOLERANCE_S: f64 = 30.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntegrationError {
    #[error("no data loaded for integration")]
    NoData,
    #[error("no integrated data available; run integrate first")]
    NotIntegrated,
    #[error("degenerate interpolation axis: {0}")]
    InterpolationDegenerate(String),
}

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse GPX data: {0}")]
    Gpx(String),
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    #[error("no valid data rows found in {0}")]
    NoValidRows(String),
    #[error("no parseable files found in {}", .0.display())]
    EmptyFolder(PathBuf),
}

impl ReadError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ReadError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InterpolationMethod {
    #[default]
    Linear,
    Cubic,
}

impl fmt::Display for InterpolationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpolationMethod::Linear => f.write_str("linear"),
            InterpolationMethod::Cubic => f.write_str("cubic"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IntegrationParams {
    pub method: InterpolationMethod,
    /// Targets closer than this to a recorded fix reuse the fix instead of the curve.
    pub exact_fix_tolerance_s: f64,
}

impl Default for IntegrationParams {
    fn default() -> Self {
        Self {
            method: InterpolationMethod::Linear,
            exact_fix_tolerance_s: DEFAULT_EXACT_FIX_TOLERANCE_S,
        }
    }
}

impl IntegrationParams {
    pub fn with_method(&self, method: InterpolationMethod) -> Self {
        Self {
            method,
            ..self.clone()
        }
    }

    pub fn params_hash_sha256(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        sha256_hex(&bytes)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Gps,
    Fluorometer,
    WaterQuality,
}

impl SourceKind {
    pub fn column_prefix(&self) -> &'static str {
        match self {
            SourceKind::Gps => "gps",
            SourceKind::Fluorometer => "fluoro",
            SourceKind::WaterQuality => "aqua",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Gps => "gps",
            SourceKind::Fluorometer => "fluorometer",
            SourceKind::WaterQuality => "aquatroll",
        }
    }

    /// Fields that never join onto the timeline for this source.
    pub fn excluded_fields(&self) -> &'static [&'static str] {
        match self {
            SourceKind::Gps => &["timestamp", "datetime", "latitude", "longitude"],
            SourceKind::Fluorometer => &["timestamp", "datetime"],
            SourceKind::WaterQuality => &["timestamp", "datetime", "latitude", "longitude"],
        }
    }
}

/// A joined column: the source namespace plus the field name inside it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldKey {
    pub source: SourceKind,
    pub name: String,
}

impl FieldKey {
    pub fn new(source: SourceKind, name: impl Into<String>) -> Self {
        Self {
            source,
            name: name.into(),
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.source.column_prefix(), self.name)
    }
}

impl Serialize for FieldKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
    Null,
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Number(v) => !v.is_finite(),
            FieldValue::Text(_) => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) if v.is_finite() => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Numeric when the text parses as a finite number, null when empty.
    pub fn parse_lenient(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return FieldValue::Null;
        }
        match trimmed.parse::<f64>() {
            Ok(v) if v.is_finite() => FieldValue::Number(v),
            _ => FieldValue::Null,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(v) if v.is_finite() => write!(f, "{}", v),
            FieldValue::Number(_) | FieldValue::Null => Ok(()),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

/// One recorded GPS fix. Non-finite coordinates mark a fix without a usable position.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrackPoint {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
}

impl TrackPoint {
    pub fn new(timestamp: DateTime<Utc>, latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
        }
    }

    pub fn has_position(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
