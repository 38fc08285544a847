//! Position interpolation over a sparse GPS track.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{IntegrationError, IntegrationParams, InterpolationMethod, TrackPoint};

const MIN_CUBIC_POINTS: usize = 4;
const PIVOT_EPS: f64 = 1e-12;

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct PositionFix {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub is_interpolated: bool,
}

impl PositionFix {
    fn missing(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            latitude: f64::NAN,
            longitude: f64::NAN,
            is_interpolated: true,
        }
    }

    pub fn has_position(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct InterpolationReport {
    pub requested: InterpolationMethod,
    pub applied: Option<InterpolationMethod>,
    pub valid_points: usize,
    pub invalid_points: usize,
    pub duplicate_timestamps: usize,
    pub exact_fixes: usize,
    pub extrapolated: usize,
    pub degenerate_fallback: bool,
}

/// Estimated position for every target, in target order.
pub fn interpolate_positions(
    track: &[TrackPoint],
    targets: &[DateTime<Utc>],
    params: &IntegrationParams,
) -> Vec<PositionFix> {
    interpolate_with_report(track, targets, params).0
}

pub fn interpolate_with_report(
    track: &[TrackPoint],
    targets: &[DateTime<Utc>],
    params: &IntegrationParams,
) -> (Vec<PositionFix>, InterpolationReport) {
    let mut report = InterpolationReport {
        requested: params.method,
        ..InterpolationReport::default()
    };

    let axis = match TrackAxis::build(track, &mut report) {
        Some(axis) => axis,
        None => {
            warn!("No valid GPS coordinates for interpolation");
            return (
                targets.iter().map(|&t| PositionFix::missing(t)).collect(),
                report,
            );
        }
    };

    let xs: Vec<f64> = targets.iter().map(|t| axis.seconds(t)).collect();
    let method = if params.method == InterpolationMethod::Cubic && axis.len() < MIN_CUBIC_POINTS {
        debug!(
            "Cubic interpolation needs {} points, track has {}; using linear",
            MIN_CUBIC_POINTS,
            axis.len()
        );
        InterpolationMethod::Linear
    } else {
        params.method
    };

    let curve = match (axis.evaluate(&axis.lat, &xs, method), axis.evaluate(&axis.lon, &xs, method)) {
        (Ok(lat), Ok(lon)) => {
            report.applied = Some(method);
            (lat, lon)
        }
        (Err(err), _) | (_, Err(err)) => {
            warn!("Interpolation failed, using clamped piecewise-linear fallback: {}", err);
            report.degenerate_fallback = true;
            (
                clamped_linear(&axis.times, &axis.lat, &xs),
                clamped_linear(&axis.times, &axis.lon, &xs),
            )
        }
    };
    let (lat, lon) = curve;

    let tolerance = params.exact_fix_tolerance_s.max(0.0);
    let mut out = Vec::with_capacity(targets.len());
    for (i, (&timestamp, &x)) in targets.iter().zip(xs.iter()).enumerate() {
        if !axis.within_span(x) {
            report.extrapolated += 1;
            out.push(PositionFix {
                timestamp,
                latitude: lat[i],
                longitude: lon[i],
                is_interpolated: true,
            });
            continue;
        }
        match axis.nearest_fix(x) {
            Some(idx) if is_exact_fix((axis.times[idx] - x).abs(), tolerance) => {
                report.exact_fixes += 1;
                out.push(PositionFix {
                    timestamp,
                    latitude: axis.lat[idx],
                    longitude: axis.lon[idx],
                    is_interpolated: false,
                });
            }
            _ => out.push(PositionFix {
                timestamp,
                latitude: lat[i],
                longitude: lon[i],
                is_interpolated: true,
            }),
        }
    }

    debug!(
        "Interpolated positions for {} timestamps ({} exact fixes, {} extrapolated)",
        out.len(),
        report.exact_fixes,
        report.extrapolated
    );
    (out, report)
}

/// Valid fixes on a numeric time axis: seconds relative to the first fix,
/// strictly increasing (last fix wins on equal timestamps).
struct TrackAxis {
    origin_ns: i64,
    times: Array1<f64>,
    lat: Array1<f64>,
    lon: Array1<f64>,
}

impl TrackAxis {
    fn build(track: &[TrackPoint], report: &mut InterpolationReport) -> Option<Self> {
        let mut valid: Vec<(i64, f64, f64)> = track
            .iter()
            .filter(|p| p.has_position())
            .map(|p| (epoch_nanos(&p.timestamp), p.latitude, p.longitude))
            .collect();
        report.invalid_points = track.len() - valid.len();
        if valid.is_empty() {
            return None;
        }

        // Stable sort keeps input order among equal timestamps, so the last one wins below.
        valid.sort_by_key(|(ns, _, _)| *ns);
        let mut deduped: Vec<(i64, f64, f64)> = Vec::with_capacity(valid.len());
        for point in valid {
            match deduped.last_mut() {
                Some(last) if last.0 == point.0 => {
                    *last = point;
                    report.duplicate_timestamps += 1;
                }
                _ => deduped.push(point),
            }
        }
        report.valid_points = deduped.len();

        let origin_ns = deduped[0].0;
        let times = deduped
            .iter()
            .map(|(ns, _, _)| nanos_to_seconds(ns - origin_ns))
            .collect::<Array1<f64>>();
        let lat = deduped.iter().map(|p| p.1).collect::<Array1<f64>>();
        let lon = deduped.iter().map(|p| p.2).collect::<Array1<f64>>();
        Some(Self {
            origin_ns,
            times,
            lat,
            lon,
        })
    }

    fn len(&self) -> usize {
        self.times.len()
    }

    fn seconds(&self, t: &DateTime<Utc>) -> f64 {
        nanos_to_seconds(epoch_nanos(t) - self.origin_ns)
    }

    fn within_span(&self, x: f64) -> bool {
        match (self.times.first(), self.times.last()) {
            (Some(&first), Some(&last)) => x >= first && x <= last,
            _ => false,
        }
    }

    fn nearest_fix(&self, x: f64) -> Option<usize> {
        let n = self.len();
        if n == 0 {
            return None;
        }
        let upper = upper_bound(&self.times, x);
        let candidates = [upper.checked_sub(1), (upper < n).then_some(upper)];
        candidates
            .into_iter()
            .flatten()
            .min_by(|&a, &b| {
                let da = (self.times[a] - x).abs();
                let db = (self.times[b] - x).abs();
                da.partial_cmp(&db).unwrap_or(Ordering::Equal)
            })
    }

    fn evaluate(
        &self,
        values: &Array1<f64>,
        xs: &[f64],
        method: InterpolationMethod,
    ) -> Result<Vec<f64>, IntegrationError> {
        let out = match method {
            InterpolationMethod::Linear => linear_extrapolate(&self.times, values, xs)?,
            InterpolationMethod::Cubic => {
                let spline = CubicSpline::not_a_knot(&self.times, values)?;
                xs.iter().map(|&x| spline.evaluate(x)).collect()
            }
        };
        if out.iter().any(|v| !v.is_finite()) {
            return Err(IntegrationError::InterpolationDegenerate(
                "non-finite interpolated value".into(),
            ));
        }
        Ok(out)
    }
}

/// A target sitting on a fix is exact whatever the tolerance, including zero.
fn is_exact_fix(distance_s: f64, tolerance_s: f64) -> bool {
    distance_s == 0.0 || distance_s < tolerance_s
}

fn epoch_nanos(t: &DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt()
        .unwrap_or_else(|| t.timestamp_micros().saturating_mul(1_000))
}

fn nanos_to_seconds(ns: i64) -> f64 {
    ns as f64 / 1e9
}

/// Index of the first element strictly greater than `x`.
fn upper_bound(times: &Array1<f64>, x: f64) -> usize {
    let mut lo = 0usize;
    let mut hi = times.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        if times[mid] <= x {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Segment `[i, i + 1]` used for `x`; the end segments extend past the track.
fn segment_index(times: &Array1<f64>, x: f64) -> usize {
    let n = times.len();
    upper_bound(times, x).saturating_sub(1).min(n.saturating_sub(2))
}

fn linear_extrapolate(
    times: &Array1<f64>,
    values: &Array1<f64>,
    xs: &[f64],
) -> Result<Vec<f64>, IntegrationError> {
    if times.len() < 2 {
        return Err(IntegrationError::InterpolationDegenerate(format!(
            "linear interpolation needs 2 distinct fixes, got {}",
            times.len()
        )));
    }
    let mut out = Vec::with_capacity(xs.len());
    for &x in xs {
        let i = segment_index(times, x);
        let span = times[i + 1] - times[i];
        if span <= 0.0 {
            return Err(IntegrationError::InterpolationDegenerate(
                "non-increasing time axis".into(),
            ));
        }
        let slope = (values[i + 1] - values[i]) / span;
        out.push(values[i] + slope * (x - times[i]));
    }
    Ok(out)
}

/// Piecewise-linear interpolation holding the end values outside the track.
fn clamped_linear(times: &Array1<f64>, values: &Array1<f64>, xs: &[f64]) -> Vec<f64> {
    let n = times.len();
    xs.iter()
        .map(|&x| {
            if n == 0 {
                return f64::NAN;
            }
            if x <= times[0] {
                return values[0];
            }
            if x >= times[n - 1] {
                return values[n - 1];
            }
            let i = segment_index(times, x);
            let (t0, t1) = (times[i], times[i + 1]);
            let frac = if (t1 - t0).abs() > f64::EPSILON {
                ((x - t0) / (t1 - t0)).clamp(0.0, 1.0)
            } else {
                0.0
            };
            values[i] + (values[i + 1] - values[i]) * frac
        })
        .collect()
}

/// Cubic spline with not-a-knot end conditions, stored as knot second derivatives.
struct CubicSpline {
    times: Array1<f64>,
    values: Array1<f64>,
    second: Array1<f64>,
}

impl CubicSpline {
    fn not_a_knot(times: &Array1<f64>, values: &Array1<f64>) -> Result<Self, IntegrationError> {
        let n = times.len();
        if n < MIN_CUBIC_POINTS {
            return Err(IntegrationError::InterpolationDegenerate(format!(
                "cubic spline needs {} fixes, got {}",
                MIN_CUBIC_POINTS, n
            )));
        }
        let h: Vec<f64> = (0..n - 1).map(|i| times[i + 1] - times[i]).collect();
        if h.iter().any(|&d| d <= 0.0) {
            return Err(IntegrationError::InterpolationDegenerate(
                "non-increasing time axis".into(),
            ));
        }

        // Unknowns M[1..n-1]; M[0] and M[n-1] are eliminated via the not-a-knot conditions.
        let k = n - 2;
        let mut sub = vec![0.0; k];
        let mut diag = vec![0.0; k];
        let mut sup = vec![0.0; k];
        let mut rhs = vec![0.0; k];
        for j in 0..k {
            let i = j + 1;
            sub[j] = h[i - 1];
            diag[j] = 2.0 * (h[i - 1] + h[i]);
            sup[j] = h[i];
            rhs[j] = 6.0
                * ((values[i + 1] - values[i]) / h[i] - (values[i] - values[i - 1]) / h[i - 1]);
        }
        let (h0, h1) = (h[0], h[1]);
        diag[0] = (h0 + h1) * (h0 + 2.0 * h1) / h1;
        sup[0] = (h1 * h1 - h0 * h0) / h1;
        sub[0] = 0.0;
        let (a, b) = (h[n - 3], h[n - 2]);
        diag[k - 1] = (a + b) * (2.0 * a + b) / a;
        sub[k - 1] = (a * a - b * b) / a;
        sup[k - 1] = 0.0;

        let inner = solve_tridiagonal(&sub, &diag, &sup, &rhs)?;
        let mut second = Array1::<f64>::zeros(n);
        for (j, m) in inner.iter().enumerate() {
            second[j + 1] = *m;
        }
        second[0] = ((h0 + h1) * second[1] - h0 * second[2]) / h1;
        second[n - 1] = ((a + b) * second[n - 2] - b * second[n - 3]) / a;

        Ok(Self {
            times: times.clone(),
            values: values.clone(),
            second,
        })
    }

    fn evaluate(&self, x: f64) -> f64 {
        let i = segment_index(&self.times, x);
        let (t0, t1) = (self.times[i], self.times[i + 1]);
        let h = t1 - t0;
        let (m0, m1) = (self.second[i], self.second[i + 1]);
        let (y0, y1) = (self.values[i], self.values[i + 1]);
        let left = t1 - x;
        let right = x - t0;
        m0 * left.powi(3) / (6.0 * h)
            + m1 * right.powi(3) / (6.0 * h)
            + (y0 / h - m0 * h / 6.0) * left
            + (y1 / h - m1 * h / 6.0) * right
    }
}

fn solve_tridiagonal(
    sub: &[f64],
    diag: &[f64],
    sup: &[f64],
    rhs: &[f64],
) -> Result<Vec<f64>, IntegrationError> {
    let n = diag.len();
    let singular = || IntegrationError::InterpolationDegenerate("singular spline system".into());
    if n == 0 || diag[0].abs() < PIVOT_EPS {
        return Err(singular());
    }
    let mut c = vec![0.0; n];
    let mut d = vec![0.0; n];
    c[0] = sup[0] / diag[0];
    d[0] = rhs[0] / diag[0];
    for j in 1..n {
        let denom = diag[j] - sub[j] * c[j - 1];
        if denom.abs() < PIVOT_EPS {
            return Err(singular());
        }
        c[j] = sup[j] / denom;
        d[j] = (rhs[j] - sub[j] * d[j - 1]) / denom;
    }
    let mut x = vec![0.0; n];
    x[n - 1] = d[n - 1];
    for j in (0..n - 1).rev() {
        x[j] = d[j] - c[j] * x[j + 1];
    }
    Ok(x)
}
