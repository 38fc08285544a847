use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::SecondsFormat;
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use drifter::{
    fluorometer_summary, gpx_file_summary, parse_aquatroll_file, parse_aquatroll_folder,
    parse_fluorometer_file, parse_fluorometer_folder, parse_gpx_file, DrifterIntegrator,
    IntegratedRow, IntegratedTable, IntegrationParams, InterpolationMethod, SourceData,
    SourceKind,
};
use rayon::prelude::*;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Drifter buoy telemetry integration CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge GPS, fluorometer and AquaTROLL records onto one timeline CSV
    Integrate(IntegrateArgs),
    /// Summarize GPX, fluorometer and AquaTROLL inputs without integrating them
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct IntegrateArgs {
    /// GPX track of the drifter
    #[arg(long, value_hint = ValueHint::FilePath)]
    gpx: Option<PathBuf>,

    /// Fluorometer log file or folder of log files
    #[arg(long, value_hint = ValueHint::AnyPath)]
    fluorometer: Option<PathBuf>,

    /// AquaTROLL HTML report or folder of reports
    #[arg(long, value_hint = ValueHint::AnyPath)]
    aquatroll: Option<PathBuf>,

    /// Position interpolation method (overrides --params)
    #[arg(long, value_enum)]
    method: Option<MethodOpt>,

    /// Max distance in seconds to a recorded fix that counts as exact (overrides --params)
    #[arg(long)]
    exact_fix_tolerance: Option<f64>,

    /// JSON file with integration parameters
    #[arg(long, value_hint = ValueHint::FilePath)]
    params: Option<PathBuf>,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "integrated.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Write the integration summary as JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    summary: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// GPX files, fluorometer logs, AquaTROLL reports or folders of them
    #[arg(required = true, value_hint = ValueHint::AnyPath)]
    inputs: Vec<PathBuf>,

    /// Output report path (`-` for stdout)
    #[arg(short, long, default_value = "drifter_inspect.txt", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum MethodOpt {
    Linear,
    Cubic,
}

impl From<MethodOpt> for InterpolationMethod {
    fn from(value: MethodOpt) -> Self {
        match value {
            MethodOpt::Linear => InterpolationMethod::Linear,
            MethodOpt::Cubic => InterpolationMethod::Cubic,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Integrate(args) => args.verbose,
        Command::Inspect(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Integrate(args) => handle_integrate(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

#[derive(Clone, Debug)]
enum SourceRequest {
    Gps(PathBuf),
    Fluorometer(PathBuf),
    AquaTroll(PathBuf),
}

impl SourceRequest {
    fn path(&self) -> &Path {
        match self {
            SourceRequest::Gps(p) | SourceRequest::Fluorometer(p) | SourceRequest::AquaTroll(p) => p,
        }
    }

    fn read(&self) -> Result<SourceData> {
        let path = self.path();
        let data = match self {
            SourceRequest::Gps(_) => SourceData::Gps(parse_gpx_file(path)?),
            SourceRequest::Fluorometer(_) if path.is_dir() => {
                SourceData::Fluorometer(parse_fluorometer_folder(path)?)
            }
            SourceRequest::Fluorometer(_) => SourceData::Fluorometer(parse_fluorometer_file(path)?),
            SourceRequest::AquaTroll(_) if path.is_dir() => {
                SourceData::WaterQuality(parse_aquatroll_folder(path)?)
            }
            SourceRequest::AquaTroll(_) => {
                SourceData::WaterQuality(parse_aquatroll_file(path)?.samples)
            }
        };
        Ok(data)
    }
}

fn handle_integrate(args: IntegrateArgs) -> Result<()> {
    let mut params = match &args.params {
        Some(path) => load_params(path)?,
        None => IntegrationParams::default(),
    };
    if let Some(method) = args.method {
        params.method = method.into();
    }
    if let Some(tolerance) = args.exact_fix_tolerance {
        params.exact_fix_tolerance_s = tolerance;
    }
    if !params.exact_fix_tolerance_s.is_finite() || params.exact_fix_tolerance_s < 0.0 {
        return Err(anyhow!(
            "exact fix tolerance must be a non-negative number of seconds"
        ));
    }

    let requests: Vec<SourceRequest> = [
        args.gpx.clone().map(SourceRequest::Gps),
        args.fluorometer.clone().map(SourceRequest::Fluorometer),
        args.aquatroll.clone().map(SourceRequest::AquaTroll),
    ]
    .into_iter()
    .flatten()
    .collect();
    if requests.is_empty() {
        return Err(anyhow!(
            "no input sources supplied (use --gpx, --fluorometer or --aquatroll)"
        ));
    }

    let t_parse = Instant::now();
    let sources: Vec<SourceData> = requests
        .par_iter()
        .map(|request| {
            request
                .read()
                .with_context(|| format!("failed to read {}", request.path().display()))
        })
        .collect::<Result<_>>()?;
    debug!("Parsed {} sources in {:?}", sources.len(), t_parse.elapsed());

    let mut integrator = DrifterIntegrator::new(params.clone());
    for data in sources {
        if data.is_empty() {
            warn!("{} input contained no records", data.kind().label());
        }
        integrator.load(data);
    }

    let table = integrator
        .integrate(params.method)
        .context("integration failed")?;
    if args.output.as_os_str() == "-" {
        write_table_stdout(table)?;
    } else {
        write_table_csv(table, &args.output)?;
        info!("Integrated CSV written: {}", args.output.display());
    }

    if let Some(diagnostics) = integrator.diagnostics() {
        debug!(
            "Diagnostics: {}",
            serde_json::to_string(diagnostics).unwrap_or_default()
        );
    }

    let summary = integrator.summary()?;
    info!("Total records: {}", summary.total_records);
    if let Some(range) = &summary.time_range {
        info!(
            "Time range: {} .. {} ({:.2} h)",
            range.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            range.end.to_rfc3339_opts(SecondsFormat::Secs, true),
            range.duration_hours
        );
    }
    for (source, coverage) in &summary.data_sources {
        info!(
            "{}: {} columns, {} records with data",
            source.label(),
            coverage.columns,
            coverage.records_with_data
        );
    }
    if let Some(extent) = &summary.spatial_extent {
        info!(
            "Extent: lat {:.5}..{:.5}, lon {:.5}..{:.5}, distance {:.3} km",
            extent.lat_min, extent.lat_max, extent.lon_min, extent.lon_max, extent.total_distance_km
        );
    }

    if let Some(path) = &args.summary {
        let json = serde_json::to_string_pretty(&summary)?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Summary written: {}", path.display());
    }
    Ok(())
}

fn load_params(path: &Path) -> Result<IntegrationParams> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read params {}", path.display()))?;
    let params: IntegrationParams = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid params file", path.display()))?;
    debug!("Loaded params {}: {:?}", path.display(), params);
    Ok(params)
}

fn write_table_stdout(table: &IntegratedTable) -> Result<()> {
    let stdout = io::stdout();
    let handle = stdout.lock();
    let mut writer = csv::Writer::from_writer(handle);
    write_table_rows(table, &mut writer)
}

fn write_table_csv(table: &IntegratedTable, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_table_rows(table, &mut writer)
}

fn write_table_rows<W: Write>(table: &IntegratedTable, writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record(table.column_names())?;
    for row in &table.rows {
        writer.write_record(row_record(table, row))?;
    }
    writer.flush()?;
    Ok(())
}

fn opt_cell(value: Option<f64>) -> String {
    value.map_or_else(String::new, |v| v.to_string())
}

fn row_record(table: &IntegratedTable, row: &IntegratedRow) -> Vec<String> {
    let mut record = Vec::with_capacity(table.columns.len() + 9);
    record.push(row.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true));
    record.push(opt_cell(row.latitude));
    record.push(opt_cell(row.longitude));
    record.push(row.is_interpolated.to_string());
    for key in &table.columns {
        record.push(row.value(key.source, &key.name).to_string());
    }
    record.push(row.hour.to_string());
    record.push(row.day_of_year.to_string());
    record.push(opt_cell(row.time_diff_seconds));
    record.push(opt_cell(row.distance_km));
    record.push(opt_cell(row.speed_kmh));
    record
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let mut report = String::new();
    for path in &args.inputs {
        report.push_str(&format!("FILE: {}\n", path.display()));
        match inspect_path(path) {
            Ok(section) => report.push_str(&section),
            Err(e) => {
                warn!("Could not inspect {}: {:#}", path.display(), e);
                report.push_str(&format!("  error: {:#}\n", e));
            }
        }
        report.push('\n');
    }

    if args.output.as_os_str() == "-" {
        io::stdout().lock().write_all(report.as_bytes())?;
    } else {
        fs::write(&args.output, report)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Inspection report written: {}", args.output.display());
    }
    Ok(())
}

fn guess_kind(path: &Path) -> SourceKind {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("gpx") => SourceKind::Gps,
        Some("html") | Some("htm") => SourceKind::WaterQuality,
        _ if path.is_dir() && dir_has_reports(path) => SourceKind::WaterQuality,
        _ => SourceKind::Fluorometer,
    }
}

fn dir_has_reports(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|entries| {
            entries.flatten().any(|e| {
                e.path()
                    .extension()
                    .and_then(|x| x.to_str())
                    .is_some_and(|x| x.eq_ignore_ascii_case("html") || x.eq_ignore_ascii_case("htm"))
            })
        })
        .unwrap_or(false)
}

fn fmt_time(time: Option<chrono::DateTime<chrono::Utc>>) -> String {
    time.map_or("n/a".into(), |t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn inspect_path(path: &Path) -> Result<String> {
    let mut out = String::new();
    match guess_kind(path) {
        SourceKind::Gps => {
            let summary = gpx_file_summary(path)?;
            out.push_str("  kind: gpx\n");
            out.push_str(&format!(
                "  creator: {}\n",
                summary.creator.as_deref().unwrap_or("n/a")
            ));
            out.push_str(&format!("  tracks: {}\n", summary.total_tracks));
            out.push_str(&format!("  points: {}\n", summary.total_points));
            for track in &summary.tracks {
                out.push_str(&format!(
                    "    - {} asset={} (points={}) first={} last={}\n",
                    track.name,
                    track.asset_id.as_deref().unwrap_or("n/a"),
                    track.point_count,
                    fmt_time(track.start_time),
                    fmt_time(track.end_time)
                ));
            }
        }
        SourceKind::Fluorometer => {
            let samples = if path.is_dir() {
                parse_fluorometer_folder(path)?
            } else {
                parse_fluorometer_file(path)?
            };
            let summary = fluorometer_summary(&samples);
            out.push_str("  kind: fluorometer\n");
            out.push_str(&format!("  records: {}\n", summary.total_records));
            out.push_str(&format!("  files: {}\n", summary.files_processed));
            for (serial, coverage) in &summary.serial_numbers {
                out.push_str(&format!(
                    "    - {} (records={}) first={} last={}\n",
                    serial,
                    coverage.records,
                    fmt_time(Some(coverage.start)),
                    fmt_time(Some(coverage.end))
                ));
            }
        }
        SourceKind::WaterQuality if path.is_dir() => {
            let samples = parse_aquatroll_folder(path)?;
            out.push_str("  kind: aquatroll folder\n");
            out.push_str(&format!("  records: {}\n", samples.len()));
            out.push_str(&format!(
                "  time_range: {} .. {}\n",
                fmt_time(samples.first().map(|s| s.timestamp)),
                fmt_time(samples.last().map(|s| s.timestamp))
            ));
        }
        SourceKind::WaterQuality => {
            let report = parse_aquatroll_file(path)?;
            out.push_str("  kind: aquatroll\n");
            out.push_str(&format!("  records: {}\n", report.samples.len()));
            for key in ["location_name", "device_serial_number", "log_name", "logging_interval"] {
                if let Some(value) = report.metadata.get(key) {
                    out.push_str(&format!("  {}: {}\n", key, value));
                }
            }
            out.push_str("  columns:\n");
            for (name, info) in &report.columns {
                out.push_str(&format!(
                    "    - {} [{}] sensor={}\n",
                    name,
                    info.header,
                    info.sensor_sn.as_deref().unwrap_or("n/a")
                ));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use drifter::{integrate_drifter_data, Sample, TrackPoint};

    fn table() -> IntegratedTable {
        let t0 = Utc.with_ymd_and_hms(2024, 6, 19, 12, 0, 0).unwrap();
        integrate_drifter_data(
            Some(vec![
                TrackPoint::new(t0, 41.50, -70.60),
                TrackPoint::new(t0 + chrono::Duration::seconds(600), 41.51, -70.61),
            ]),
            Some(vec![Sample::new(t0 + chrono::Duration::seconds(300))
                .with_field("sensor_ppb_rwt", 1.25)]),
            None,
            &IntegrationParams::default(),
        )
        .unwrap()
    }

    #[test]
    fn csv_has_fixed_and_source_columns() {
        let table = table();
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_table_rows(&table, &mut writer).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "timestamp,latitude,longitude,is_interpolated,fluoro_sensor_ppb_rwt,hour,day_of_year,time_diff_seconds,distance_km,speed_kmh"
        );
        let first = lines.next().unwrap();
        assert!(first.starts_with("2024-06-19T12:00:00Z,41.5,-70.6,false,,12,171,,,"));
        let second = lines.next().unwrap();
        assert!(second.contains(",true,1.25,12,171,300,"));
    }

    #[test]
    fn params_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        fs::write(&path, r#"{"method": "cubic"}"#).unwrap();
        let params = load_params(&path).unwrap();
        assert_eq!(params.method, InterpolationMethod::Cubic);
        assert_eq!(params.exact_fix_tolerance_s, drifter::DEFAULT_EXACT_FIX_TOLERANCE_S);
    }

    #[test]
    fn kind_from_extension() {
        assert_eq!(guess_kind(Path::new("track.GPX")), SourceKind::Gps);
        assert_eq!(guess_kind(Path::new("report.htm")), SourceKind::WaterQuality);
        assert_eq!(guess_kind(Path::new("FL_0001.txt")), SourceKind::Fluorometer);
    }
}
