use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{FieldValue, ReadError, Sample};

const HEADER_PREFIX: &str = "Time (sec)";
const DATA_COLUMNS: usize = 5;

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SerialCoverage {
    pub records: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct FluorometerSummary {
    pub total_records: usize,
    pub serial_numbers: BTreeMap<String, SerialCoverage>,
    pub files_processed: usize,
}

struct DataRow {
    time_sec: i64,
    battery_volts: f64,
    temperature_c: f64,
    sensor_ppb_rwt: f64,
    gain: i64,
}

fn parse_row(line: &str) -> Result<DataRow, String> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() != DATA_COLUMNS {
        return Err(format!(
            "expected {} columns, got {}",
            DATA_COLUMNS,
            parts.len()
        ));
    }
    let float = |s: &str| s.parse::<f64>().map_err(|e| format!("{s:?}: {e}"));
    let int = |s: &str| s.parse::<i64>().map_err(|e| format!("{s:?}: {e}"));
    Ok(DataRow {
        time_sec: int(parts[0])?,
        battery_volts: float(parts[1])?,
        temperature_c: float(parts[2])?,
        sensor_ppb_rwt: float(parts[3])?,
        gain: int(parts[4])?,
    })
}

/// Parses the text of one logger file. `filename` is recorded on every sample.
pub fn parse_fluorometer(text: &str, filename: &str) -> Result<Vec<Sample>, ReadError> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() < 4 {
        return Err(ReadError::InvalidFormat(format!(
            "{filename}: expected at least 4 lines, found {}",
            lines.len()
        )));
    }
    let serial_number = lines[0].trim();
    let os_rev = lines[1].trim();
    if !lines[2].trim().starts_with(HEADER_PREFIX) {
        return Err(ReadError::InvalidFormat(format!(
            "{filename}: expected '{HEADER_PREFIX}' header on line 3"
        )));
    }

    let mut samples = Vec::new();
    for (idx, raw) in lines.iter().enumerate().skip(3) {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let row = match parse_row(line) {
            Ok(row) => row,
            Err(e) => {
                warn!("Line {} in {}: {}", idx + 1, filename, e);
                continue;
            }
        };
        let Some(timestamp) = Utc.timestamp_opt(row.time_sec, 0).single() else {
            warn!("Line {} in {}: time {} out of range", idx + 1, filename, row.time_sec);
            continue;
        };
        samples.push(
            Sample::new(timestamp)
                .with_field("serial_number", serial_number)
                .with_field("os_rev", os_rev)
                .with_field("time_sec", row.time_sec)
                .with_field("battery_volts", row.battery_volts)
                .with_field("temperature_c", row.temperature_c)
                .with_field("sensor_ppb_rwt", row.sensor_ppb_rwt)
                .with_field("gain", row.gain)
                .with_field("filename", filename),
        );
    }

    if samples.is_empty() {
        return Err(ReadError::NoValidRows(filename.to_string()));
    }
    Ok(samples)
}

fn decode(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => err.into_bytes().into_iter().map(char::from).collect(),
    }
}

pub fn parse_fluorometer_file<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>, ReadError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| ReadError::io(path, e))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    parse_fluorometer(&decode(bytes), &filename)
}

/// Every parseable file in `dir`, concatenated and ordered by time.
pub fn parse_fluorometer_folder<P: AsRef<Path>>(dir: P) -> Result<Vec<Sample>, ReadError> {
    let dir = dir.as_ref();
    let mut paths: Vec<_> = fs::read_dir(dir)
        .map_err(|e| ReadError::io(dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut all = Vec::new();
    let mut files = 0usize;
    for path in &paths {
        match parse_fluorometer_file(path) {
            Ok(samples) => {
                debug!("Processed {}: {} records", path.display(), samples.len());
                files += 1;
                all.extend(samples);
            }
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }
    if all.is_empty() {
        return Err(ReadError::EmptyFolder(dir.to_path_buf()));
    }
    all.sort_by_key(|s| s.timestamp);
    info!(
        "Parsed {} fluorometer files with {} total records",
        files,
        all.len()
    );
    Ok(all)
}

pub fn fluorometer_summary(samples: &[Sample]) -> FluorometerSummary {
    let mut serial_numbers: BTreeMap<String, SerialCoverage> = BTreeMap::new();
    let mut files = BTreeSet::new();
    for sample in samples {
        let serial = sample
            .get("serial_number")
            .and_then(FieldValue::as_str)
            .unwrap_or("unknown")
            .to_string();
        serial_numbers
            .entry(serial)
            .and_modify(|c| {
                c.records += 1;
                c.start = c.start.min(sample.timestamp);
                c.end = c.end.max(sample.timestamp);
            })
            .or_insert(SerialCoverage {
                records: 1,
                start: sample.timestamp,
                end: sample.timestamp,
            });
        if let Some(name) = sample.get("filename").and_then(FieldValue::as_str) {
            files.insert(name);
        }
    }
    FluorometerSummary {
        total_records: samples.len(),
        serial_numbers,
        files_processed: files.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "SN 2300154\n\
                       OS Rev 1.07\n\
                       Time (sec), Battery (V), Temp (C), Sensor (ppb RWT), Gain\n\
                       1718784000, 3.61, 18.25, 1.204, 10\n\
                       1718784060, 3.61, 18.27, not-a-number, 10\n\
                       1718784120, 3.60, 18.30\n\
                       \n\
                       1718784180, 3.60, 18.31, 1.250, 100\n";

    #[test]
    fn parses_rows_and_skips_bad_lines() {
        let samples = parse_fluorometer(LOG, "FL_001.txt").unwrap();
        assert_eq!(samples.len(), 2);
        let first = &samples[0];
        assert_eq!(first.timestamp, Utc.timestamp_opt(1_718_784_000, 0).unwrap());
        assert_eq!(first.get("serial_number"), Some(&FieldValue::from("SN 2300154")));
        assert_eq!(first.get("os_rev"), Some(&FieldValue::from("OS Rev 1.07")));
        assert_eq!(first.get("temperature_c"), Some(&FieldValue::Number(18.25)));
        assert_eq!(first.get("gain"), Some(&FieldValue::Number(10.0)));
        assert_eq!(first.get("filename"), Some(&FieldValue::from("FL_001.txt")));
        assert_eq!(samples[1].get("gain"), Some(&FieldValue::Number(100.0)));
    }

    #[test]
    fn rejects_wrong_header_and_short_files() {
        let err = parse_fluorometer("a\nb\nDepth,Temp\n1,2\n", "x").unwrap_err();
        assert!(matches!(err, ReadError::InvalidFormat(_)));
        let err = parse_fluorometer("a\nb\nTime (sec)\n", "x").unwrap_err();
        assert!(matches!(err, ReadError::InvalidFormat(_)));
    }

    #[test]
    fn header_only_has_no_valid_rows() {
        let text = "SN\nOS\nTime (sec), a, b, c, d\n\n";
        assert!(matches!(
            parse_fluorometer(text, "empty.txt"),
            Err(ReadError::NoValidRows(_))
        ));
    }

    #[test]
    fn latin1_files_are_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latin.txt");
        let mut bytes = b"SN 9\nOS \xb0C\n".to_vec();
        bytes.extend_from_slice(b"Time (sec), V, T, S, G\n1718784000, 3.5, 10.0, 0.5, 1\n");
        fs::write(&path, bytes).unwrap();
        let samples = parse_fluorometer_file(&path).unwrap();
        assert_eq!(samples[0].get("os_rev"), Some(&FieldValue::from("OS \u{b0}C")));
    }

    #[test]
    fn folder_merges_sorted_and_skips_junk() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("b.txt"),
            "SN B\nOS 1\nTime (sec), V, T, S, G\n1718784100, 3.5, 10.0, 0.5, 1\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("a.dat"),
            "SN A\nOS 1\nTime (sec), V, T, S, G\n1718784000, 3.5, 10.0, 0.5, 1\n1718784200, 3.5, 10.0, 0.6, 1\n",
        )
        .unwrap();
        fs::write(dir.path().join("notes.md"), "# deployment notes\n").unwrap();

        let samples = parse_fluorometer_folder(dir.path()).unwrap();
        let times: Vec<i64> = samples.iter().map(|s| s.timestamp.timestamp()).collect();
        assert_eq!(times, vec![1_718_784_000, 1_718_784_100, 1_718_784_200]);

        let summary = fluorometer_summary(&samples);
        assert_eq!(summary.total_records, 3);
        assert_eq!(summary.files_processed, 2);
        assert_eq!(summary.serial_numbers["SN A"].records, 2);
        assert_eq!(
            summary.serial_numbers["SN A"].end,
            Utc.timestamp_opt(1_718_784_200, 0).unwrap()
        );
    }

    #[test]
    fn folder_without_logs_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("readme.txt"), "nothing here").unwrap();
        assert!(matches!(
            parse_fluorometer_folder(dir.path()),
            Err(ReadError::EmptyFolder(_))
        ));
    }
}
