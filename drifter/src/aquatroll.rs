//! Reader for the HTML reports exported by AquaTROLL water-quality loggers.
//!
//! The reports are HTML rather than XML (unclosed `<meta>` tags, valueless
//! attributes, entities like `&deg;`), so the document is walked with a
//! non-validating `quick_xml` reader and only the `isi-report` table is
//! interpreted.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{FieldValue, ReadError, Sample};

const REPORT_TABLE_ID: &str = "isi-report";
const TIMESTAMP_HEADER: &str = "Date Time";

const META_TAGS: &[(&str, &str)] = &[
    ("isi-csv-file-name", "csv_filename"),
    ("isi-report-id", "report_id"),
    ("isi-report-version", "report_version"),
    ("isi-report-type", "report_type"),
    ("isi-report-created", "report_created"),
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
];

/// Sensor attributes attached to one data column.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct ColumnInfo {
    pub header: String,
    pub device_sn: Option<String>,
    pub sensor_sn: Option<String>,
    pub sensor_type: Option<String>,
    pub parameter_type: Option<String>,
    pub unit_type: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct AquaTrollReport {
    /// Report meta tags plus the flattened location, instrument and log keys.
    pub metadata: BTreeMap<String, FieldValue>,
    pub sections: BTreeMap<String, BTreeMap<String, String>>,
    pub columns: BTreeMap<String, ColumnInfo>,
    pub samples: Vec<Sample>,
}

impl AquaTrollReport {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(FieldValue::as_str)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RowKind {
    SectionHeader,
    SectionMember,
    DataHeader,
    Data,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Capture {
    Label,
    Value,
}

#[derive(Debug, Default)]
struct Cell {
    text: String,
    attrs: BTreeMap<String, String>,
    label: Option<String>,
    value: Option<String>,
}

#[derive(Debug)]
struct Row {
    kind: RowKind,
    cells: Vec<Cell>,
}

impl Row {
    fn text(&self) -> String {
        self.cells.iter().map(|c| c.text.as_str()).collect()
    }
}

fn attributes(e: &BytesStart<'_>) -> BTreeMap<String, String> {
    e.html_attributes()
        .flatten()
        .map(|a| {
            (
                String::from_utf8_lossy(a.key.as_ref()).to_ascii_lowercase(),
                String::from_utf8_lossy(&a.value).into_owned(),
            )
        })
        .collect()
}

fn row_kind(attrs: &BTreeMap<String, String>) -> RowKind {
    let Some(class) = attrs.get("class") else {
        return RowKind::Other;
    };
    for name in class.split_whitespace() {
        match name {
            "sectionHeader" => return RowKind::SectionHeader,
            "sectionMember" => return RowKind::SectionMember,
            "dataHeader" => return RowKind::DataHeader,
            "data" => return RowKind::Data,
            _ => {}
        }
    }
    RowKind::Other
}

fn snake_key(text: &str) -> String {
    text.trim().to_lowercase().replace(' ', "_")
}

/// `Date Time` becomes `timestamp`; otherwise the text before the first `(`.
pub fn clean_column_name(header: &str) -> String {
    if header == TIMESTAMP_HEADER {
        return "timestamp".to_string();
    }
    let base = header.split('(').next().unwrap_or(header).trim();
    base.to_lowercase().replace([' ', '-'], "_")
}

/// First signed decimal number embedded in `text`, e.g. `41.7738 °` -> 41.7738.
fn leading_number(text: &str) -> Option<f64> {
    let bytes = text.as_bytes();
    let start = (0..bytes.len()).find(|&i| {
        bytes[i].is_ascii_digit()
            || (matches!(bytes[i], b'+' | b'-')
                && bytes.get(i + 1).is_some_and(u8::is_ascii_digit))
    })?;
    let mut end = start + 1;
    let mut seen_dot = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => {}
            b'.' if !seen_dot => seen_dot = true,
            _ => break,
        }
        end += 1;
    }
    text[start..end].parse().ok()
}

pub fn parse_report_datetime(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[derive(Default)]
struct TableWalker {
    found_table: bool,
    in_table: bool,
    row: Option<Row>,
    cell: Option<Cell>,
    capture: Option<Capture>,
    meta: BTreeMap<String, String>,
    section: Option<String>,
    sections: BTreeMap<String, BTreeMap<String, String>>,
    header: Option<Vec<Cell>>,
    data_rows: Vec<Vec<String>>,
}

impl TableWalker {
    fn start(&mut self, e: &BytesStart<'_>, empty: bool) {
        let name = e.name();
        let name = name.as_ref();
        if name.eq_ignore_ascii_case(b"meta") {
            let attrs = attributes(e);
            if let (Some(name), Some(content)) = (attrs.get("name"), attrs.get("content")) {
                if let Some((_, key)) = META_TAGS.iter().find(|(tag, _)| *tag == name.as_str()) {
                    if !content.is_empty() {
                        self.meta.insert(key.to_string(), content.clone());
                    }
                }
            }
        } else if name.eq_ignore_ascii_case(b"table") {
            if attributes(e).get("id").map(String::as_str) == Some(REPORT_TABLE_ID) {
                self.found_table = true;
                self.in_table = !empty;
            }
        } else if self.in_table {
            self.table_start(e, name, empty);
        }
    }

    fn table_start(&mut self, e: &BytesStart<'_>, name: &[u8], empty: bool) {
        if name.eq_ignore_ascii_case(b"tr") {
            self.finish_row();
            self.row = Some(Row {
                kind: row_kind(&attributes(e)),
                cells: Vec::new(),
            });
            if empty {
                self.finish_row();
            }
        } else if name.eq_ignore_ascii_case(b"td") || name.eq_ignore_ascii_case(b"th") {
            self.finish_cell();
            self.cell = Some(Cell {
                attrs: attributes(e),
                ..Cell::default()
            });
            if empty {
                self.finish_cell();
            }
        } else if name.eq_ignore_ascii_case(b"span") && !empty {
            let attrs = attributes(e);
            self.capture = if attrs.contains_key("isi-label") {
                Some(Capture::Label)
            } else if attrs.contains_key("isi-value") {
                Some(Capture::Value)
            } else {
                self.capture
            };
        }
    }

    fn end(&mut self, name: &[u8]) {
        if !self.in_table {
            return;
        }
        if name.eq_ignore_ascii_case(b"table") {
            self.finish_row();
            self.in_table = false;
        } else if name.eq_ignore_ascii_case(b"tr") {
            self.finish_row();
        } else if name.eq_ignore_ascii_case(b"td") || name.eq_ignore_ascii_case(b"th") {
            self.finish_cell();
        } else if name.eq_ignore_ascii_case(b"span") {
            self.capture = None;
        }
    }

    fn text(&mut self, text: &str) {
        let Some(cell) = self.cell.as_mut() else {
            return;
        };
        let text = text.trim();
        cell.text.push_str(text);
        match self.capture {
            Some(Capture::Label) => cell.label.get_or_insert_with(String::new).push_str(text),
            Some(Capture::Value) => cell.value.get_or_insert_with(String::new).push_str(text),
            None => {}
        }
    }

    fn finish_cell(&mut self) {
        self.capture = None;
        if let Some(cell) = self.cell.take() {
            if let Some(row) = self.row.as_mut() {
                row.cells.push(cell);
            }
        }
    }

    fn finish_row(&mut self) {
        self.finish_cell();
        let Some(row) = self.row.take() else {
            return;
        };
        match row.kind {
            RowKind::SectionHeader => {
                let key = snake_key(&row.text());
                self.section = Some(key);
            }
            RowKind::SectionMember => {
                let (Some(section), Some(cell)) = (self.section.as_ref(), row.cells.first()) else {
                    return;
                };
                if let (Some(label), Some(value)) = (&cell.label, &cell.value) {
                    self.sections
                        .entry(section.clone())
                        .or_default()
                        .insert(snake_key(label), value.clone());
                }
            }
            RowKind::DataHeader => {
                self.section = None;
                self.header = Some(row.cells);
            }
            RowKind::Data => {
                self.section = None;
                self.data_rows
                    .push(row.cells.into_iter().map(|c| c.text).collect());
            }
            RowKind::Other => {
                if !row.text().is_empty() {
                    self.section = None;
                }
            }
        }
    }
}

fn flatten_metadata(
    sections: &BTreeMap<String, BTreeMap<String, String>>,
    meta: BTreeMap<String, String>,
) -> BTreeMap<String, FieldValue> {
    let mut out = BTreeMap::new();
    let text = |section: &str, label: &str| {
        sections
            .get(section)
            .and_then(|s| s.get(label))
            .map(String::as_str)
    };
    if let Some(name) = text("location_properties", "location_name") {
        out.insert("location_name".to_string(), FieldValue::from(name));
    }
    for axis in ["latitude", "longitude"] {
        if let Some(v) = text("location_properties", axis).and_then(leading_number) {
            out.insert(axis.to_string(), FieldValue::Number(v));
        }
    }
    let flattened = [
        ("instrument_properties", "device_sn", "device_serial_number"),
        ("instrument_properties", "device_model", "device_model"),
        ("log_properties", "log_name", "log_name"),
        ("log_properties", "interval", "logging_interval"),
    ];
    for (section, label, key) in flattened {
        if let Some(v) = text(section, label) {
            out.insert(key.to_string(), FieldValue::from(v));
        }
    }
    for (key, value) in meta {
        out.insert(key, FieldValue::Text(value));
    }
    out
}

fn column_info(cell: &Cell) -> ColumnInfo {
    let attr = |name: &str| cell.attrs.get(name).filter(|v| !v.is_empty()).cloned();
    ColumnInfo {
        header: cell.text.clone(),
        device_sn: attr("isi-device-serial-number"),
        sensor_sn: attr("isi-sensor-serial-number"),
        sensor_type: attr("isi-sensor-type"),
        parameter_type: attr("isi-parameter-type"),
        unit_type: attr("isi-unit-type"),
    }
}

/// Parses one report. Rows whose cell count differs from the header, or
/// whose timestamp cannot be read, are dropped.
pub fn parse_aquatroll(html: &str) -> Result<AquaTrollReport, ReadError> {
    let mut reader = Reader::from_str(html);
    reader.config_mut().trim_text(true);
    reader.config_mut().check_end_names = false;
    let mut buf = Vec::new();
    let mut walker = TableWalker::default();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => walker.start(&e, false),
            Ok(Event::Empty(e)) => walker.start(&e, true),
            Ok(Event::End(e)) => walker.end(e.name().as_ref()),
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                walker.text(&text);
            }
            Err(e) => {
                warn!(
                    "Stopped reading report at byte {}: {}",
                    reader.buffer_position(),
                    e
                );
                break;
            }
            _ => {}
        }
        buf.clear();
    }
    walker.finish_row();

    if !walker.found_table {
        return Err(ReadError::InvalidFormat(format!(
            "no table with id '{REPORT_TABLE_ID}'"
        )));
    }
    let Some(header) = walker.header.take() else {
        return Err(ReadError::InvalidFormat("no data header row".to_string()));
    };

    let names: Vec<String> = header.iter().map(|c| clean_column_name(&c.text)).collect();
    let columns: BTreeMap<String, ColumnInfo> = names
        .iter()
        .cloned()
        .zip(header.iter().map(column_info))
        .collect();
    let time_idx = names.iter().position(|n| n == "timestamp");

    let mut samples = Vec::new();
    let mut skipped = 0usize;
    for cells in &walker.data_rows {
        if cells.len() != names.len() {
            skipped += 1;
            continue;
        }
        let Some(timestamp) = time_idx.and_then(|i| parse_report_datetime(&cells[i])) else {
            skipped += 1;
            continue;
        };
        let mut sample = Sample::new(timestamp);
        for (i, (name, value)) in names.iter().zip(cells).enumerate() {
            if Some(i) != time_idx {
                sample.insert(name.clone(), FieldValue::parse_lenient(value));
            }
        }
        samples.push(sample);
    }
    if skipped > 0 {
        debug!("Skipped {} report rows", skipped);
    }
    if samples.is_empty() {
        return Err(ReadError::NoValidRows("AquaTROLL report".to_string()));
    }

    Ok(AquaTrollReport {
        metadata: flatten_metadata(&walker.sections, walker.meta),
        sections: walker.sections,
        columns,
        samples,
    })
}

pub fn parse_aquatroll_file<P: AsRef<Path>>(path: P) -> Result<AquaTrollReport, ReadError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| ReadError::io(path, e))?;
    let report = parse_aquatroll(&String::from_utf8_lossy(&bytes))?;
    info!(
        "Parsed {} water-quality records from {}",
        report.samples.len(),
        path.display()
    );
    Ok(report)
}

fn is_report_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("html") || e.eq_ignore_ascii_case("htm"))
}

/// All reports in `dir`, each sample tagged with its file and deployment metadata.
pub fn parse_aquatroll_folder<P: AsRef<Path>>(dir: P) -> Result<Vec<Sample>, ReadError> {
    let dir = dir.as_ref();
    let mut paths: Vec<_> = fs::read_dir(dir)
        .map_err(|e| ReadError::io(dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_report_file(p))
        .collect();
    paths.sort();

    let mut all = Vec::new();
    let mut files = 0usize;
    for path in &paths {
        let report = match parse_aquatroll_file(path) {
            Ok(report) => report,
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        let source_file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tags = [
            ("location", report.metadata.get("location_name")),
            ("device_sn", report.metadata.get("device_serial_number")),
            ("log_name", report.metadata.get("log_name")),
        ];
        for mut sample in report.samples {
            sample.insert("source_file", source_file.as_str());
            for (key, value) in &tags {
                if let Some(value) = value {
                    sample.insert(*key, (*value).clone());
                }
            }
            all.push(sample);
        }
        files += 1;
    }
    if all.is_empty() {
        return Err(ReadError::EmptyFolder(dir.to_path_buf()));
    }
    all.sort_by_key(|s| s.timestamp);
    info!(
        "Combined {} AquaTROLL files: {} total records",
        files,
        all.len()
    );
    Ok(all)
}
