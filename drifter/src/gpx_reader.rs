use std::fs;
use std::io::Cursor;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::{ReadError, TrackPoint};

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct GpxTrackInfo {
    pub name: String,
    /// Drifter the track belongs to: the track name, else the file stem.
    pub asset_id: Option<String>,
    pub point_count: usize,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct GpxSummary {
    pub creator: Option<String>,
    pub total_tracks: usize,
    pub total_points: usize,
    pub tracks: Vec<GpxTrackInfo>,
}

fn read_document(input: &[u8]) -> Result<gpx::Gpx, ReadError> {
    let mut cursor = Cursor::new(input);
    gpx::read(&mut cursor).map_err(|e| ReadError::Gpx(e.to_string()))
}

fn point_time(point: &gpx::Waypoint) -> Result<Option<DateTime<Utc>>, ReadError> {
    let Some(time) = point.time.as_ref() else {
        return Ok(None);
    };
    let iso = time.format().map_err(|e| ReadError::Gpx(e.to_string()))?;
    let utc = DateTime::parse_from_rfc3339(&iso)
        .map_err(|e| ReadError::Gpx(e.to_string()))?
        .with_timezone(&Utc);
    Ok(Some(utc))
}

/// Every timestamped point of every track and segment, sorted by time.
pub fn parse_gpx(input: &[u8]) -> Result<Vec<TrackPoint>, ReadError> {
    let doc = read_document(input)?;
    let mut out = Vec::new();
    let mut untimed = 0usize;
    for track in &doc.tracks {
        debug!(
            "Processing track: {}",
            track.name.as_deref().unwrap_or("unnamed")
        );
        for segment in &track.segments {
            for point in &segment.points {
                match point_time(point)? {
                    Some(timestamp) => {
                        let geo = point.point();
                        out.push(TrackPoint::new(timestamp, geo.y(), geo.x()));
                    }
                    None => untimed += 1,
                }
            }
        }
    }
    if untimed > 0 {
        debug!("Skipped {} GPX points without a timestamp", untimed);
    }
    out.sort_by_key(|p| p.timestamp);
    Ok(out)
}

pub fn parse_gpx_file<P: AsRef<Path>>(path: P) -> Result<Vec<TrackPoint>, ReadError> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|e| ReadError::io(path, e))?;
    let points = parse_gpx(&data)?;
    info!("Parsed {} points from {}", points.len(), path.display());
    Ok(points)
}

pub fn gpx_summary(input: &[u8]) -> Result<GpxSummary, ReadError> {
    let doc = read_document(input)?;
    let mut tracks = Vec::with_capacity(doc.tracks.len());
    for track in &doc.tracks {
        let mut point_count = 0usize;
        let mut start_time: Option<DateTime<Utc>> = None;
        let mut end_time: Option<DateTime<Utc>> = None;
        for segment in &track.segments {
            point_count += segment.points.len();
            for point in &segment.points {
                if let Some(t) = point_time(point)? {
                    start_time = Some(start_time.map_or(t, |s| s.min(t)));
                    end_time = Some(end_time.map_or(t, |e| e.max(t)));
                }
            }
        }
        tracks.push(GpxTrackInfo {
            name: track.name.clone().unwrap_or_else(|| "unnamed".to_string()),
            asset_id: track.name.clone(),
            point_count,
            start_time,
            end_time,
        });
    }
    Ok(GpxSummary {
        creator: doc.creator.clone(),
        total_tracks: tracks.len(),
        total_points: tracks.iter().map(|t| t.point_count).sum(),
        tracks,
    })
}

/// Like [`gpx_summary`], with unnamed tracks attributed to the file stem.
pub fn gpx_file_summary<P: AsRef<Path>>(path: P) -> Result<GpxSummary, ReadError> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|e| ReadError::io(path, e))?;
    let mut summary = gpx_summary(&data)?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned());
    for track in &mut summary.tracks {
        if track.asset_id.is_none() {
            track.asset_id = stem.clone();
        }
        debug!(
            "Track {} ({} points) attributed to {}",
            track.name,
            track.point_count,
            track.asset_id.as_deref().unwrap_or("unknown")
        );
    }
    Ok(summary)
}
