//! Route preparation: ordering, validation and default geofence radii.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;

use crate::geo::Coordinate;
use crate::model::{StopDefinition, StopRecord};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouteError {
    #[error("route has no stops")]
    Empty,

    #[error("stop sequence {0} appears more than once")]
    DuplicateSequence(i64),

    #[error("stop {0} appears more than once")]
    DuplicateStop(i64),

    #[error("stop {stop_id} has invalid sequence {sequence} (sequences start at 1)")]
    InvalidSequence { stop_id: i64, sequence: i64 },

    #[error("stop {0} has invalid coordinates")]
    InvalidCoordinates(i64),

    #[error("stop {stop_id} has invalid geofence radius {radius}")]
    InvalidRadius { stop_id: i64, radius: f64 },
}

/// Orders `records` by sequence and resolves unset radii to `default_radius`.
pub fn prepare_route(
    records: Vec<StopRecord>,
    default_radius: f64,
) -> Result<Vec<StopDefinition>, RouteError> {
    if records.is_empty() {
        return Err(RouteError::Empty);
    }

    let mut seen = HashSet::new();
    let mut seen_stops = HashSet::new();
    let mut stops = Vec::with_capacity(records.len());

    for record in records {
        if record.sequence < 1 {
            return Err(RouteError::InvalidSequence {
                stop_id: record.stop_id,
                sequence: record.sequence,
            });
        }
        if !seen.insert(record.sequence) {
            return Err(RouteError::DuplicateSequence(record.sequence));
        }
        if !seen_stops.insert(record.stop_id) {
            return Err(RouteError::DuplicateStop(record.stop_id));
        }
        if !Coordinate::new(record.latitude, record.longitude).is_valid() {
            return Err(RouteError::InvalidCoordinates(record.stop_id));
        }

        let radius = record.geofence_radius_meters.unwrap_or(default_radius);
        if !radius.is_finite() || radius <= 0.0 {
            return Err(RouteError::InvalidRadius {
                stop_id: record.stop_id,
                radius,
            });
        }

        stops.push(StopDefinition {
            stop_id: record.stop_id,
            sequence: record.sequence,
            latitude: record.latitude,
            longitude: record.longitude,
            geofence_radius_meters: radius,
        });
    }

    stops.sort_by_key(|s| s.sequence);
    Ok(stops)
}

/// Reads stop records from a CSV file with a header row:
/// `stop_id,sequence,latitude,longitude,geofence_radius_meters` (radius may be empty).
pub fn load_stops_csv(path: impl AsRef<Path>) -> Result<Vec<StopRecord>> {
    let path = path.as_ref();
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open stop list {}", path.display()))?;

    let mut records = Vec::new();
    for result in rdr.deserialize() {
        let record: StopRecord =
            result.with_context(|| format!("bad row in stop list {}", path.display()))?;
        records.push(record);
    }
    Ok(records)
}
