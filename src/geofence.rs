//! Circular geofence check against a single target stop.

use crate::geo::distance;
use crate::model::{PositionSample, StopDefinition};

/// Returns `true` if `sample` lies strictly inside the geofence of `target`.
///
/// Only the current target is ever checked, so one sample can advance a trip
/// by at most one stop even where neighbouring geofences overlap.
pub fn evaluate(sample: &PositionSample, target: &StopDefinition) -> bool {
    if sample.validate().is_err() {
        return false;
    }
    distance(sample.coordinate(), target.coordinate()) < target.geofence_radius_meters
}
