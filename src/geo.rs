//! Great-circle distance between WGS84 coordinates.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Mean Earth radius used by the haversine formula, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Returns `true` if both components are finite and inside the WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Haversine distance between `a` and `b`, in meters.
///
/// Non-finite inputs yield `0.0`. Callers that cannot vouch for their inputs
/// must treat a zero result as indeterminate rather than co-located.
pub fn distance(a: Coordinate, b: Coordinate) -> f64 {
    if !(a.latitude.is_finite()
        && a.longitude.is_finite()
        && b.latitude.is_finite()
        && b.longitude.is_finite())
    {
        return 0.0;
    }

    let d2r = PI / 180.0;
    let (phi1, phi2) = (a.latitude * d2r, b.latitude * d2r);
    let dphi = (b.latitude - a.latitude) * d2r;
    let dlambda = (b.longitude - a.longitude) * d2r;

    let h = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}
