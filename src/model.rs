//! Core data types shared by the sampler, the trip state machine and the outbound queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::Coordinate;

/// One position fix from the location service. Never mutated after capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub latitude: f64,
    pub longitude: f64,
    pub speed_meters_per_second: Option<f64>,
    pub accuracy_meters: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

/// A sample whose coordinates cannot be used. Such samples are dropped, never enqueued.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("malformed sample at ({latitude}, {longitude})")]
pub struct MalformedSample {
    pub latitude: f64,
    pub longitude: f64,
}

impl PositionSample {
    pub fn new(latitude: f64, longitude: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            speed_meters_per_second: None,
            accuracy_meters: None,
            captured_at,
        }
    }

    pub fn with_speed(mut self, meters_per_second: f64) -> Self {
        self.speed_meters_per_second = Some(meters_per_second);
        self
    }

    pub fn with_accuracy(mut self, meters: f64) -> Self {
        self.accuracy_meters = Some(meters);
        self
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    pub fn validate(&self) -> Result<(), MalformedSample> {
        if self.coordinate().is_valid() {
            Ok(())
        } else {
            Err(MalformedSample {
                latitude: self.latitude,
                longitude: self.longitude,
            })
        }
    }

    /// Reported speed converted to km/h. Negative or non-finite readings count as absent.
    pub fn speed_kmh(&self) -> Option<f64> {
        self.speed_meters_per_second
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(|s| s * 3.6)
    }
}

/// A stop as delivered by the backend or a route file; the radius may be unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopRecord {
    pub stop_id: i64,
    pub sequence: i64,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub geofence_radius_meters: Option<f64>,
}

/// A stop on the active route with its radius resolved. Immutable for the trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDefinition {
    pub stop_id: i64,
    pub sequence: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub geofence_radius_meters: f64,
}

impl StopDefinition {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// Position report bound for the backend's "last known position" record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub bus_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

/// Arrival at a stop. The backend keeps (trip_id, stop_id) unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopArrival {
    pub trip_id: i64,
    pub stop_id: i64,
    pub arrived_at: DateTime<Utc>,
}

/// An outbound event waiting in the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueItem {
    LocationUpdate(LocationUpdate),
    StopArrival(StopArrival),
}

impl QueueItem {
    pub fn kind(&self) -> &'static str {
        match self {
            QueueItem::LocationUpdate(_) => "location_update",
            QueueItem::StopArrival(_) => "stop_arrival",
        }
    }
}

impl From<LocationUpdate> for QueueItem {
    fn from(update: LocationUpdate) -> Self {
        QueueItem::LocationUpdate(update)
    }
}

impl From<StopArrival> for QueueItem {
    fn from(arrival: StopArrival) -> Self {
        QueueItem::StopArrival(arrival)
    }
}
