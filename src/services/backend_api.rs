//! Trait and types for the remote backend that records locations and arrivals.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::model::{LocationUpdate, StopArrival, StopRecord};

/// Transport or protocol failure talking to the backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached (DNS, connect, reset).
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The request did not complete within the allowed time.
    #[error("backend request timed out after {0:?}")]
    Timeout(Duration),

    /// The backend answered with a non-success status.
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to encode request: {0}")]
    Encode(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Whether retrying later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Unreachable(_) | BackendError::Timeout(_) => true,
            BackendError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            BackendError::Encode(_) | BackendError::Decode(_) => false,
        }
    }
}

/// Result of recording an arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalOutcome {
    /// Newly stored.
    Recorded,
    /// The (trip, stop) pair was already stored by an earlier attempt.
    Duplicate,
}

/// Trip status as understood by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTripStatus {
    EnRoute,
    Completed,
}

/// Abstraction over the backend that persists tracking data.
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Overwrites the bus's last known position.
    async fn record_location(&self, update: &LocationUpdate) -> Result<(), BackendError>;

    /// Stores an arrival, reporting [`ArrivalOutcome::Duplicate`] when the pair already exists.
    async fn record_arrival(&self, arrival: &StopArrival) -> Result<ArrivalOutcome, BackendError>;

    async fn update_trip_status(
        &self,
        trip_id: i64,
        status: RemoteTripStatus,
    ) -> Result<(), BackendError>;

    /// Returns the route's stops for `trip_id`, in any order.
    async fn fetch_stops(&self, trip_id: i64) -> Result<Vec<StopRecord>, BackendError>;

    /// Best-effort delay notice. Never queued or retried.
    async fn report_delay(
        &self,
        trip_id: i64,
        reason: &str,
        reported_at: DateTime<Utc>,
    ) -> Result<(), BackendError>;
}
