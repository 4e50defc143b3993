use thiserror::Error;

use crate::sampler::SamplerError;
use crate::services::backend_api::BackendError;
use crate::stops::RouteError;
use crate::storage::StorageError;
use crate::trip::TransitionError;

/// Failures surfaced by trip lifecycle operations.
///
/// Anything returned from starting a trip blocks tracking and is meant to be
/// shown to the driver. Sync failures never appear here.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location service unavailable: {0}")]
    LocationUnavailable(String),

    #[error("stop list for trip {trip_id} could not be loaded: {source}")]
    StopListUnavailable {
        trip_id: i64,
        #[source]
        source: BackendError,
    },

    #[error("invalid route: {0}")]
    InvalidRoute(#[from] RouteError),

    #[error("trip {0} is already being tracked")]
    TripAlreadyActive(i64),

    #[error("no trip is being tracked")]
    NoActiveTrip,

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("backend call failed: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<SamplerError> for TrackingError {
    fn from(e: SamplerError) -> Self {
        match e {
            SamplerError::PermissionDenied => TrackingError::PermissionDenied,
            SamplerError::Unavailable(reason) => TrackingError::LocationUnavailable(reason),
        }
    }
}
