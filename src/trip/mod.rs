//! Trip progress: the pure state machine and the tracker that drives it.

mod state;
mod tracker;

pub use state::{ActiveTrip, TransitionError, TripState, TripStatus};
pub use tracker::{RouteSource, TripTracker};
