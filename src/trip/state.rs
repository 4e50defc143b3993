//! Trip lifecycle and stop progression, free of I/O.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geofence;
use crate::model::{PositionSample, StopArrival, StopDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripStatus {
    NotStarted,
    Active,
    Paused,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {action} a trip that is {from:?}")]
pub struct TransitionError {
    pub from: TripStatus,
    pub action: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripState {
    pub trip_id: i64,
    pub bus_id: i64,
    /// Index of the next stop to reach. Equals the stop count once the route is done.
    pub current_stop_index: usize,
    pub status: TripStatus,
    pub completed_stop_ids: Vec<i64>,
}

impl TripState {
    pub fn new(trip_id: i64, bus_id: i64) -> Self {
        Self {
            trip_id,
            bus_id,
            current_stop_index: 0,
            status: TripStatus::NotStarted,
            completed_stop_ids: Vec::new(),
        }
    }

    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(&[TripStatus::NotStarted], TripStatus::Active, "start")
    }

    pub fn pause(&mut self) -> Result<(), TransitionError> {
        self.transition(&[TripStatus::Active], TripStatus::Paused, "pause")
    }

    pub fn resume(&mut self) -> Result<(), TransitionError> {
        self.transition(&[TripStatus::Paused], TripStatus::Active, "resume")
    }

    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.transition(
            &[TripStatus::Active, TripStatus::Paused],
            TripStatus::Completed,
            "complete",
        )
    }

    fn transition(
        &mut self,
        allowed: &[TripStatus],
        to: TripStatus,
        action: &'static str,
    ) -> Result<(), TransitionError> {
        if !allowed.contains(&self.status) {
            return Err(TransitionError {
                from: self.status,
                action,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn is_tracking(&self) -> bool {
        matches!(self.status, TripStatus::Active | TripStatus::Paused)
    }

    /// The stop the bus is heading to, if any remain.
    pub fn target<'a>(&self, stops: &'a [StopDefinition]) -> Option<&'a StopDefinition> {
        stops.get(self.current_stop_index)
    }

    /// Checks `sample` against the current target stop only.
    ///
    /// On a breach the stop is marked completed, the pointer moves forward by
    /// one, and the arrival to enqueue is returned. Does nothing unless Active.
    pub fn observe(
        &mut self,
        sample: &PositionSample,
        stops: &[StopDefinition],
    ) -> Option<StopArrival> {
        if self.status != TripStatus::Active {
            return None;
        }
        let target = self.target(stops)?;
        if !geofence::evaluate(sample, target) {
            return None;
        }

        self.completed_stop_ids.push(target.stop_id);
        self.current_stop_index += 1;
        Some(StopArrival {
            trip_id: self.trip_id,
            stop_id: target.stop_id,
            arrived_at: sample.captured_at,
        })
    }
}

/// A tracked trip together with its route, as persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTrip {
    pub state: TripState,
    pub stops: Vec<StopDefinition>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn route() -> Vec<StopDefinition> {
        // stops 1 and 2 are 30 m apart, so their geofences overlap
        [(1, 12.2958, 76.6394), (2, 12.29607, 76.6394), (3, 12.3051, 76.6551)]
            .iter()
            .enumerate()
            .map(|(i, &(stop_id, latitude, longitude))| StopDefinition {
                stop_id,
                sequence: i as i64 + 1,
                latitude,
                longitude,
                geofence_radius_meters: 50.0,
            })
            .collect()
    }

    fn sample_at(stop: &StopDefinition, secs: i64) -> PositionSample {
        PositionSample::new(
            stop.latitude,
            stop.longitude,
            Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs),
        )
    }

    fn active() -> TripState {
        let mut state = TripState::new(42, 7);
        state.start().unwrap();
        state
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut state = TripState::new(1, 1);
        assert!(state.pause().is_err());
        state.start().unwrap();
        state.pause().unwrap();
        assert!(state.pause().is_err());
        state.resume().unwrap();
        state.complete().unwrap();
        assert_eq!(state.status, TripStatus::Completed);

        let err = state.resume().unwrap_err();
        assert_eq!(err.from, TripStatus::Completed);
        assert!(state.start().is_err());
    }

    #[test]
    fn test_paused_trip_can_complete() {
        let mut state = active();
        state.pause().unwrap();
        assert!(state.complete().is_ok());
    }

    #[test]
    fn test_breach_advances_and_returns_arrival() {
        let stops = route();
        let mut state = active();

        let arrival = state.observe(&sample_at(&stops[0], 5), &stops).unwrap();

        assert_eq!(arrival.stop_id, 1);
        assert_eq!(arrival.trip_id, 42);
        assert_eq!(state.current_stop_index, 1);
        assert_eq!(state.completed_stop_ids, vec![1]);
    }

    #[test]
    fn test_one_sample_advances_at_most_one_stop() {
        let stops = route();
        let mut state = active();

        // inside both stop 1 and stop 2 geofences
        let between = PositionSample::new(12.29594, 76.6394, Utc::now());
        assert!(state.observe(&between, &stops).is_some());
        assert_eq!(state.current_stop_index, 1);

        assert!(state.observe(&between, &stops).is_some());
        assert_eq!(state.current_stop_index, 2);
    }

    #[test]
    fn test_later_stop_is_not_skipped_to() {
        let stops = route();
        let mut state = active();

        assert!(state.observe(&sample_at(&stops[2], 0), &stops).is_none());
        assert_eq!(state.current_stop_index, 0);
    }

    #[test]
    fn test_paused_trip_ignores_samples() {
        let stops = route();
        let mut state = active();
        state.pause().unwrap();

        assert!(state.observe(&sample_at(&stops[0], 0), &stops).is_none());
        assert_eq!(state.current_stop_index, 0);
    }

    #[test]
    fn test_route_end_has_no_target() {
        let stops = route();
        let mut state = active();
        for (i, stop) in stops.iter().enumerate() {
            assert!(state.observe(&sample_at(stop, i as i64), &stops).is_some());
        }

        assert_eq!(state.current_stop_index, stops.len());
        assert!(state.target(&stops).is_none());
        assert!(state.observe(&sample_at(&stops[2], 10), &stops).is_none());
        assert_eq!(state.current_stop_index, stops.len());
    }

    proptest! {
        #[test]
        fn prop_stop_index_is_monotonic(
            picks in prop::collection::vec((0usize..4, -0.002f64..0.002), 0..60)
        ) {
            let stops = route();
            let mut state = active();
            let mut emitted = 0usize;

            for (i, (pick, jitter)) in picks.into_iter().enumerate() {
                let sample = match stops.get(pick) {
                    Some(stop) => PositionSample::new(
                        stop.latitude + jitter / 10.0,
                        stop.longitude,
                        Utc::now(),
                    ),
                    None => PositionSample::new(12.0 + jitter, 76.0, Utc::now()),
                };

                let before = state.current_stop_index;
                let arrival = state.observe(&sample, &stops);
                let after = state.current_stop_index;

                prop_assert!(after >= before, "sample {} moved pointer backwards", i);
                prop_assert!(after - before <= 1);
                prop_assert!(after <= stops.len());
                prop_assert_eq!(arrival.is_some(), after == before + 1);
                emitted += usize::from(arrival.is_some());
            }

            prop_assert_eq!(emitted, state.current_stop_index);
            prop_assert_eq!(state.completed_stop_ids.len(), state.current_stop_index);
        }
    }
}
