use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use super::state::{ActiveTrip, TripState, TripStatus};
use crate::error::TrackingError;
use crate::model::{LocationUpdate, PositionSample, StopRecord};
use crate::sampler::{LocationProvider, LocationSampler, SampleSink, SamplerHandle};
use crate::services::backend_api::{BackendApi, BackendError, RemoteTripStatus};
use crate::session::TrackingSession;
use crate::stops::prepare_route;
use crate::sync::{FlushReport, SyncLoop};

/// Where the stop list for a new trip comes from.
#[derive(Debug, Clone)]
pub enum RouteSource {
    /// Ask the backend for the trip's stops.
    Backend,
    /// Use stops supplied by the caller.
    Provided(Vec<StopRecord>),
}

async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| BackendError::Timeout(limit))?
}

/// State touched by the sampling task.
struct TrackerCore<B: ?Sized> {
    session: Arc<TrackingSession<B>>,
    trip: Mutex<Option<ActiveTrip>>,
    state_tx: watch::Sender<Option<TripState>>,
    position_tx: watch::Sender<Option<PositionSample>>,
}

impl<B: BackendApi + ?Sized + 'static> TrackerCore<B> {
    fn publish(&self, state: &TripState) {
        self.state_tx.send_replace(Some(state.clone()));
    }

    fn persist(&self, trip: &ActiveTrip) {
        if let Err(e) = self.session.save_active_trip(trip) {
            error!(trip_id = trip.state.trip_id, error = %e, "Failed to persist trip state");
        }
    }
}

#[async_trait]
impl<B: BackendApi + ?Sized + 'static> SampleSink for TrackerCore<B> {
    async fn on_sample(&self, sample: PositionSample) {
        if let Err(e) = sample.validate() {
            warn!(error = %e, "Discarding malformed sample");
            return;
        }
        if let (Some(limit), Some(accuracy)) = (
            self.session.config().max_sample_accuracy_m,
            sample.accuracy_meters,
        ) {
            if accuracy > limit {
                debug!(accuracy, limit, "Discarding imprecise sample");
                return;
            }
        }

        let mut guard = self.trip.lock().await;
        let Some(trip) = guard.as_mut() else {
            return;
        };
        if trip.state.status != TripStatus::Active {
            debug!(status = ?trip.state.status, "Ignoring sample while trip is not active");
            return;
        }

        self.position_tx.send_replace(Some(sample.clone()));
        let queue = self.session.queue();

        let update = LocationUpdate {
            bus_id: trip.state.bus_id,
            latitude: sample.latitude,
            longitude: sample.longitude,
            speed_kmh: sample.speed_kmh(),
            observed_at: sample.captured_at,
        };
        if let Err(e) = queue.enqueue(update.into()) {
            error!(error = %e, "Failed to queue location update");
        }

        let mut next = trip.state.clone();
        if let Some(arrival) = next.observe(&sample, &trip.stops) {
            // queue first: a crash before persisting only repeats the arrival
            match queue.enqueue(arrival.clone().into()) {
                Ok(()) => {
                    info!(
                        trip_id = arrival.trip_id,
                        stop_id = arrival.stop_id,
                        next_index = next.current_stop_index,
                        "Arrived at stop"
                    );
                    trip.state = next;
                    self.persist(trip);
                    self.publish(&trip.state);
                    if trip.state.target(&trip.stops).is_none() {
                        info!(trip_id = trip.state.trip_id, "Final stop reached");
                    }
                }
                Err(e) => {
                    error!(stop_id = arrival.stop_id, error = %e, "Failed to queue arrival, will retry on next sample");
                }
            }
        }
        drop(guard);

        self.session.sync().trigger();
    }
}

#[derive(Default)]
struct Running {
    sampler: Option<SamplerHandle>,
    sync_loop: Option<SyncLoop>,
}

/// Owns the trip lifecycle: starts and stops sampling and syncing, and turns
/// samples into queued location updates and arrivals.
pub struct TripTracker<B: ?Sized, P: ?Sized> {
    core: Arc<TrackerCore<B>>,
    sampler: LocationSampler<P>,
    running: Mutex<Running>,
}

impl<B, P> TripTracker<B, P>
where
    B: BackendApi + ?Sized + 'static,
    P: LocationProvider + ?Sized + 'static,
{
    pub fn new(session: Arc<TrackingSession<B>>, provider: Arc<P>) -> Self {
        let (state_tx, _) = watch::channel(None);
        let (position_tx, _) = watch::channel(None);
        Self {
            core: Arc::new(TrackerCore {
                session,
                trip: Mutex::new(None),
                state_tx,
                position_tx,
            }),
            sampler: LocationSampler::new(provider),
            running: Mutex::new(Running::default()),
        }
    }

    pub fn session(&self) -> &Arc<TrackingSession<B>> {
        &self.core.session
    }

    /// Latest trip state, for display. Keeps the final state after a trip stops.
    pub fn watch_state(&self) -> watch::Receiver<Option<TripState>> {
        self.core.state_tx.subscribe()
    }

    /// Latest accepted position sample, for display.
    pub fn watch_position(&self) -> watch::Receiver<Option<PositionSample>> {
        self.core.position_tx.subscribe()
    }

    pub fn current_state(&self) -> Option<TripState> {
        self.core.state_tx.borrow().clone()
    }

    /// Starts tracking `trip_id`. Every failure here blocks the trip from starting.
    #[tracing::instrument(skip(self, route))]
    pub async fn start_trip(
        &self,
        trip_id: i64,
        bus_id: i64,
        route: RouteSource,
    ) -> Result<TripState, TrackingError> {
        let mut running = self.running.lock().await;
        if let Some(current) = self.core.trip.lock().await.as_ref() {
            return Err(TrackingError::TripAlreadyActive(current.state.trip_id));
        }

        self.sampler.ensure_permission().await?;

        let session = &self.core.session;
        let config = session.config();
        let timeout = config.network_timeout;

        let records = match route {
            RouteSource::Provided(records) => records,
            RouteSource::Backend => bounded(timeout, session.backend().fetch_stops(trip_id))
                .await
                .map_err(|source| TrackingError::StopListUnavailable { trip_id, source })?,
        };
        let stops = prepare_route(records, config.default_geofence_radius_m)?;

        bounded(
            timeout,
            session
                .backend()
                .update_trip_status(trip_id, RemoteTripStatus::EnRoute),
        )
        .await?;

        let mut state = TripState::new(trip_id, bus_id);
        state.start()?;
        let trip = ActiveTrip { state, stops };
        session.save_active_trip(&trip)?;
        let stop_count = trip.stops.len();
        let state = trip.state.clone();
        *self.core.trip.lock().await = Some(trip);

        let sink: Arc<dyn SampleSink> = self.core.clone();
        match self.sampler.start(config.cadence, sink).await {
            Ok(handle) => running.sampler = Some(handle),
            Err(e) => {
                *self.core.trip.lock().await = None;
                if let Err(clear) = session.clear_active_trip() {
                    error!(error = %clear, "Failed to clear trip after sampler start failure");
                }
                return Err(e.into());
            }
        }
        self.ensure_sync_loop(&mut running);

        self.core.publish(&state);
        info!(trip_id, bus_id, stops = stop_count, "Trip started");
        Ok(state)
    }

    /// Picks up a trip persisted by an earlier run of the process.
    ///
    /// With no trip to restore, leftover queued events get one flush attempt.
    pub async fn restore(&self) -> Result<Option<TripState>, TrackingError> {
        let mut running = self.running.lock().await;
        if let Some(current) = self.core.trip.lock().await.as_ref() {
            return Ok(Some(current.state.clone()));
        }

        let session = &self.core.session;
        let Some(trip) = session.load_active_trip()? else {
            if !session.queue().is_empty() {
                let report = self.final_flush().await;
                info!(%report, "Flushed events left by a previous run");
            }
            return Ok(None);
        };

        if !trip.state.is_tracking() {
            warn!(status = ?trip.state.status, "Discarding stale persisted trip");
            session.clear_active_trip()?;
            return Ok(None);
        }

        let state = trip.state.clone();
        *self.core.trip.lock().await = Some(trip);

        if state.status == TripStatus::Active {
            let sink: Arc<dyn SampleSink> = self.core.clone();
            match self.sampler.start(session.config().cadence, sink).await {
                Ok(handle) => running.sampler = Some(handle),
                Err(e) => {
                    // stays persisted so a later restore can retry
                    *self.core.trip.lock().await = None;
                    warn!(trip_id = state.trip_id, error = %e, "Could not resume sampling for persisted trip");
                    return Err(e.into());
                }
            }
        }
        self.ensure_sync_loop(&mut running);

        self.core.publish(&state);
        info!(
            trip_id = state.trip_id,
            status = ?state.status,
            stop_index = state.current_stop_index,
            "Trip restored"
        );
        Ok(Some(state))
    }

    /// Suspends sampling and geofence checks. Queued events keep syncing.
    pub async fn pause(&self) -> Result<TripState, TrackingError> {
        let mut running = self.running.lock().await;
        let state = {
            let mut guard = self.core.trip.lock().await;
            let trip = guard.as_mut().ok_or(TrackingError::NoActiveTrip)?;
            trip.state.pause()?;
            self.core.persist(trip);
            trip.state.clone()
        };

        if let Some(handle) = running.sampler.take() {
            self.sampler.stop(handle).await;
        }

        self.core.publish(&state);
        info!(trip_id = state.trip_id, "Trip paused");
        Ok(state)
    }

    pub async fn resume(&self) -> Result<TripState, TrackingError> {
        let mut running = self.running.lock().await;
        let state = {
            let mut guard = self.core.trip.lock().await;
            let trip = guard.as_mut().ok_or(TrackingError::NoActiveTrip)?;
            trip.state.resume()?;
            trip.state.clone()
        };

        let sink: Arc<dyn SampleSink> = self.core.clone();
        match self
            .sampler
            .start(self.core.session.config().cadence, sink)
            .await
        {
            Ok(handle) => running.sampler = Some(handle),
            Err(e) => {
                if let Some(trip) = self.core.trip.lock().await.as_mut() {
                    trip.state.status = TripStatus::Paused;
                }
                return Err(e.into());
            }
        }

        if let Some(trip) = self.core.trip.lock().await.as_ref() {
            self.core.persist(trip);
        }
        self.core.publish(&state);
        info!(
            trip_id = state.trip_id,
            stop_index = state.current_stop_index,
            "Trip resumed"
        );
        Ok(state)
    }

    /// Ends the trip: stops sampling, makes a bounded final sync attempt and
    /// clears trip state. Unsent events stay queued for the next session.
    #[tracing::instrument(skip(self))]
    pub async fn stop_trip(&self) -> Result<TripState, TrackingError> {
        let mut running = self.running.lock().await;
        if self.core.trip.lock().await.is_none() {
            return Err(TrackingError::NoActiveTrip);
        }

        // no sample can advance the trip once sampling has stopped
        if let Some(handle) = running.sampler.take() {
            self.sampler.stop(handle).await;
        }

        let mut state = {
            let guard = self.core.trip.lock().await;
            guard
                .as_ref()
                .ok_or(TrackingError::NoActiveTrip)?
                .state
                .clone()
        };
        state.complete()?;

        if let Some(sync_loop) = running.sync_loop.take() {
            sync_loop.shutdown().await;
        }

        let report = self.final_flush().await;
        info!(%report, "Final sync before trip end");

        let session = &self.core.session;
        if let Err(e) = bounded(
            session.config().network_timeout,
            session
                .backend()
                .update_trip_status(state.trip_id, RemoteTripStatus::Completed),
        )
        .await
        {
            warn!(trip_id = state.trip_id, error = %e, "Could not mark trip completed remotely");
        }

        *self.core.trip.lock().await = None;
        session.clear_active_trip()?;

        self.core.publish(&state);
        info!(
            trip_id = state.trip_id,
            stops_reached = state.current_stop_index,
            pending = session.queue().len(),
            "Trip stopped"
        );
        Ok(state)
    }

    /// Sends a one-off delay notice. Not queued and not retried.
    pub async fn report_delay(&self, reason: &str) -> Result<(), TrackingError> {
        let trip_id = self
            .core
            .trip
            .lock()
            .await
            .as_ref()
            .map(|t| t.state.trip_id)
            .ok_or(TrackingError::NoActiveTrip)?;

        let session = &self.core.session;
        bounded(
            session.config().network_timeout,
            session.backend().report_delay(trip_id, reason, Utc::now()),
        )
        .await
        .map_err(|e| {
            warn!(trip_id, error = %e, "Delay report failed");
            TrackingError::from(e)
        })
    }

    /// Resolves once the current location subscription has ended on its own
    /// (or immediately when nothing is sampling).
    pub async fn sampling_ended(&self) {
        let ended = {
            let running = self.running.lock().await;
            running.sampler.as_ref().map(SamplerHandle::ended)
        };
        if let Some(mut ended) = ended {
            let _ = ended.wait_for(|done| *done).await;
        }
    }

    /// Stops background work without touching the trip, e.g. on process exit.
    pub async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        if let Some(handle) = running.sampler.take() {
            self.sampler.stop(handle).await;
        }
        if let Some(sync_loop) = running.sync_loop.take() {
            sync_loop.shutdown().await;
        }
        debug!("Tracker shut down");
    }

    fn ensure_sync_loop(&self, running: &mut Running) {
        if running.sync_loop.is_none() {
            let session = &self.core.session;
            running.sync_loop = Some(session.sync().spawn(session.config().flush_interval));
        }
    }

    async fn final_flush(&self) -> FlushReport {
        let sync = self.core.session.sync();
        let limit = sync.request_timeout();
        match tokio::time::timeout(limit, sync.flush()).await {
            Ok(report) => report,
            Err(_) => {
                warn!(timeout_secs = limit.as_secs_f64(), "Final sync did not finish in time");
                FlushReport {
                    remaining: sync.queue().len(),
                    interrupted: Some(format!("final sync exceeded {limit:?}")),
                    ..Default::default()
                }
            }
        }
    }
}
