use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bus_tracker::config::TrackerConfig;
use bus_tracker::error::TrackingError;
use bus_tracker::infra::backend::InMemoryBackend;
use bus_tracker::model::{LocationUpdate, PositionSample, QueueItem, StopArrival, StopRecord};
use bus_tracker::sampler::{Cadence, ManualProvider, Permission};
use bus_tracker::services::backend_api::RemoteTripStatus;
use bus_tracker::session::TrackingSession;
use bus_tracker::storage::{FileStore, KeyValueStore, MemoryStore};
use bus_tracker::trip::{RouteSource, TripStatus, TripTracker};
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

const TRIP: i64 = 501;
const BUS: i64 = 12;

// Mysuru, roughly 1 km between stops
const STOPS: [(i64, f64, f64); 4] = [
    (9001, 12.2958, 76.6394),
    (9002, 12.3051, 76.6394),
    (9003, 12.3144, 76.6394),
    (9004, 12.3237, 76.6394),
];

fn route() -> Vec<StopRecord> {
    STOPS
        .iter()
        .enumerate()
        .map(|(i, &(stop_id, latitude, longitude))| StopRecord {
            stop_id,
            sequence: i as i64 + 1,
            latitude,
            longitude,
            geofence_radius_meters: None,
        })
        .collect()
}

fn config() -> TrackerConfig {
    TrackerConfig {
        cadence: Cadence::EVERY_FIX,
        flush_interval: Duration::from_secs(3600),
        network_timeout: Duration::from_millis(500),
        ..TrackerConfig::default()
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_740_000_000 + secs, 0).unwrap()
}

fn at_stop(index: usize, secs: i64) -> PositionSample {
    let (_, lat, lon) = STOPS[index];
    PositionSample::new(lat, lon, at(secs)).with_speed(5.0)
}

/// A point ~500 m past `index`, outside every geofence.
fn between(index: usize, secs: i64) -> PositionSample {
    let (_, lat, lon) = STOPS[index];
    PositionSample::new(lat + 0.0045, lon, at(secs)).with_speed(10.0)
}

fn location(sample: &PositionSample) -> QueueItem {
    QueueItem::LocationUpdate(LocationUpdate {
        bus_id: BUS,
        latitude: sample.latitude,
        longitude: sample.longitude,
        speed_kmh: sample.speed_kmh(),
        observed_at: sample.captured_at,
    })
}

fn arrival(index: usize, sample: &PositionSample) -> QueueItem {
    QueueItem::StopArrival(StopArrival {
        trip_id: TRIP,
        stop_id: STOPS[index].0,
        arrived_at: sample.captured_at,
    })
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

async fn drain<F, Fut>(flush: F, queue_len: impl Fn() -> usize)
where
    F: Fn() -> Fut,
    Fut: Future,
{
    for _ in 0..10 {
        if queue_len() == 0 {
            return;
        }
        flush().await;
    }
    assert_eq!(queue_len(), 0, "queue did not drain");
}

struct Harness {
    backend: Arc<InMemoryBackend>,
    provider: Arc<ManualProvider>,
    session: Arc<TrackingSession<InMemoryBackend>>,
    tracker: TripTracker<InMemoryBackend, ManualProvider>,
}

impl Harness {
    fn new(store: Arc<dyn KeyValueStore>, backend: Arc<InMemoryBackend>) -> Self {
        Self::with_provider(store, backend, Arc::new(ManualProvider::new()))
    }

    fn with_provider(
        store: Arc<dyn KeyValueStore>,
        backend: Arc<InMemoryBackend>,
        provider: Arc<ManualProvider>,
    ) -> Self {
        Self::open(config(), store, backend, provider)
    }

    fn open(
        config: TrackerConfig,
        store: Arc<dyn KeyValueStore>,
        backend: Arc<InMemoryBackend>,
        provider: Arc<ManualProvider>,
    ) -> Self {
        let session = Arc::new(TrackingSession::open(config, store, backend.clone()).unwrap());
        let tracker = TripTracker::new(session.clone(), provider.clone());
        Self {
            backend,
            provider,
            session,
            tracker,
        }
    }

    fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(InMemoryBackend::new()))
    }

    async fn start(&self) {
        self.tracker
            .start_trip(TRIP, BUS, RouteSource::Provided(route()))
            .await
            .unwrap();
    }

    fn stop_index(&self) -> usize {
        self.tracker
            .current_state()
            .map(|s| s.current_stop_index)
            .unwrap_or(0)
    }

    fn queued(&self) -> usize {
        self.session.queue().len()
    }

    async fn drain(&self) {
        let sync = self.session.sync().clone();
        let queue = self.session.queue().clone();
        drain(|| sync.flush(), || queue.len()).await;
    }
}

#[tokio::test]
async fn offline_trip_delivers_everything_in_order_after_reconnect() {
    let h = Harness::in_memory();
    h.start().await;
    h.backend.set_online(false);

    let samples = [
        at_stop(0, 0),
        between(0, 60),
        at_stop(1, 120),
        between(1, 180),
        at_stop(2, 240),
    ];
    for sample in &samples {
        assert!(h.provider.push(sample.clone()).await);
    }

    eventually("8 queued events", || h.queued() == 8).await;
    assert_eq!(h.stop_index(), 3);

    let expected = vec![
        location(&samples[0]),
        arrival(0, &samples[0]),
        location(&samples[1]),
        location(&samples[2]),
        arrival(1, &samples[2]),
        location(&samples[3]),
        location(&samples[4]),
        arrival(2, &samples[4]),
    ];
    assert_eq!(h.session.queue().snapshot(), expected);
    assert!(h.backend.delivered().is_empty());

    h.backend.set_online(true);
    h.drain().await;

    assert_eq!(h.backend.delivered(), expected);
    assert_eq!(h.backend.duplicate_attempts(), 0);
}

#[tokio::test]
async fn pause_stops_sampling_and_resume_continues_from_same_stop() {
    let h = Harness::in_memory();
    h.start().await;

    assert!(h.provider.push(at_stop(0, 0)).await);
    eventually("first arrival", || h.stop_index() == 1).await;
    eventually("first events queued or sent", || {
        h.queued() + h.backend.delivered().len() == 2
    })
    .await;

    let paused = h.tracker.pause().await.unwrap();
    assert_eq!(paused.status, TripStatus::Paused);
    assert!(!h.provider.is_subscribed());

    // nothing is listening while paused
    assert!(!h.provider.push(at_stop(1, 60)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.stop_index(), 1);
    assert_eq!(h.queued() + h.backend.delivered().len(), 2);

    let resumed = h.tracker.resume().await.unwrap();
    assert_eq!(resumed.status, TripStatus::Active);
    assert_eq!(resumed.current_stop_index, 1);
    assert_eq!(h.provider.subscription_count(), 2);

    assert!(h.provider.push(at_stop(1, 120)).await);
    eventually("second arrival", || h.stop_index() == 2).await;

    h.drain().await;
    let arrived: Vec<i64> = h.backend.arrivals().iter().map(|a| a.stop_id).collect();
    assert_eq!(arrived, vec![9001, 9002]);
}

#[tokio::test]
async fn repeated_arrival_is_recorded_once() {
    let h = Harness::in_memory();
    let sample = at_stop(0, 0);
    let item = arrival(0, &sample);

    // the same arrival queued twice, as after a crash before the trip was persisted
    h.session.queue().enqueue(item.clone()).unwrap();
    h.session.queue().enqueue(item.clone()).unwrap();
    h.backend.lose_next_acks(1);

    for _ in 0..5 {
        h.session.sync().flush().await;
    }

    assert!(h.session.queue().is_empty());
    assert_eq!(h.backend.arrivals().len(), 1);
    assert_eq!(h.backend.duplicate_attempts(), 2);
}

#[tokio::test]
async fn trip_and_queue_survive_process_restart() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(InMemoryBackend::new());

    {
        let h = Harness::new(Arc::new(FileStore::open(dir.path()).unwrap()), backend.clone());
        h.start().await;
        h.backend.set_online(false);

        assert!(h.provider.push(at_stop(0, 0)).await);
        assert!(h.provider.push(between(0, 60)).await);
        eventually("3 queued events", || h.queued() == 3).await;

        h.tracker.shutdown().await;
    }

    let h = Harness::new(Arc::new(FileStore::open(dir.path()).unwrap()), backend);
    assert_eq!(h.queued(), 3);

    let restored = h.tracker.restore().await.unwrap().unwrap();
    assert_eq!(restored.trip_id, TRIP);
    assert_eq!(restored.status, TripStatus::Active);
    assert_eq!(restored.current_stop_index, 1);
    assert!(h.provider.is_subscribed());

    h.backend.set_online(true);
    h.drain().await;
    assert_eq!(h.backend.delivered().len(), 3);

    let done = h.tracker.stop_trip().await.unwrap();
    assert_eq!(done.status, TripStatus::Completed);
    assert!(h.session.load_active_trip().unwrap().is_none());
    assert_eq!(
        h.backend.trip_statuses(),
        vec![
            (TRIP, RemoteTripStatus::EnRoute),
            (TRIP, RemoteTripStatus::Completed)
        ]
    );
}

#[tokio::test]
async fn stopping_offline_keeps_unsent_events() {
    let h = Harness::in_memory();
    h.start().await;
    let mut states = h.tracker.watch_state();
    h.backend.set_online(false);

    assert!(h.provider.push(between(0, 0)).await);
    eventually("location queued", || h.queued() == 1).await;

    let done = h.tracker.stop_trip().await.unwrap();

    assert_eq!(done.status, TripStatus::Completed);
    assert_eq!(h.queued(), 1);
    assert!(!h.provider.is_subscribed());
    assert!(h.session.load_active_trip().unwrap().is_none());
    assert_eq!(
        states.borrow_and_update().as_ref().map(|s| s.status),
        Some(TripStatus::Completed)
    );
    assert!(matches!(
        h.tracker.pause().await,
        Err(TrackingError::NoActiveTrip)
    ));

    // the next session picks the leftovers up
    h.backend.set_online(true);
    assert_eq!(h.tracker.restore().await.unwrap(), None);
    assert_eq!(h.queued(), 0);
    assert_eq!(h.backend.delivered().len(), 1);
}

#[tokio::test]
async fn denied_permission_blocks_trip_start() {
    let h = Harness::with_provider(
        Arc::new(MemoryStore::new()),
        Arc::new(InMemoryBackend::new()),
        Arc::new(ManualProvider::denied()),
    );

    let result = h
        .tracker
        .start_trip(TRIP, BUS, RouteSource::Provided(route()))
        .await;

    assert!(matches!(result, Err(TrackingError::PermissionDenied)));
    assert!(h.session.load_active_trip().unwrap().is_none());
    assert!(h.backend.trip_statuses().is_empty());
    assert!(h.tracker.current_state().is_none());
}

#[tokio::test]
async fn missing_stop_list_blocks_trip_start() {
    let h = Harness::in_memory();

    let result = h.tracker.start_trip(TRIP, BUS, RouteSource::Backend).await;

    assert!(matches!(
        result,
        Err(TrackingError::StopListUnavailable { trip_id: TRIP, .. })
    ));
    assert!(h.session.load_active_trip().unwrap().is_none());
}

#[tokio::test]
async fn stop_list_from_backend_uses_default_radius() {
    let backend = Arc::new(InMemoryBackend::new().with_route(TRIP, route()));
    let h = Harness::new(Arc::new(MemoryStore::new()), backend);

    h.tracker
        .start_trip(TRIP, BUS, RouteSource::Backend)
        .await
        .unwrap();

    let trip = h.session.load_active_trip().unwrap().unwrap();
    assert_eq!(trip.stops.len(), 4);
    assert!(trip.stops.iter().all(|s| s.geofence_radius_meters == 50.0));

    assert!(matches!(
        h.tracker
            .start_trip(TRIP + 1, BUS, RouteSource::Provided(route()))
            .await,
        Err(TrackingError::TripAlreadyActive(TRIP))
    ));
}

#[tokio::test]
async fn malformed_samples_are_never_queued() {
    let h = Harness::in_memory();
    h.start().await;
    let mut position = h.tracker.watch_position();

    assert!(h.provider.push(PositionSample::new(f64::NAN, 76.6, at(0))).await);
    assert!(h.provider.push(PositionSample::new(95.0, 76.6, at(1))).await);
    assert!(h.provider.push(between(0, 2)).await);

    eventually("valid sample processed", || {
        h.queued() + h.backend.delivered().len() == 1
    })
    .await;
    assert_eq!(h.stop_index(), 0);
    assert_eq!(
        position.borrow_and_update().as_ref().map(|s| s.captured_at),
        Some(at(2))
    );
}

#[tokio::test]
async fn delay_reports_are_best_effort() {
    let h = Harness::in_memory();
    h.start().await;

    h.tracker.report_delay("traffic on ring road").await.unwrap();
    assert_eq!(
        h.backend.delays(),
        vec![(TRIP, "traffic on ring road".to_string())]
    );

    h.backend.set_online(false);
    assert!(matches!(
        h.tracker.report_delay("flat tyre").await,
        Err(TrackingError::Backend(_))
    ));
    assert_eq!(h.queued(), 0);
}

#[tokio::test]
async fn imprecise_fixes_are_ignored_when_accuracy_limit_set() {
    let h = Harness::open(
        TrackerConfig {
            max_sample_accuracy_m: Some(30.0),
            ..config()
        },
        Arc::new(MemoryStore::new()),
        Arc::new(InMemoryBackend::new()),
        Arc::new(ManualProvider::new()),
    );
    h.start().await;
    h.backend.set_online(false);

    // sitting on the first stop, but the fix is too coarse to trust
    assert!(h.provider.push(at_stop(0, 0).with_accuracy(120.0)).await);
    assert!(h.provider.push(at_stop(0, 10).with_accuracy(8.0)).await);

    eventually("precise fix processed", || h.queued() == 2).await;
    assert_eq!(h.stop_index(), 1);

    let queued = h.session.queue().snapshot();
    assert_eq!(queued[0], location(&at_stop(0, 10)));
    assert_eq!(queued[1], arrival(0, &at_stop(0, 10)));
}

#[tokio::test]
async fn resume_without_permission_leaves_trip_paused() {
    let h = Harness::in_memory();
    h.start().await;
    h.tracker.pause().await.unwrap();

    h.provider.set_permission(Permission::Denied);
    assert!(matches!(
        h.tracker.resume().await,
        Err(TrackingError::PermissionDenied)
    ));
    assert!(!h.provider.is_subscribed());
    assert_eq!(
        h.session.load_active_trip().unwrap().unwrap().state.status,
        TripStatus::Paused
    );

    h.provider.set_permission(Permission::Granted);
    let resumed = h.tracker.resume().await.unwrap();
    assert_eq!(resumed.status, TripStatus::Active);
    assert!(h.provider.is_subscribed());
}

#[tokio::test]
async fn failed_restore_leaves_no_half_loaded_trip() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let backend = Arc::new(InMemoryBackend::new());

    {
        let h = Harness::new(store.clone(), backend.clone());
        h.start().await;
        h.tracker.shutdown().await;
    }

    // permission was revoked while the process was down
    let h = Harness::with_provider(store, backend, Arc::new(ManualProvider::denied()));

    assert!(matches!(
        h.tracker.restore().await,
        Err(TrackingError::PermissionDenied)
    ));
    assert!(h.tracker.current_state().is_none());
    assert!(!h.provider.is_subscribed());
    assert!(matches!(
        h.tracker.restore().await,
        Err(TrackingError::PermissionDenied)
    ));
    assert!(matches!(
        h.tracker.pause().await,
        Err(TrackingError::NoActiveTrip)
    ));

    // the trip is still on disk for the next attempt
    let persisted = h.session.load_active_trip().unwrap().unwrap();
    assert_eq!(persisted.state.status, TripStatus::Active);

    h.provider.set_permission(Permission::Granted);
    let restored = h.tracker.restore().await.unwrap().unwrap();
    assert_eq!(restored.trip_id, TRIP);
    assert_eq!(restored.status, TripStatus::Active);
    assert!(h.provider.is_subscribed());
}

#[tokio::test]
async fn stopped_state_accounts_for_every_queued_arrival() {
    let h = Harness::in_memory();
    h.start().await;
    h.backend.set_online(false);

    assert!(h.provider.push(at_stop(0, 0)).await);
    eventually("first arrival", || h.stop_index() == 1).await;

    // stop right behind a fix that may still be in flight
    assert!(h.provider.push(at_stop(1, 60)).await);
    let done = h.tracker.stop_trip().await.unwrap();

    let arrivals = h
        .session
        .queue()
        .snapshot()
        .into_iter()
        .filter(|item| matches!(item, QueueItem::StopArrival(_)))
        .count();
    assert_eq!(done.current_stop_index, arrivals);
    assert_eq!(done.completed_stop_ids.len(), arrivals);
    assert_eq!(
        h.tracker.current_state().map(|s| s.current_stop_index),
        Some(arrivals)
    );
}
