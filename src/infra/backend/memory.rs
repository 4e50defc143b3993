//! In-process backend that honours the same contract as the HTTP one.
//!
//! Used for dry runs of the CLI and as the remote side in tests: it keeps
//! (trip, stop) unique, can be taken offline, and can lose acknowledgements.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::model::{LocationUpdate, QueueItem, StopArrival, StopRecord};
use crate::services::backend_api::{ArrivalOutcome, BackendApi, BackendError, RemoteTripStatus};

#[derive(Default)]
struct Records {
    delivered: Vec<QueueItem>,
    arrival_keys: HashSet<(i64, i64)>,
    duplicate_attempts: usize,
    trip_statuses: Vec<(i64, RemoteTripStatus)>,
    delays: Vec<(i64, String)>,
}

#[derive(Default)]
pub struct InMemoryBackend {
    offline: AtomicBool,
    latency_ms: AtomicU64,
    lost_acks: AtomicUsize,
    routes: Mutex<HashMap<i64, Vec<StopRecord>>>,
    records: Mutex<Records>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, trip_id: i64, stops: Vec<StopRecord>) -> Self {
        if let Ok(routes) = self.routes.get_mut() {
            routes.insert(trip_id, stops);
        }
        self
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// The next `count` writes are stored but answered with a timeout.
    pub fn lose_next_acks(&self, count: usize) {
        self.lost_acks.store(count, Ordering::SeqCst);
    }

    /// Records an arrival as if an earlier, unacknowledged attempt had landed.
    pub fn preload_arrival(&self, arrival: StopArrival) {
        if let Ok(mut records) = self.records.lock() {
            records
                .arrival_keys
                .insert((arrival.trip_id, arrival.stop_id));
            records.delivered.push(QueueItem::StopArrival(arrival));
        }
    }

    /// Every event stored, in the order it was accepted.
    pub fn delivered(&self) -> Vec<QueueItem> {
        self.records
            .lock()
            .map(|r| r.delivered.clone())
            .unwrap_or_default()
    }

    pub fn arrivals(&self) -> Vec<StopArrival> {
        self.delivered()
            .into_iter()
            .filter_map(|item| match item {
                QueueItem::StopArrival(a) => Some(a),
                QueueItem::LocationUpdate(_) => None,
            })
            .collect()
    }

    pub fn duplicate_attempts(&self) -> usize {
        self.records
            .lock()
            .map(|r| r.duplicate_attempts)
            .unwrap_or(0)
    }

    pub fn trip_statuses(&self) -> Vec<(i64, RemoteTripStatus)> {
        self.records
            .lock()
            .map(|r| r.trip_statuses.clone())
            .unwrap_or_default()
    }

    pub fn delays(&self) -> Vec<(i64, String)> {
        self.records
            .lock()
            .map(|r| r.delays.clone())
            .unwrap_or_default()
    }

    async fn round_trip(&self) -> Result<(), BackendError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Unreachable("network is down".to_string()));
        }
        Ok(())
    }

    fn ack(&self) -> Result<(), BackendError> {
        let lost = self
            .lost_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            Err(BackendError::Timeout(Duration::from_millis(
                self.latency_ms.load(Ordering::SeqCst),
            )))
        } else {
            Ok(())
        }
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, Records>, BackendError> {
        self.records
            .lock()
            .map_err(|_| BackendError::Unreachable("backend state poisoned".to_string()))
    }
}

#[async_trait]
impl BackendApi for InMemoryBackend {
    async fn record_location(&self, update: &LocationUpdate) -> Result<(), BackendError> {
        self.round_trip().await?;
        self.records()?
            .delivered
            .push(QueueItem::LocationUpdate(update.clone()));
        self.ack()
    }

    async fn record_arrival(&self, arrival: &StopArrival) -> Result<ArrivalOutcome, BackendError> {
        self.round_trip().await?;
        {
            let mut records = self.records()?;
            if !records
                .arrival_keys
                .insert((arrival.trip_id, arrival.stop_id))
            {
                records.duplicate_attempts += 1;
                return Ok(ArrivalOutcome::Duplicate);
            }
            records
                .delivered
                .push(QueueItem::StopArrival(arrival.clone()));
        }
        self.ack().map(|_| ArrivalOutcome::Recorded)
    }

    async fn update_trip_status(
        &self,
        trip_id: i64,
        status: RemoteTripStatus,
    ) -> Result<(), BackendError> {
        self.round_trip().await?;
        self.records()?.trip_statuses.push((trip_id, status));
        Ok(())
    }

    async fn fetch_stops(&self, trip_id: i64) -> Result<Vec<StopRecord>, BackendError> {
        self.round_trip().await?;
        let routes = self
            .routes
            .lock()
            .map_err(|_| BackendError::Unreachable("backend state poisoned".to_string()))?;
        routes.get(&trip_id).cloned().ok_or(BackendError::Status {
            status: 404,
            body: format!("trip {trip_id} not found"),
        })
    }

    async fn report_delay(
        &self,
        trip_id: i64,
        reason: &str,
        reported_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        self.round_trip().await?;
        info!(trip_id, reason, %reported_at, "Delay reported");
        self.records()?.delays.push((trip_id, reason.to_string()));
        Ok(())
    }
}
