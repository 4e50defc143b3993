//! The explicit bundle of handles the tracking engine works with.

use std::sync::Arc;

use crate::config::TrackerConfig;
use crate::queue::PersistentQueue;
use crate::services::backend_api::BackendApi;
use crate::storage::{KeyValueStore, StorageError, get_json, set_json};
use crate::sync::SyncEngine;
use crate::trip::ActiveTrip;

pub const ACTIVE_TRIP_KEY: &str = "active_trip";

/// Owns the durable queue, the trip store and the sync engine for one device.
///
/// Background work receives this session instead of reaching for globals.
pub struct TrackingSession<B: ?Sized> {
    config: TrackerConfig,
    store: Arc<dyn KeyValueStore>,
    queue: Arc<PersistentQueue>,
    backend: Arc<B>,
    sync: Arc<SyncEngine<B>>,
}

impl<B: BackendApi + ?Sized + 'static> TrackingSession<B> {
    pub fn open(
        config: TrackerConfig,
        store: Arc<dyn KeyValueStore>,
        backend: Arc<B>,
    ) -> Result<Self, StorageError> {
        let queue = Arc::new(PersistentQueue::open(store.clone())?);
        let sync = Arc::new(SyncEngine::new(
            queue.clone(),
            backend.clone(),
            config.network_timeout,
            config.drain_mode,
        ));
        Ok(Self {
            config,
            store,
            queue,
            backend,
            sync,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<PersistentQueue> {
        &self.queue
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn sync(&self) -> &Arc<SyncEngine<B>> {
        &self.sync
    }

    pub fn load_active_trip(&self) -> Result<Option<ActiveTrip>, StorageError> {
        get_json(self.store.as_ref(), ACTIVE_TRIP_KEY)
    }

    pub fn save_active_trip(&self, trip: &ActiveTrip) -> Result<(), StorageError> {
        set_json(self.store.as_ref(), ACTIVE_TRIP_KEY, trip)
    }

    pub fn clear_active_trip(&self) -> Result<(), StorageError> {
        self.store.remove(ACTIVE_TRIP_KEY)
    }
}
