//! Drains the durable queue to the backend.
//!
//! Delivery is at-least-once: an item leaves the queue only after the backend
//! confirmed it, or reported that an earlier attempt already stored it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::model::QueueItem;
use crate::queue::PersistentQueue;
use crate::services::backend_api::{ArrivalOutcome, BackendApi, BackendError};

/// How much of the queue a single flush may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainMode {
    /// Send until the queue is empty or a delivery fails.
    #[default]
    Full,
    /// Send at most the head item per flush.
    Single,
}

impl FromStr for DrainMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(DrainMode::Full),
            "single" => Ok(DrainMode::Single),
            other => Err(format!("unknown drain mode '{other}'")),
        }
    }
}

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Items the backend newly stored.
    pub delivered: usize,
    /// Arrivals the backend already had.
    pub duplicates: usize,
    /// Items still queued after the cycle.
    pub remaining: usize,
    /// Why the cycle stopped early, if it did.
    pub interrupted: Option<String>,
}

impl fmt::Display for FlushReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delivered {}, duplicates {}, remaining {}",
            self.delivered, self.duplicates, self.remaining
        )?;
        if let Some(reason) = &self.interrupted {
            write!(f, " (stopped: {reason})")?;
        }
        Ok(())
    }
}

enum Delivery {
    Stored,
    AlreadyStored,
}

pub struct SyncEngine<B: ?Sized> {
    queue: Arc<PersistentQueue>,
    backend: Arc<B>,
    request_timeout: Duration,
    drain: DrainMode,
    in_flight: Mutex<()>,
    wake: Notify,
}

impl<B: BackendApi + ?Sized + 'static> SyncEngine<B> {
    pub fn new(
        queue: Arc<PersistentQueue>,
        backend: Arc<B>,
        request_timeout: Duration,
        drain: DrainMode,
    ) -> Self {
        Self {
            queue,
            backend,
            request_timeout,
            drain,
            in_flight: Mutex::new(()),
            wake: Notify::new(),
        }
    }

    pub fn queue(&self) -> &Arc<PersistentQueue> {
        &self.queue
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Asks a running sync loop to flush as soon as possible.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Runs one flush cycle. Never fails: problems are logged and reported.
    ///
    /// Concurrent callers are serialized, so the head item is never sent twice
    /// by overlapping flushes.
    #[tracing::instrument(skip(self), fields(pending = self.queue.len()))]
    pub async fn flush(&self) -> FlushReport {
        let _in_flight = self.in_flight.lock().await;
        let mut report = FlushReport::default();

        loop {
            let head = match self.queue.peek_head() {
                Ok(Some(head)) => head,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to read queue head");
                    report.interrupted = Some(e.to_string());
                    break;
                }
            };

            match self.deliver(&head).await {
                Ok(Delivery::Stored) => {
                    debug!(kind = head.kind(), "Event delivered");
                    report.delivered += 1;
                }
                Ok(Delivery::AlreadyStored) => {
                    info!(kind = head.kind(), "Backend already had event, dropping it");
                    report.duplicates += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(kind = head.kind(), error = %e, "Delivery failed, will retry");
                    } else {
                        error!(kind = head.kind(), error = %e, "Backend rejected event, keeping it queued");
                    }
                    report.interrupted = Some(e.to_string());
                    break;
                }
            }

            if let Err(e) = self.queue.remove_head() {
                error!(error = %e, "Failed to drop delivered event from queue");
                report.interrupted = Some(e.to_string());
                break;
            }

            if self.drain == DrainMode::Single {
                break;
            }
        }

        report.remaining = self.queue.len();
        if report.delivered + report.duplicates > 0 || report.interrupted.is_some() {
            info!(%report, "Flush finished");
        }
        report
    }

    async fn deliver(&self, item: &QueueItem) -> Result<Delivery, BackendError> {
        let call = async {
            match item {
                QueueItem::LocationUpdate(update) => self
                    .backend
                    .record_location(update)
                    .await
                    .map(|_| Delivery::Stored),
                QueueItem::StopArrival(arrival) => self
                    .backend
                    .record_arrival(arrival)
                    .await
                    .map(|outcome| match outcome {
                        ArrivalOutcome::Recorded => Delivery::Stored,
                        ArrivalOutcome::Duplicate => Delivery::AlreadyStored,
                    }),
            }
        };

        tokio::time::timeout(self.request_timeout, call)
            .await
            .map_err(|_| BackendError::Timeout(self.request_timeout))?
    }

    /// Starts the background loop: flushes every `interval` and whenever triggered.
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> SyncLoop {
        let engine = Arc::clone(self);
        let (shutdown, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(interval_secs = interval.as_secs_f64(), "Sync loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = engine.wake.notified() => {}
                    _ = stop_rx.changed() => break,
                }

                // an abandoned flush leaves its head item queued
                tokio::select! {
                    _ = engine.flush() => {}
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("Sync loop stopped");
        });

        SyncLoop { shutdown, task }
    }
}

/// Handle to a running sync loop.
pub struct SyncLoop {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncLoop {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!(error = %e, "Sync loop panicked");
            }
        }
    }
}
