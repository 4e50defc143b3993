//! Position sampling on top of a platform location service.
//!
//! A [`LocationProvider`] wraps the platform API. [`LocationSampler`] checks
//! permission, subscribes, enforces the cadence, drops malformed fixes and
//! forwards the rest to a [`SampleSink`] from a background task.

mod manual;
mod replay;

pub use manual::ManualProvider;
pub use replay::ReplayProvider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::geo::distance;
use crate::model::PositionSample;

/// Minimum spacing between emitted samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cadence {
    pub min_interval: Duration,
    pub min_distance_m: f64,
}

impl Cadence {
    /// Emits every fix the provider delivers.
    pub const EVERY_FIX: Cadence = Cadence {
        min_interval: Duration::ZERO,
        min_distance_m: 0.0,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location service unavailable: {0}")]
    Unavailable(String),
}

/// Platform location service.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Requests (or re-checks) the foreground and background location permission.
    async fn request_permission(&self) -> Permission;

    /// Starts delivering fixes. Dropping the receiver ends the subscription.
    async fn subscribe(
        &self,
        cadence: Cadence,
    ) -> Result<mpsc::Receiver<PositionSample>, SamplerError>;

    /// Releases any platform resources held for the subscription.
    async fn unsubscribe(&self);
}

/// Consumer of emitted samples.
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn on_sample(&self, sample: PositionSample);
}

/// Handle to a running subscription, returned by [`LocationSampler::start`].
pub struct SamplerHandle {
    task: JoinHandle<()>,
    ended: watch::Receiver<bool>,
}

impl SamplerHandle {
    /// Becomes `true` once the provider stops delivering fixes on its own.
    pub fn ended(&self) -> watch::Receiver<bool> {
        self.ended.clone()
    }
}

pub struct LocationSampler<P: ?Sized> {
    provider: Arc<P>,
}

impl<P: LocationProvider + ?Sized + 'static> LocationSampler<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }

    pub async fn ensure_permission(&self) -> Result<(), SamplerError> {
        match self.provider.request_permission().await {
            Permission::Granted => Ok(()),
            Permission::Denied => {
                warn!("Location permission denied");
                Err(SamplerError::PermissionDenied)
            }
        }
    }

    pub async fn start(
        &self,
        cadence: Cadence,
        sink: Arc<dyn SampleSink>,
    ) -> Result<SamplerHandle, SamplerError> {
        self.ensure_permission().await?;
        let mut rx = self.provider.subscribe(cadence).await?;
        let (ended_tx, ended) = watch::channel(false);

        info!(
            min_interval_ms = cadence.min_interval.as_millis() as u64,
            min_distance_m = cadence.min_distance_m,
            "Location sampling started"
        );

        let task = tokio::spawn(async move {
            let mut filter = CadenceFilter::new(cadence);
            while let Some(sample) = rx.recv().await {
                if let Err(e) = sample.validate() {
                    warn!(error = %e, "Discarding malformed sample");
                    continue;
                }
                if !filter.admit(&sample) {
                    trace!(captured_at = %sample.captured_at, "Sample inside cadence window");
                    continue;
                }
                sink.on_sample(sample).await;
            }
            debug!("Location stream ended");
            let _ = ended_tx.send(true);
        });

        Ok(SamplerHandle { task, ended })
    }

    /// Tears down the subscription; no sample is delivered after this returns.
    pub async fn stop(&self, handle: SamplerHandle) {
        handle.task.abort();
        let _ = handle.task.await;
        self.provider.unsubscribe().await;
        info!("Location sampling stopped");
    }
}

/// Admits a sample once both the interval and the displacement minimums are met.
struct CadenceFilter {
    cadence: Cadence,
    last: Option<PositionSample>,
}

impl CadenceFilter {
    fn new(cadence: Cadence) -> Self {
        Self {
            cadence,
            last: None,
        }
    }

    fn admit(&mut self, sample: &PositionSample) -> bool {
        if let Some(last) = &self.last {
            let elapsed = (sample.captured_at - last.captured_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let moved = distance(last.coordinate(), sample.coordinate());
            if elapsed < self.cadence.min_interval || moved < self.cadence.min_distance_m {
                return false;
            }
        }
        self.last = Some(sample.clone());
        true
    }
}
