use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Cadence, LocationProvider, Permission, SamplerError};
use crate::model::PositionSample;

/// One row of a recorded track.
#[derive(Debug, Clone, Deserialize)]
struct TrackPoint {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    speed_mps: Option<f64>,
    #[serde(default)]
    accuracy_m: Option<f64>,
    #[serde(default)]
    captured_at: Option<DateTime<Utc>>,
}

impl TrackPoint {
    fn into_sample(self) -> PositionSample {
        PositionSample {
            latitude: self.latitude,
            longitude: self.longitude,
            speed_meters_per_second: self.speed_mps,
            accuracy_meters: self.accuracy_m,
            captured_at: self.captured_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Replays a recorded track as if it came from the location service.
///
/// Points without a `captured_at` are stamped when they are emitted.
pub struct ReplayProvider {
    points: Vec<TrackPoint>,
    pace: Duration,
    feeder: Mutex<Option<JoinHandle<()>>>,
}

impl ReplayProvider {
    /// Parses a CSV track with header `latitude,longitude,speed_mps,accuracy_m,captured_at`.
    pub fn from_csv(bytes: &[u8], pace: Duration) -> Result<Self> {
        let mut rdr = csv::Reader::from_reader(bytes);
        let mut points = Vec::new();
        for (row, result) in rdr.deserialize().enumerate() {
            let point: TrackPoint = result.with_context(|| format!("bad track row {}", row + 1))?;
            points.push(point);
        }
        Ok(Self {
            points,
            pace,
            feeder: Mutex::new(None),
        })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[async_trait]
impl LocationProvider for ReplayProvider {
    async fn request_permission(&self) -> Permission {
        Permission::Granted
    }

    async fn subscribe(
        &self,
        _cadence: Cadence,
    ) -> Result<mpsc::Receiver<PositionSample>, SamplerError> {
        let (tx, rx) = mpsc::channel(16);
        let points = self.points.clone();
        let pace = self.pace;

        let feeder = tokio::spawn(async move {
            for (i, point) in points.into_iter().enumerate() {
                if i > 0 && !pace.is_zero() {
                    tokio::time::sleep(pace).await;
                }
                if tx.send(point.into_sample()).await.is_err() {
                    break;
                }
            }
            debug!("Track replay finished");
        });

        let mut slot = self
            .feeder
            .lock()
            .map_err(|_| SamplerError::Unavailable("replay state poisoned".to_string()))?;
        if let Some(previous) = slot.replace(feeder) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn unsubscribe(&self) {
        if let Ok(mut slot) = self.feeder.lock() {
            if let Some(feeder) = slot.take() {
                feeder.abort();
            }
        }
    }
}
