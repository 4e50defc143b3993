use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Cadence, LocationProvider, Permission, SamplerError};
use crate::model::PositionSample;

const BUFFER: usize = 64;

/// Provider fed by the host: each [`push`](ManualProvider::push) is one fix.
pub struct ManualProvider {
    permission: Mutex<Permission>,
    sender: Mutex<Option<mpsc::Sender<PositionSample>>>,
    subscriptions: AtomicUsize,
}

impl ManualProvider {
    pub fn new() -> Self {
        Self::with_permission(Permission::Granted)
    }

    pub fn denied() -> Self {
        Self::with_permission(Permission::Denied)
    }

    fn with_permission(permission: Permission) -> Self {
        Self {
            permission: Mutex::new(permission),
            sender: Mutex::new(None),
            subscriptions: AtomicUsize::new(0),
        }
    }

    pub fn set_permission(&self, permission: Permission) {
        if let Ok(mut current) = self.permission.lock() {
            *current = permission;
        }
    }

    /// Delivers a fix. Returns `false` when nobody is subscribed.
    pub async fn push(&self, sample: PositionSample) -> bool {
        let tx = self.sender.lock().ok().and_then(|s| s.clone());
        match tx {
            Some(tx) => tx.send(sample).await.is_ok(),
            None => false,
        }
    }

    /// Ends the current stream as if the platform stopped delivering fixes.
    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.sender
            .lock()
            .map(|s| s.as_ref().is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    /// Number of subscriptions opened so far.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

impl Default for ManualProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocationProvider for ManualProvider {
    async fn request_permission(&self) -> Permission {
        self.permission
            .lock()
            .map(|p| *p)
            .unwrap_or(Permission::Denied)
    }

    async fn subscribe(
        &self,
        _cadence: Cadence,
    ) -> Result<mpsc::Receiver<PositionSample>, SamplerError> {
        let (tx, rx) = mpsc::channel(BUFFER);
        let mut sender = self
            .sender
            .lock()
            .map_err(|_| SamplerError::Unavailable("provider state poisoned".to_string()))?;
        *sender = Some(tx);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn unsubscribe(&self) {
        self.close();
    }
}
