//! Durable FIFO of outbound events.
//!
//! The whole list is rewritten through [`KeyValueStore::set`] on every
//! mutation, so an interrupted write leaves the previous list intact.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::model::QueueItem;
use crate::storage::{KeyValueStore, StorageError, get_json, set_json};

pub const QUEUE_KEY: &str = "outbox";

pub struct PersistentQueue {
    store: Arc<dyn KeyValueStore>,
    items: Mutex<VecDeque<QueueItem>>,
}

impl PersistentQueue {
    /// Loads any items left over from a previous run.
    pub fn open(store: Arc<dyn KeyValueStore>) -> Result<Self, StorageError> {
        let items: VecDeque<QueueItem> = get_json::<Vec<QueueItem>>(store.as_ref(), QUEUE_KEY)?
            .unwrap_or_default()
            .into();
        if !items.is_empty() {
            info!(pending = items.len(), "Recovered queued events from storage");
        }
        Ok(Self {
            store,
            items: Mutex::new(items),
        })
    }

    pub fn enqueue(&self, item: QueueItem) -> Result<(), StorageError> {
        let mut items = self.items.lock().map_err(|_| StorageError::Poisoned)?;
        let kind = item.kind();
        items.push_back(item);
        if let Err(e) = self.persist(&items) {
            items.pop_back();
            return Err(e);
        }
        debug!(kind, pending = items.len(), "Enqueued event");
        Ok(())
    }

    pub fn peek_head(&self) -> Result<Option<QueueItem>, StorageError> {
        let items = self.items.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(items.front().cloned())
    }

    /// Drops the head item and returns it. A no-op on an empty queue.
    pub fn remove_head(&self) -> Result<Option<QueueItem>, StorageError> {
        let mut items = self.items.lock().map_err(|_| StorageError::Poisoned)?;
        let Some(head) = items.pop_front() else {
            return Ok(None);
        };
        if let Err(e) = self.persist(&items) {
            items.push_front(head);
            return Err(e);
        }
        Ok(Some(head))
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the pending items in delivery order.
    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.items
            .lock()
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn persist(&self, items: &VecDeque<QueueItem>) -> Result<(), StorageError> {
        let (front, back) = items.as_slices();
        let all: Vec<&QueueItem> = front.iter().chain(back.iter()).collect();
        set_json(self.store.as_ref(), QUEUE_KEY, &all)
    }
}
