//! Task producer.

use std::sync::Arc;

use tracing::{debug, instrument};

use super::task::Task;
use crate::config::QueueConfig;
use crate::error::Result;
use crate::store::KeyValueStore;

/// Appends tasks to the queue without waiting for consumers.
///
/// Any number of producers may share a queue; each push is atomic in the
/// store, so interleaved pushes never corrupt one another.
pub struct Producer<S: KeyValueStore> {
    store: Arc<S>,
    queue_key: String,
}

impl<S: KeyValueStore> Producer<S> {
    pub fn new(store: Arc<S>, queue_key: impl Into<String>) -> Self {
        Self {
            store,
            queue_key: queue_key.into(),
        }
    }

    pub fn from_config(store: Arc<S>, config: &QueueConfig) -> Self {
        Self::new(store, config.queue_key.clone())
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    /// Serialize `task` and push it onto the queue. Returns the queue length.
    #[instrument(skip_all, fields(task_id = %task.id, queue = %self.queue_key))]
    pub async fn enqueue(&self, task: &Task) -> Result<u64> {
        let raw = task.encode()?;
        let len = self.store.lpush(&self.queue_key, &raw).await?;
        debug!(len, "Task enqueued");
        Ok(len)
    }

    /// Number of tasks waiting in the queue.
    pub async fn len(&self) -> Result<u64> {
        self.store.llen(&self.queue_key).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
