//! Task processing hooks.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::task::Task;
use crate::error::Result;

/// Processes one dequeued task.
///
/// Errors and panics are contained by the consumer loop: they are logged
/// and counted, and the consumer moves on to the next task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn process(&self, task: &Task) -> Result<()>;
}

#[async_trait]
impl<T: TaskHandler + ?Sized> TaskHandler for Arc<T> {
    async fn process(&self, task: &Task) -> Result<()> {
        (**self).process(task).await
    }
}

/// Logs each task and reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl TaskHandler for LoggingHandler {
    async fn process(&self, task: &Task) -> Result<()> {
        info!(task_id = %task.id, work = %task.payload, "Processed task");
        Ok(())
    }
}
