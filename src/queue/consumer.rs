//! Task consumer and its processing loop.

use std::any::Any;
use std::iter::Sum;
use std::ops::AddAssign;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::handler::TaskHandler;
use super::task::Task;
use crate::config::QueueConfig;
use crate::error::{KvflowError, Result};
use crate::store::KeyValueStore;

/// What a consumer does when a dequeue times out on an empty queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdlePolicy {
    /// Poll again
    #[default]
    KeepPolling,
    /// Stop the consumer
    Exit,
}

/// Per-consumer outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub processed: u64,
    pub failed: u64,
    pub malformed: u64,
    pub idle_timeouts: u64,
}

impl AddAssign for ConsumerStats {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.malformed += other.malformed;
        self.idle_timeouts += other.idle_timeouts;
    }
}

impl Sum for ConsumerStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |mut total, stats| {
            total += stats;
            total
        })
    }
}

/// Claims tasks from the queue one at a time.
pub struct Consumer<S: KeyValueStore> {
    name: String,
    store: Arc<S>,
    queue_key: String,
    timeout: Duration,
    idle_policy: IdlePolicy,
}

impl<S: KeyValueStore> Consumer<S> {
    pub fn new(name: impl Into<String>, store: Arc<S>, config: &QueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            store,
            queue_key: config.queue_key.clone(),
            timeout: config.dequeue_timeout(),
            idle_policy: config.idle_policy,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the next task, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` on timeout. A value that does not decode yields
    /// `MalformedTask`; it has already been removed from the queue.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Task>> {
        match self.store.brpop(&self.queue_key, timeout).await? {
            Some(raw) => Task::decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Process tasks until shutdown is signalled, the idle policy says to
    /// stop, or the store fails.
    ///
    /// The shutdown flag is checked between polls. An in-flight pop or
    /// `process` call is always allowed to finish: abandoning a pop could
    /// drop a task the store already handed over. The dequeue timeout bounds
    /// how long shutdown takes on an idle queue.
    #[instrument(skip_all, fields(consumer = %self.name, queue = %self.queue_key))]
    pub async fn run<H>(&self, handler: &H, shutdown: watch::Receiver<bool>) -> Result<ConsumerStats>
    where
        H: TaskHandler + ?Sized,
    {
        info!("Consumer started");
        let mut stats = ConsumerStats::default();

        loop {
            let stop = *shutdown.borrow();
            if stop {
                info!("Shutdown requested");
                break;
            }

            match self.dequeue(self.timeout).await {
                Ok(Some(task)) => self.process(handler, &task, &mut stats).await,
                Ok(None) => {
                    stats.idle_timeouts += 1;
                    if self.handle_idle() == IdlePolicy::Exit {
                        break;
                    }
                }
                Err(KvflowError::MalformedTask { raw, reason }) => {
                    stats.malformed += 1;
                    warn!(raw = %raw, reason = %reason, "Dropping malformed task");
                }
                Err(e) => {
                    error!(error = %e, "Dequeue failed, consumer stopping");
                    return Err(e);
                }
            }
        }

        info!(
            processed = stats.processed,
            failed = stats.failed,
            malformed = stats.malformed,
            "Consumer stopped"
        );
        Ok(stats)
    }

    fn handle_idle(&self) -> IdlePolicy {
        match self.idle_policy {
            IdlePolicy::KeepPolling => {
                debug!(timeout_secs = self.timeout.as_secs(), "Queue idle, polling again");
            }
            IdlePolicy::Exit => {
                info!(timeout_secs = self.timeout.as_secs(), "Queue idle, exiting");
            }
        }
        self.idle_policy
    }

    async fn process<H>(&self, handler: &H, task: &Task, stats: &mut ConsumerStats)
    where
        H: TaskHandler + ?Sized,
    {
        match AssertUnwindSafe(handler.process(task)).catch_unwind().await {
            Ok(Ok(())) => {
                stats.processed += 1;
                debug!(task_id = %task.id, "Task processed");
            }
            Ok(Err(e)) => {
                stats.failed += 1;
                error!(task_id = %task.id, error = %e, "Task failed");
            }
            Err(panic) => {
                stats.failed += 1;
                error!(
                    task_id = %task.id,
                    panic = %panic_message(panic.as_ref()),
                    "Task handler panicked"
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
