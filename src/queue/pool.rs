//! A group of consumers draining one queue concurrently.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::consumer::{Consumer, ConsumerStats};
use super::handler::TaskHandler;
use crate::config::QueueConfig;
use crate::error::{KvflowError, Result};
use crate::store::KeyValueStore;

/// `consumer_count` consumers, each on its own tokio task, sharing a
/// shutdown signal.
pub struct ConsumerPool {
    shutdown: watch::Sender<bool>,
    workers: Vec<(String, JoinHandle<Result<ConsumerStats>>)>,
}

impl ConsumerPool {
    /// Start the consumers. Must be called from within a tokio runtime.
    pub fn spawn<S, H>(store: Arc<S>, config: &QueueConfig, handler: Arc<H>) -> Result<Self>
    where
        S: KeyValueStore + 'static,
        H: TaskHandler + 'static,
    {
        config.validate()?;
        let (shutdown, rx) = watch::channel(false);

        let workers = (0..config.consumer_count)
            .map(|i| {
                let name = format!("C{}", i);
                let consumer = Consumer::new(name.clone(), Arc::clone(&store), config)?;
                let handler = Arc::clone(&handler);
                let rx = rx.clone();
                let handle = tokio::spawn(async move { consumer.run(&*handler, rx).await });
                Ok((name, handle))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            consumers = workers.len(),
            queue = %config.queue_key,
            "Consumer pool started"
        );
        Ok(Self { shutdown, workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Ask every consumer to stop after its current poll or task.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait for every consumer to stop.
    ///
    /// Returns per-consumer stats in spawn order, or the first error once
    /// all consumers have finished.
    pub async fn join(self) -> Result<Vec<ConsumerStats>> {
        join_workers(self.workers).await
    }

    /// Run until every consumer stops on its own or `signal` resolves,
    /// whichever comes first. On the signal, consumers finish their current
    /// poll or task before the pool returns.
    pub async fn run_until<F>(self, signal: F) -> Result<Vec<ConsumerStats>>
    where
        F: Future<Output = ()>,
    {
        let ConsumerPool { shutdown, workers } = self;
        let joined = join_workers(workers);
        tokio::pin!(joined);

        tokio::select! {
            result = &mut joined => return result,
            _ = signal => {
                info!("Shutdown signal received, draining consumers");
                shutdown.send_replace(true);
            }
        }

        joined.await
    }

    /// Signal shutdown and wait for the consumers to stop.
    pub async fn shutdown_and_join(self) -> Result<Vec<ConsumerStats>> {
        self.shutdown();
        self.join().await
    }
}

async fn join_workers(
    workers: Vec<(String, JoinHandle<Result<ConsumerStats>>)>,
) -> Result<Vec<ConsumerStats>> {
    let mut stats = Vec::with_capacity(workers.len());
    let mut first_error = None;

    for (name, handle) in workers {
        let outcome = handle
            .await
            .map_err(|e| KvflowError::TaskFailed(format!("consumer {} aborted: {}", name, e)))
            .and_then(|result| result);

        match outcome {
            Ok(s) => stats.push(s),
            Err(e) => {
                error!(consumer = %name, error = %e, "Consumer ended with error");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(stats),
    }
}
