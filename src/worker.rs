//! Queue consumer.
//!
//! A worker leases messages from the queues of one [`Stage`] and runs up to
//! `worker.concurrency` handlers at once. A message is deleted only after
//! its handler returned, so a crash mid-handler leaves it to reappear when
//! the lease expires. Messages that keep coming back (more than
//! `worker.max_dequeue_count` receives) or that fail to decode are moved to
//! the `{queue}-poison` queue instead of being retried forever.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::queue::{poison_queue_name, Queue, ReceivedMessage};
use crate::stages::{Disposition, Stage};

pub struct Worker {
    stage: Arc<dyn Stage>,
    queue: Arc<dyn Queue>,
    config: WorkerConfig,
}

/// Deliver one leased message to `stage` and settle it.
async fn settle(
    stage: &dyn Stage,
    queue: &dyn Queue,
    queue_name: &str,
    message: ReceivedMessage,
    max_dequeue_count: u32,
) -> Result<()> {
    let disposition = if message.dequeue_count > max_dequeue_count {
        Disposition::Quarantine(format!(
            "received {} times, limit {}",
            message.dequeue_count, max_dequeue_count
        ))
    } else {
        stage.handle(&message.body).await
    };

    if let Disposition::Quarantine(reason) = &disposition {
        let poison = poison_queue_name(queue_name);
        warn!(queue = queue_name, message_id = %message.id, "moving to {}: {}", poison, reason);
        queue
            .send(&poison, &message.body, 0)
            .await
            .with_context(|| format!("Failed to quarantine message {}", message.id))?;
    }

    queue.delete(queue_name, &message).await
}

impl Worker {
    pub fn new(stage: Arc<dyn Stage>, queue: Arc<dyn Queue>, config: WorkerConfig) -> Self {
        Self {
            stage,
            queue,
            config,
        }
    }

    /// Receive from the stage's queues in order; first visible message wins.
    async fn receive(&self) -> Result<Option<(String, ReceivedMessage)>> {
        for name in self.stage.queues() {
            if let Some(message) = self
                .queue
                .receive(&name, self.config.visibility_timeout_secs)
                .await?
            {
                return Ok(Some((name, message)));
            }
        }
        Ok(None)
    }

    /// Handle messages one at a time until the queues are empty or `limit`
    /// messages were handled. Returns the number handled.
    pub async fn drain(&self, limit: usize) -> Result<usize> {
        let mut handled = 0;
        while handled < limit {
            let Some((name, message)) = self.receive().await? else {
                break;
            };
            settle(
                self.stage.as_ref(),
                self.queue.as_ref(),
                &name,
                message,
                self.config.max_dequeue_count,
            )
            .await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Consume until `shutdown` resolves, then wait for in-flight handlers.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let concurrency = self.config.concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        let idle = Duration::from_millis(self.config.poll_interval_ms);
        tokio::pin!(shutdown);

        info!(
            stage = self.stage.name(),
            queues = ?self.stage.queues(),
            concurrency,
            "worker started"
        );

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = permits.clone().acquire_owned() => permit.context("worker semaphore closed")?,
            };

            let received = match self.receive().await {
                Ok(received) => received,
                Err(e) => {
                    error!(stage = self.stage.name(), "receive failed: {:#}", e);
                    None
                }
            };

            let (name, message) = match received {
                Some(received) => received,
                None => {
                    drop(permit);
                    let stop = tokio::select! {
                        _ = &mut shutdown => true,
                        _ = tokio::time::sleep(idle) => false,
                    };
                    if stop {
                        break;
                    }
                    continue;
                }
            };

            debug!(queue = %name, message_id = %message.id, dequeue_count = message.dequeue_count, "received");
            let stage = self.stage.clone();
            let queue = self.queue.clone();
            let max_dequeue_count = self.config.max_dequeue_count;
            tokio::spawn(async move {
                if let Err(e) =
                    settle(stage.as_ref(), queue.as_ref(), &name, message, max_dequeue_count).await
                {
                    error!(queue = %name, "failed to settle message: {:#}", e);
                }
                drop(permit);
            });
        }

        info!(stage = self.stage.name(), "shutting down, waiting for in-flight messages");
        let all = u32::try_from(concurrency).unwrap_or(u32::MAX);
        let _drained = permits
            .acquire_many(all)
            .await
            .context("worker semaphore closed")?;
        Ok(())
    }
}
