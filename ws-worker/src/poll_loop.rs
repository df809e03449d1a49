use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};
use ws_queue::{JobQueue, ReceivedJob};

use crate::config::WorkerSettings;
use crate::processor::Processor;

/// Single consumer: one job at a time, acknowledged after processing.
pub struct PollLoop {
    queue: Arc<dyn JobQueue>,
    processor: Arc<Processor>,
    error_backoff: Duration,
    idle_delay: Duration,
}

impl PollLoop {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        processor: Arc<Processor>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            processor,
            error_backoff: Duration::from_millis(settings.error_backoff_ms),
            idle_delay: Duration::from_millis(settings.idle_delay_ms),
        }
    }

    async fn handle(&self, received: ReceivedJob) -> ws_queue::Result<()> {
        self.processor.process(&received.job).await;
        self.queue.delete(&received.receipt).await
    }

    /// Receive and process at most one job. `Ok(false)` means the queue was empty.
    pub async fn poll_once(&self) -> ws_queue::Result<bool> {
        match self.queue.receive().await? {
            Some(received) => {
                self.handle(received).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Poll until `shutdown` changes or its sender is dropped.
    ///
    /// Shutdown interrupts waiting, never a job in progress.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("worker poll loop started");

        while !*shutdown.borrow() {
            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.queue.receive() => received,
            };

            let pause = match received {
                Ok(Some(received)) => match self.handle(received).await {
                    Ok(()) => None,
                    Err(e) => {
                        error!(error = %e, "failed to acknowledge job");
                        Some(self.error_backoff)
                    }
                },
                Ok(None) => {
                    debug!("queue empty");
                    Some(self.idle_delay)
                }
                Err(e) => {
                    error!(error = %e, "failed to receive job");
                    Some(self.error_backoff)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!("worker poll loop stopped");
    }
}
