use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{Job, JobQueue, ReceivedJob, Result};

#[derive(Debug, Default)]
struct Inner {
    pending: VecDeque<Job>,
    in_flight: HashMap<String, Job>,
}

/// FIFO queue held in process memory, for tests and single-process setups.
///
/// Receiving is destructive: a job that is received but never deleted is not
/// delivered again.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs waiting to be received.
    pub async fn pending(&self) -> Vec<Job> {
        self.inner.lock().await.pending.iter().cloned().collect()
    }

    /// Jobs received but not yet deleted.
    pub async fn in_flight(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn send(&self, job: &Job) -> Result<()> {
        self.inner.lock().await.pending.push_back(job.clone());
        Ok(())
    }

    async fn receive(&self) -> Result<Option<ReceivedJob>> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.pending.pop_front() else {
            return Ok(None);
        };
        let receipt = Uuid::new_v4().to_string();
        inner.in_flight.insert(receipt.clone(), job.clone());
        Ok(Some(ReceivedJob { job, receipt }))
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        self.inner.lock().await.in_flight.remove(receipt);
        Ok(())
    }
}
