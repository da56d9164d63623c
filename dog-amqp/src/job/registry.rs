use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::error::AmqpResult;
use crate::job::Job;

/// Ordered collection of every job created against a supervisor
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<Vec<Arc<Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job; registration order is start order
    pub fn register(&self, job: Arc<Job>) {
        self.jobs.write().push(job);
    }

    /// Snapshot of all registered jobs
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.read().clone()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    /// Arm every job that is not publish-only, in registration order.
    ///
    /// Stops at the first job that fails to start. Returns how many jobs
    /// were started.
    pub async fn start_all(&self, handler_timeout: Duration) -> AmqpResult<usize> {
        let mut started = 0;
        for job in self.jobs() {
            if job.publish_only() {
                continue;
            }
            if let Err(err) = job.consume(handler_timeout).await {
                error!(job_id = %job.id(), queue = %job.queue(), error = %err, "error in starting job");
                return Err(err);
            }
            started += 1;
        }
        info!(started, "jobs started");
        Ok(started)
    }

    /// Shut every job down concurrently and wait for all of them.
    ///
    /// Every job is asked to stop even when one fails; the first error is
    /// returned.
    pub async fn shutdown_all(&self) -> AmqpResult<()> {
        let jobs = self.jobs();
        let results = join_all(jobs.iter().map(|job| job.shutdown())).await;

        let mut first_error = None;
        for (job, result) in jobs.iter().zip(results) {
            if let Err(err) = result {
                error!(job_id = %job.id(), error = %err, "job shutdown failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.len())
            .finish()
    }
}
