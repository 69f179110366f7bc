//! Worker loop: pull the highest-priority eligible job, run its handler,
//! ack on return. Handler errors never take the worker down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{error, info};

use super::{Job, JobQueue};
use crate::error::Result;

/// Implemented by the engine; maps payloads to the functions that do the
/// actual work. Handlers may enqueue further jobs.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}

/// Idle poll pause between empty pops.
const IDLE_PAUSE: Duration = Duration::from_millis(500);

pub struct Worker {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    ident: usize,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("ident", &self.ident).finish()
    }
}

impl Worker {
    pub fn new(
        queue: JobQueue,
        handler: Arc<dyn JobHandler>,
        ident: usize,
    ) -> Self {
        Self {
            queue,
            handler,
            ident,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(worker = self.ident, "Queue worker started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(worker = self.ident, "Queue worker shutting down");
                    return;
                }
                result = self.tick() => {
                    match result {
                        Ok(true) => {} // worked a job, pull again immediately
                        Ok(false) => tokio::time::sleep(IDLE_PAUSE).await,
                        Err(err) => {
                            error!(worker = self.ident, "Worker tick failed: {err}");
                            tokio::time::sleep(IDLE_PAUSE).await;
                        }
                    }
                }
            }
        }
    }

    /// Work at most one job. Returns whether a job was pulled.
    async fn tick(&self) -> Result<bool> {
        let Some(job) = self.queue.pop().await? else {
            return Ok(false);
        };

        info!(
            worker = self.ident,
            job = %job.id,
            kind = job.payload.name(),
            attempt = job.attempt,
            "Running job"
        );
        match self.handler.handle(&job).await {
            Ok(()) => self.queue.ack(&job).await?,
            Err(err) => {
                error!(job = %job.id, kind = job.payload.name(), "Job failed: {err}");
                self.queue.fail(&job, &err).await?;
            }
        }
        Ok(true)
    }
}
