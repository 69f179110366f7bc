//! The Redis-backed priority job broker.
//!
//! Ready jobs live in a sorted set scored priority-major / FIFO-minor, so
//! a single `ZPOPMIN` always yields the highest-priority oldest job.
//! Delayed jobs wait in a second set scored by their fire time and are
//! pumped across when due. A popped job is parked in a processing set
//! scored by its lease deadline until the handler acks it; the reaper
//! requeues expired leases, which makes handler crashes retryable.

mod job;
mod scheduler;
mod worker;

pub use job::{Job, JobPayload, JobStatus};
pub use scheduler::Scheduler;
pub use worker::{JobHandler, Worker};

use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{CoreError, Result};
use crate::stream::StreamBus;

/// Operator-triggered reconcile of a single rule.
pub const PRIORITY_RULE: u8 = 0;
/// Server-level connect/init and the periodic usage probe.
pub const PRIORITY_SERVER: u8 = 3;
/// Port/server cleanup.
pub const PRIORITY_CLEAN: u8 = 4;
/// Scheduled traffic-collection fanout.
pub const PRIORITY_TRAFFIC: u8 = 6;
/// Background housekeeping.
pub const PRIORITY_HOUSEKEEPING: u8 = 9;

/// How long a popped job may run before the reaper takes it back.
const LEASE: Duration = Duration::from_secs(15 * 60);

/// FIFO sequence span per priority level. Priorities stay exact in the
/// f64 score as long as the sequence counter fits in 40 bits.
const SEQ_SPAN: u64 = 1 << 40;

/// Compose the ready-set score: priority-major, enqueue-order-minor.
fn ready_score(priority: u8, seq: u64) -> f64 {
    (priority.min(9) as u64 * SEQ_SPAN + (seq % SEQ_SPAN)) as f64
}

#[derive(Clone)]
pub struct JobQueue {
    conn: ConnectionManager,
    bus: StreamBus,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").finish()
    }
}

const READY_KEY: &str = "aurora:queue:ready";
const SCHEDULED_KEY: &str = "aurora:queue:scheduled";
const PROCESSING_KEY: &str = "aurora:queue:processing";
const SEQ_KEY: &str = "aurora:queue:seq";

fn job_key(job_id: &str) -> String {
    format!("aurora:queue:job:{job_id}")
}

fn status_key(job_id: &str) -> String {
    format!("aurora:queue:status:{job_id}")
}

fn cancel_key(key: &str) -> String {
    format!("aurora:queue:cancel:{key}")
}

/// Terminal statuses are kept around this long for the API to read.
const STATUS_TTL_SECS: u64 = 7 * 24 * 60 * 60;

impl JobQueue {
    pub async fn connect(settings: &Settings, bus: StreamBus) -> Result<Self> {
        let client = redis::Client::open(settings.redis_url())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, bus })
    }

    pub fn bus(&self) -> &StreamBus {
        &self.bus
    }

    /// Enqueue for immediate execution. The job id is registered on the
    /// stream bus before the job becomes poppable, so a subscriber that
    /// joins right after submission never misses the stream.
    pub async fn enqueue(&self, job: Job) -> Result<Job> {
        self.bus.register_job(&job.id).await?;
        let mut conn = self.conn.clone();

        let _: () = conn
            .set(job_key(&job.id), serde_json::to_string(&job)?)
            .await?;
        let seq: u64 = conn.incr(SEQ_KEY, 1).await?;
        let _: () = conn
            .zadd(READY_KEY, &job.id, ready_score(job.priority, seq))
            .await?;

        debug!(job = %job.id, kind = job.payload.name(), priority = job.priority, "Enqueued job");
        Ok(job)
    }

    /// Enqueue after a delay. If the job carries a cancel key, a later
    /// [`JobQueue::cancel_by_key`] drops it before it fires.
    pub async fn schedule(&self, job: Job, after: Duration) -> Result<Job> {
        let mut conn = self.conn.clone();
        let eta = Utc::now().timestamp_millis() + after.as_millis() as i64;

        let _: () = conn
            .set(job_key(&job.id), serde_json::to_string(&job)?)
            .await?;
        let _: () = conn.zadd(SCHEDULED_KEY, &job.id, eta).await?;
        if let Some(key) = &job.cancel_key {
            let _: () = conn.set(cancel_key(key), &job.id).await?;
        }

        debug!(job = %job.id, kind = job.payload.name(), eta, "Scheduled job");
        Ok(job)
    }

    /// Cancel a delayed job by its key (e.g. the port id of a pending
    /// expiry cleanup). A job that already fired is not affected.
    pub async fn cancel_by_key(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let job_id: Option<String> = conn.get(cancel_key(key)).await?;
        let Some(job_id) = job_id else {
            return Ok(false);
        };

        let removed: u64 = conn.zrem(SCHEDULED_KEY, &job_id).await?;
        let _: () = conn.del(cancel_key(key)).await?;
        if removed > 0 {
            let _: () = conn.del(job_key(&job_id)).await?;
            self.write_status(&job_id, JobStatus::Cancelled).await?;
            info!(job = %job_id, key, "Cancelled scheduled job");
        }
        Ok(removed > 0)
    }

    /// Move due delayed jobs into the ready set.
    pub async fn pump_scheduled(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore(SCHEDULED_KEY, "-inf", now)
            .await?;

        let mut moved = 0;
        for job_id in due {
            let removed: u64 = conn.zrem(SCHEDULED_KEY, &job_id).await?;
            if removed == 0 {
                continue; // raced with a cancel or another pump
            }
            let raw: Option<String> = conn.get(job_key(&job_id)).await?;
            let Some(raw) = raw else { continue };
            let job: Job = serde_json::from_str(&raw)?;

            self.bus.register_job(&job.id).await?;
            let seq: u64 = conn.incr(SEQ_KEY, 1).await?;
            let _: () = conn
                .zadd(READY_KEY, &job.id, ready_score(job.priority, seq))
                .await?;
            moved += 1;
        }
        Ok(moved)
    }

    /// Pop the highest-priority ready job and take a lease on it.
    pub async fn pop(&self) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = conn.zpopmin(READY_KEY, 1).await?;
        let Some((job_id, _score)) = popped.into_iter().next() else {
            return Ok(None);
        };

        let raw: Option<String> = conn.get(job_key(&job_id)).await?;
        let Some(raw) = raw else {
            warn!(job = %job_id, "Popped job with no payload, dropping");
            return Ok(None);
        };
        let job: Job = serde_json::from_str(&raw)?;

        let deadline =
            Utc::now().timestamp_millis() + LEASE.as_millis() as i64;
        let _: () = conn.zadd(PROCESSING_KEY, &job.id, deadline).await?;
        Ok(Some(job))
    }

    /// Handler returned: release the lease and finalize.
    pub async fn ack(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zrem(PROCESSING_KEY, &job.id).await?;
        let _: () = conn.del(job_key(&job.id)).await?;
        self.write_status(&job.id, JobStatus::Succeeded).await?;
        Ok(())
    }

    /// Handler failed: retry if the policy allows, else finalize failed.
    /// Cancellation is terminal-but-not-failed.
    pub async fn fail(&self, job: &Job, err: &CoreError) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zrem(PROCESSING_KEY, &job.id).await?;

        if matches!(err, CoreError::Cancelled(_)) {
            let _: () = conn.del(job_key(&job.id)).await?;
            self.write_status(&job.id, JobStatus::Cancelled).await?;
            return Ok(());
        }

        if job.attempt < job.max_retries {
            let mut retry = job.clone();
            retry.attempt += 1;
            let _: () = conn
                .set(job_key(&retry.id), serde_json::to_string(&retry)?)
                .await?;
            let seq: u64 = conn.incr(SEQ_KEY, 1).await?;
            let _: () = conn
                .zadd(READY_KEY, &retry.id, ready_score(retry.priority, seq))
                .await?;
            info!(job = %job.id, attempt = retry.attempt, "Requeued failed job");
        } else {
            let _: () = conn.del(job_key(&job.id)).await?;
            self.write_status(&job.id, JobStatus::Failed).await?;
        }
        Ok(())
    }

    /// Requeue jobs whose lease expired (worker crash or lost handler).
    pub async fn reap_expired(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();
        let expired: Vec<String> = conn
            .zrangebyscore(PROCESSING_KEY, "-inf", now)
            .await?;

        let mut reaped = 0;
        for job_id in expired {
            let removed: u64 = conn.zrem(PROCESSING_KEY, &job_id).await?;
            if removed == 0 {
                continue;
            }
            let raw: Option<String> = conn.get(job_key(&job_id)).await?;
            let Some(raw) = raw else { continue };
            let mut job: Job = serde_json::from_str(&raw)?;

            if job.attempt < job.max_retries {
                job.attempt += 1;
                let _: () = conn
                    .set(job_key(&job.id), serde_json::to_string(&job)?)
                    .await?;
                let seq: u64 = conn.incr(SEQ_KEY, 1).await?;
                let _: () = conn
                    .zadd(READY_KEY, &job.id, ready_score(job.priority, seq))
                    .await?;
                warn!(job = %job_id, "Reaped expired lease, requeued");
            } else {
                let _: () = conn.del(job_key(&job.id)).await?;
                self.write_status(&job_id, JobStatus::Failed).await?;
                warn!(job = %job_id, "Reaped expired lease, retries exhausted");
            }
            reaped += 1;
        }
        Ok(reaped)
    }

    pub async fn status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(status_key(job_id)).await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    async fn write_status(
        &self,
        job_id: &str,
        status: JobStatus,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(
                status_key(job_id),
                serde_json::to_string(&status)?,
                STATUS_TTL_SECS,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_orders_priority_before_fifo() {
        // Lower score pops first: any priority-0 job beats any
        // priority-6 job regardless of age.
        assert!(ready_score(0, 999_999) < ready_score(6, 1));
        // Within a priority level, earlier sequence pops first.
        assert!(ready_score(3, 10) < ready_score(3, 11));
        // Housekeeping is always last.
        assert!(ready_score(6, u64::MAX % SEQ_SPAN) < ready_score(9, 0));
    }

    #[test]
    fn score_is_exact_for_realistic_sequences() {
        let a = ready_score(9, SEQ_SPAN - 1);
        let b = ready_score(9, SEQ_SPAN - 2);
        assert!(a > b, "adjacent sequence numbers must stay distinct");
    }
}
