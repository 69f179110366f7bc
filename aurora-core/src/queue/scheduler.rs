//! Periodic job sources: the scheduled-set pump, the lease reaper, and
//! the recurring engine jobs (traffic fanout, DDNS sweep, expiry scan,
//! host usage probes, housekeeping).

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};

use super::{
    Job, JobPayload, JobQueue, PRIORITY_HOUSEKEEPING, PRIORITY_SERVER,
    PRIORITY_TRAFFIC,
};
use crate::config::Settings;
use crate::error::Result;

/// How often due delayed jobs and expired leases are checked.
const PUMP_INTERVAL: Duration = Duration::from_secs(5);
const EXPIRY_SCAN_INTERVAL: Duration = Duration::from_secs(60);
const ARTIFACTS_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DAILY: Duration = Duration::from_secs(24 * 60 * 60);

pub struct Scheduler {
    queue: JobQueue,
    traffic_interval: Duration,
    ddns_interval: Duration,
    usage_interval: Duration,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish()
    }
}

impl Scheduler {
    pub fn new(queue: JobQueue, settings: &Settings) -> Self {
        Self {
            queue,
            traffic_interval: settings.traffic_interval,
            ddns_interval: settings.ddns_interval,
            usage_interval: settings.server_usage_interval,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("Job scheduler started");

        let mut pump = tokio::time::interval(PUMP_INTERVAL);
        let mut traffic = tokio::time::interval(self.traffic_interval);
        let mut ddns = tokio::time::interval(self.ddns_interval);
        let mut usage = tokio::time::interval(self.usage_interval);
        let mut expiry = tokio::time::interval(EXPIRY_SCAN_INTERVAL);
        let mut artifacts = tokio::time::interval(ARTIFACTS_SWEEP_INTERVAL);
        let mut retention = tokio::time::interval(DAILY);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Job scheduler shutting down");
                    return;
                }
                _ = pump.tick() => {
                    if let Err(err) = self.pump().await {
                        error!("Queue pump failed: {err}");
                    }
                }
                _ = traffic.tick() => {
                    self.fire(JobPayload::TrafficFanout, PRIORITY_TRAFFIC).await;
                }
                _ = ddns.tick() => {
                    self.fire(JobPayload::DdnsSweep, PRIORITY_TRAFFIC).await;
                }
                _ = usage.tick() => {
                    self.fire(JobPayload::UsageProbeFanout, PRIORITY_SERVER).await;
                }
                _ = expiry.tick() => {
                    self.fire(JobPayload::ExpiryScan, PRIORITY_TRAFFIC).await;
                }
                _ = artifacts.tick() => {
                    self.fire(JobPayload::SweepArtifacts, PRIORITY_HOUSEKEEPING).await;
                }
                _ = retention.tick() => {
                    self.fire(JobPayload::SweepStreamHistory, PRIORITY_HOUSEKEEPING).await;
                    self.fire(JobPayload::PruneServerUsage, PRIORITY_HOUSEKEEPING).await;
                }
            }
        }
    }

    async fn pump(&self) -> Result<()> {
        self.queue.pump_scheduled().await?;
        self.queue.reap_expired().await?;
        Ok(())
    }

    async fn fire(&self, payload: JobPayload, priority: u8) {
        let name = payload.name();
        if let Err(err) = self.queue.enqueue(Job::new(payload, priority)).await
        {
            error!("Failed to enqueue periodic {name}: {err}");
        }
    }
}
