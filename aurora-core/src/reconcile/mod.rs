//! The reconciler: turns desired rules into remote state, one serialized
//! plan per server at a time.

mod executor;

pub use executor::{
    FILTER_HELPER, ProbedFacts, StepResults, content_md5,
    extract_unit_errors, parse_probed_facts,
};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use aurora_model::{ForwardType, RuleStatus, Server};

use crate::config::Settings;
use crate::connector::{ConnectOptions, HostConnection};
use crate::db::Database;
use crate::dns::DnsResolver;
use crate::error::{CoreError, Result};
use crate::queue::{
    Job, JobHandler, JobPayload, JobQueue, PRIORITY_CLEAN,
};
use crate::storage::Storage;
use crate::stream::{StreamBus, SyncPublisher};
use crate::translate::{
    ActionPlan, FilterOp, RemoteHost, RemoteStep, plan_apply_rule,
    plan_clean_port, plan_filter, plan_server_init, plan_shaping,
    remote_host_hint,
};

/// The engine owns every moving part the job handlers need. One instance
/// is shared by all workers.
pub struct Engine {
    db: Database,
    queue: JobQueue,
    bus: StreamBus,
    storage: Storage,
    resolver: DnsResolver,
    settings: Settings,
    server_locks: DashMap<i64, Arc<Mutex<()>>>,
    cancel_flags: DashMap<String, Arc<AtomicBool>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish()
    }
}

impl Engine {
    pub fn new(
        db: Database,
        queue: JobQueue,
        bus: StreamBus,
        storage: Storage,
        settings: Settings,
    ) -> Self {
        let resolver = DnsResolver::new(settings.dns_server.clone());
        Self {
            db,
            queue,
            bus,
            storage,
            resolver,
            settings,
            server_locks: DashMap::new(),
            cancel_flags: DashMap::new(),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn bus(&self) -> &StreamBus {
        &self.bus
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn resolver(&self) -> &DnsResolver {
        &self.resolver
    }

    /// At most one plan per server. The lock is taken at plan start and
    /// held across every remote step.
    fn server_lock(&self, server_id: i64) -> Arc<Mutex<()>> {
        self.server_locks
            .entry(server_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Request cancellation of a running plan; takes effect at the next
    /// step boundary.
    pub fn cancel_job(&self, job_id: &str) {
        if let Some(flag) = self.cancel_flags.get(job_id) {
            flag.store(true, Ordering::Relaxed);
        }
    }

    async fn connect_options(
        &self,
        server: &Server,
    ) -> Result<ConnectOptions> {
        let key_path = match server.key_file_id {
            Some(file_id) => Some(
                self.db.get_file(file_id).await?.storage_path.into(),
            ),
            None => None,
        };
        Ok(ConnectOptions::for_server(
            server,
            key_path,
            self.settings.ssh_connection_timeout,
        ))
    }

    /// Run a plan against one server under its lock. Remote steps run on
    /// the blocking pool with one connection; the stopword is published
    /// on close when a job stream is attached.
    pub(crate) async fn run_plan(
        &self,
        server: &Server,
        job: Option<&Job>,
        plan: &ActionPlan,
    ) -> Result<StepResults> {
        let lock = self.server_lock(server.id);
        let _guard = lock.lock().await;

        if plan
            .steps
            .iter()
            .any(|s| matches!(s, RemoteStep::EnsureInventory))
        {
            self.regenerate_inventory().await?;
        }

        let options = self.connect_options(server).await?;
        let publisher = match job {
            Some(job) => Some(SyncPublisher::open(
                &self.settings.redis_url(),
                &self.settings.pubsub_prefix,
                &self.settings.pubsub_stopword,
                self.settings.pubsub_sleep,
                &job.id,
            )?),
            None => None,
        };

        let cancelled = match job {
            Some(job) => self
                .cancel_flags
                .entry(job.id.clone())
                .or_insert_with(|| Arc::new(AtomicBool::new(false)))
                .clone(),
            None => Arc::new(AtomicBool::new(false)),
        };

        let steps = plan.steps.clone();
        let results = tokio::task::spawn_blocking(move || {
            let mut conn = HostConnection::open(&options, publisher)?;
            let outcome = executor::execute_plan(&mut conn, &steps, &cancelled);
            let close_result = conn.close();
            let results = outcome?;
            close_result?;
            Ok::<_, CoreError>(results)
        })
        .await
        .map_err(|e| CoreError::internal(format!("plan task panicked: {e}")))?;

        if let Some(job) = job {
            self.cancel_flags.remove(&job.id);
        }

        let results = results?;
        self.persist_results(server.id, &results).await?;
        Ok(results)
    }

    /// Persist what the plan learned: reported binary versions, probed
    /// facts (at run-finish) and the init marker.
    async fn persist_results(
        &self,
        server_id: i64,
        results: &StepResults,
    ) -> Result<()> {
        if results.versions.is_empty() && results.facts.is_none() {
            return Ok(());
        }

        let mut server = self.db.get_server(server_id).await?;
        for (name, version) in &results.versions {
            server.config.set_binary_version(name, version);
        }
        if let Some(facts) = &results.facts {
            server.config.system = Some(facts.system.clone());
            server.config.services = Some(facts.services.clone());
            server.config.init = Some(content_md5(FILTER_HELPER));
        }
        self.db.update_server_config(server_id, &server.config).await
    }

    /// Apply one counter-mutating plan's capture: roll the accumulate
    /// forward for the port and zero its checkpoints so an in-flight
    /// collection pass skips instead of double-counting.
    async fn settle_counters(
        &self,
        server_id: i64,
        port_id: i64,
        port_num: u16,
        prev: Option<&aurora_model::PortUsage>,
        capture: Option<&str>,
    ) -> Result<()> {
        let observed = capture
            .map(|raw| {
                crate::traffic::parse_counters(raw)
                    .get(&port_num)
                    .copied()
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        self.db
            .apply_observation(port_id, prev, &observed, true)
            .await?;
        self.db.zero_checkpoints(port_id).await?;

        info!(
            server_id,
            port_num,
            download = observed.download,
            upload = observed.upload,
            "Rolled counters forward"
        );
        Ok(())
    }

    /// Boundary hook: after a rule row is written, enqueue its apply job
    /// and (re-)schedule the expiry cleanup when the rule carries one.
    pub async fn submit_rule(
        &self,
        rule: &aurora_model::ForwardRule,
        server_id: i64,
        port_num: u16,
    ) -> Result<Job> {
        let job = self
            .queue
            .enqueue(Job::new(
                JobPayload::ApplyRule { rule_id: rule.id },
                crate::queue::PRIORITY_RULE,
            ))
            .await?;

        let expiry_key = format!("expire:{}", rule.port_id);
        self.queue.cancel_by_key(&expiry_key).await?;
        if let Some(expire_second) = rule.config.expire_second {
            if expire_second > 0 {
                self.queue
                    .schedule(
                        Job::new(
                            JobPayload::CleanPort {
                                server_id,
                                port_num,
                            },
                            PRIORITY_CLEAN,
                        )
                        .with_cancel_key(expiry_key),
                        std::time::Duration::from_secs(
                            expire_second as u64,
                        ),
                    )
                    .await?;
            }
        }
        Ok(job)
    }

    /// Translate and apply one rule end to end.
    pub async fn apply_rule(&self, job: &Job, rule_id: i64) -> Result<()> {
        let rule = match self.db.get_rule(rule_id).await {
            Ok(rule) => rule,
            Err(CoreError::NotFound(_)) => {
                // Deleted while queued; nothing to reconcile.
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let port = self.db.get_port(rule.port_id).await?;
        let snapshot =
            self.db.load_server_snapshot(port.server_id).await?;
        let server = snapshot.server.clone();

        self.bus
            .publish(
                &job.id,
                &format!(
                    "Applying {} rule on {}:{}",
                    rule.method, server.name, port.num
                ),
            )
            .await?;
        self.db.update_rule_status(rule.id, RuleStatus::Starting).await?;

        let mut config = rule.config.clone();
        let resolved = match remote_host_hint(&config.params) {
            RemoteHost::Anywhere => None,
            RemoteHost::Literal(ip) => Some(ip),
            RemoteHost::NeedsResolve(host) => {
                Some(self.resolver.resolve(&host).await?)
            }
        };
        if let Some(ip) = &resolved {
            self.db.set_rule_remote_ip(rule.id, ip).await?;
            config.remote_ip = Some(ip.clone());
        }

        let state = snapshot
            .ports
            .iter()
            .find(|state| state.port.id == port.id)
            .ok_or_else(|| {
                CoreError::internal("port missing from its own snapshot")
            })?;
        let prev_usage = state.usage;
        let plan = plan_apply_rule(
            &snapshot,
            state,
            &config,
            resolved.as_deref(),
        )?;

        match self.run_plan(&server, Some(job), &plan).await {
            Ok(results) => {
                let ident = job.id.clone();
                self.storage
                    .write_artifact_stdout(
                        server.id,
                        &ident,
                        &results.combined_output,
                    )
                    .await?;

                // The rule may have been deleted while the plan ran; a
                // status write would resurrect nothing, but skip anyway.
                if self.db.get_rule(rule.id).await.is_ok() {
                    self.db.set_rule_runner(rule.id, &ident).await?;
                    self.db
                        .update_rule_status(rule.id, RuleStatus::Running)
                        .await?;
                }

                if plan.mutates_counters {
                    self.settle_counters(
                        server.id,
                        port.id,
                        port.num,
                        prev_usage.as_ref(),
                        results.traffic_capture.as_deref(),
                    )
                    .await?;
                }
            }
            Err(CoreError::Cancelled(reason)) => {
                return Err(CoreError::Cancelled(reason));
            }
            Err(err) => {
                let compact = compact_error(&err);
                warn!(rule = rule.id, "Rule apply failed: {compact}");
                self.db.set_rule_error(rule.id, &compact).await?;
                self.bus.publish(&job.id, &compact).await?;
                return Err(err);
            }
        }

        Ok(())
    }

    /// Rewrite just the filter entries for a port: DDNS follow, delete,
    /// or inspection.
    #[allow(clippy::too_many_arguments)]
    pub async fn filter_rewrite(
        &self,
        job: &Job,
        server_id: i64,
        port_id: i64,
        local_port: u16,
        remote_address: &str,
        remote_port: Option<u16>,
        forward_type: Option<ForwardType>,
        update_status: bool,
    ) -> Result<()> {
        let server = self.db.get_server(server_id).await?;
        let rule = self.db.get_rule_for_port(port_id).await?;
        let prev_usage = self.db.get_usage(port_id).await?;

        let op = match (forward_type, remote_port) {
            (Some(forward_type), Some(remote_port)) => {
                let remote_ip =
                    self.resolver.resolve(remote_address).await?;
                if let Some(rule) = &rule {
                    self.db.set_rule_remote_ip(rule.id, &remote_ip).await?;
                    if update_status {
                        self.db
                            .update_rule_status(rule.id, RuleStatus::Starting)
                            .await?;
                    }
                }
                FilterOp::Forward {
                    forward_type,
                    remote_ip,
                    remote_port: Some(remote_port),
                }
            }
            (None, _) => FilterOp::Delete,
            _ => FilterOp::List,
        };

        let plan = plan_filter(local_port, op);
        match self.run_plan(&server, Some(job), &plan).await {
            Ok(results) => {
                if plan.mutates_counters {
                    self.settle_counters(
                        server_id,
                        port_id,
                        local_port,
                        prev_usage.as_ref(),
                        results.traffic_capture.as_deref(),
                    )
                    .await?;
                }
                if update_status {
                    if let Some(rule) = &rule {
                        self.db
                            .update_rule_status(rule.id, RuleStatus::Running)
                            .await?;
                    }
                }
                Ok(())
            }
            Err(err) => {
                if update_status {
                    if let Some(rule) = &rule {
                        self.db
                            .set_rule_error(rule.id, &compact_error(&err))
                            .await?;
                    }
                }
                Err(err)
            }
        }
    }

    /// Zero the host-side counters for a port.
    pub async fn reset_filter(
        &self,
        job: &Job,
        server_id: i64,
        port_num: u16,
    ) -> Result<()> {
        let server = self.db.get_server(server_id).await?;
        let plan = plan_filter(port_num, FilterOp::Reset);
        self.run_plan(&server, Some(job), &plan).await?;

        if let Some(port) =
            self.db.get_port_by_num(server_id, port_num).await?
        {
            self.db.zero_checkpoints(port.id).await?;
        }
        Ok(())
    }

    /// Remove the service unit and filter entries for a port, recording
    /// the final counter delta before the entries are dropped.
    pub async fn clean_port(
        &self,
        job: &Job,
        server_id: i64,
        port_num: u16,
    ) -> Result<()> {
        let server = self.db.get_server(server_id).await?;
        let port = self.db.get_port_by_num(server_id, port_num).await?;
        let prev_usage = match &port {
            Some(port) => self.db.get_usage(port.id).await?,
            None => None,
        };

        let plan = plan_clean_port(port_num);
        let results = self.run_plan(&server, Some(job), &plan).await?;

        if let Some(port) = &port {
            self.settle_counters(
                server_id,
                port.id,
                port_num,
                prev_usage.as_ref(),
                results.traffic_capture.as_deref(),
            )
            .await?;
        }
        Ok(())
    }

    /// Clean every port on a server, drop the row, and regenerate the
    /// inventory without it.
    pub async fn clean_server(
        &self,
        job: &Job,
        server_id: i64,
    ) -> Result<()> {
        let server = self.db.get_server(server_id).await?;
        let ports = self.db.list_ports(server_id).await?;

        let mut steps = Vec::new();
        for port in &ports {
            steps.extend(plan_clean_port(port.num).steps);
        }
        if !steps.is_empty() {
            let plan = ActionPlan {
                steps,
                mutates_counters: false,
            };
            self.run_plan(&server, Some(job), &plan).await?;
        }

        self.db.delete_server(server_id).await?;
        self.regenerate_inventory().await?;
        info!(server_id, "Server cleaned and removed");
        Ok(())
    }

    /// Connect/init: regenerate inventory, sync helpers, probe facts.
    pub async fn server_init(
        &self,
        job: &Job,
        server_id: i64,
    ) -> Result<()> {
        let server = self.db.get_server(server_id).await?;
        let plan = plan_server_init();
        self.run_plan(&server, Some(job), &plan).await?;
        Ok(())
    }

    /// Install or replace the shaping qdisc for a port.
    pub async fn apply_shaping(
        &self,
        job: &Job,
        server_id: i64,
        port_num: u16,
        egress_limit: Option<u32>,
        ingress_limit: Option<u32>,
    ) -> Result<()> {
        let server = self.db.get_server(server_id).await?;
        let plan = plan_shaping(port_num, egress_limit, ingress_limit);
        self.run_plan(&server, Some(job), &plan).await?;
        Ok(())
    }

    /// Rewrite the worker host-inventory file from the active servers.
    pub async fn regenerate_inventory(&self) -> Result<()> {
        let servers = self.db.list_active_servers().await?;
        self.storage.write_inventory(&servers).await
    }

    /// Sample CPU/memory/disk from one host.
    pub async fn server_usage_probe(
        &self,
        job: &Job,
        server_id: i64,
    ) -> Result<()> {
        let server = self.db.get_server(server_id).await?;
        let options = self.connect_options(&server).await?;
        let publisher = SyncPublisher::open(
            &self.settings.redis_url(),
            &self.settings.pubsub_prefix,
            &self.settings.pubsub_stopword,
            self.settings.pubsub_sleep,
            &job.id,
        )?;

        let usage = tokio::task::spawn_blocking(move || {
            let mut conn =
                HostConnection::open(&options, Some(publisher))?;
            let usage = conn.get_combined_usage();
            let close_result = conn.close();
            let usage = usage?;
            close_result?;
            Ok::<_, CoreError>(usage)
        })
        .await
        .map_err(|e| CoreError::internal(format!("probe panicked: {e}")))??;

        self.db
            .record_server_usage(&aurora_model::ServerUsagePoint {
                server_id,
                timestamp: Utc::now(),
                cpu: usage.cpu,
                memory: usage.memory,
                disk: usage.disk,
            })
            .await
    }

    async fn prune_server_usage(&self) -> Result<()> {
        let cutoff = Utc::now() - ChronoDuration::days(30);
        let removed = self.db.prune_server_usage(cutoff).await?;
        info!(removed, "Pruned host usage history");
        Ok(())
    }
}

/// Squash an error into the short blob persisted on the rule: the first
/// line of the failure plus the message part of any journal lines.
pub fn compact_error(err: &CoreError) -> String {
    let text = err.to_string();
    let journal = extract_unit_errors(&text);
    if journal.is_empty() {
        text
    } else {
        let head = text.lines().next().unwrap_or_default();
        format!("{head}\n{journal}")
    }
}

#[async_trait]
impl JobHandler for Engine {
    async fn handle(&self, job: &Job) -> Result<()> {
        match &job.payload {
            JobPayload::ApplyRule { rule_id } => {
                self.apply_rule(job, *rule_id).await
            }
            JobPayload::FilterRewrite {
                server_id,
                port_id,
                local_port,
                remote_address,
                remote_port,
                forward_type,
                update_status,
            } => {
                self.filter_rewrite(
                    job,
                    *server_id,
                    *port_id,
                    *local_port,
                    remote_address,
                    *remote_port,
                    *forward_type,
                    *update_status,
                )
                .await
            }
            JobPayload::ResetFilter {
                server_id,
                port_num,
            } => self.reset_filter(job, *server_id, *port_num).await,
            JobPayload::CleanPort {
                server_id,
                port_num,
            } => self.clean_port(job, *server_id, *port_num).await,
            JobPayload::CleanServer { server_id } => {
                self.clean_server(job, *server_id).await
            }
            JobPayload::ServerInit { server_id } => {
                self.server_init(job, *server_id).await
            }
            JobPayload::ServerUsageProbe { server_id } => {
                self.server_usage_probe(job, *server_id).await
            }
            JobPayload::UsageProbeFanout => {
                self.usage_probe_fanout().await
            }
            JobPayload::TrafficFanout => self.traffic_fanout().await,
            JobPayload::CollectTraffic { server_id } => {
                self.collect_traffic(job, *server_id).await
            }
            JobPayload::ApplyShaping {
                server_id,
                port_num,
                egress_limit,
                ingress_limit,
            } => {
                self.apply_shaping(
                    job,
                    *server_id,
                    *port_num,
                    *egress_limit,
                    *ingress_limit,
                )
                .await
            }
            JobPayload::DdnsSweep => self.ddns_sweep().await,
            JobPayload::ExpiryScan => self.expiry_scan().await,
            JobPayload::RegenerateInventory => {
                self.regenerate_inventory().await
            }
            JobPayload::SweepArtifacts => {
                self.storage.sweep_artifacts().await.map(|_| ())
            }
            JobPayload::SweepStreamHistory => self
                .bus
                .sweep_history(self.settings.task_output_storage_days)
                .await
                .map(|_| ()),
            JobPayload::PruneServerUsage => {
                self.prune_server_usage().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_error_extracts_journal_lines() {
        let err = CoreError::remote_step(
            "aurora@10001 is not active after restart\n\
             Jul 27 10:00:01 hk-1 gost[4217]: parse error in config\n\
             Jul 27 10:00:01 hk-1 systemd[1]: aurora@10001.service: Failed",
        );
        let compact = compact_error(&err);
        assert!(compact.starts_with(
            "remote step failed: aurora@10001 is not active"
        ));
        assert!(compact.contains("parse error in config"));
        assert!(!compact.contains("Jul 27"));
    }

    #[test]
    fn compact_error_passes_plain_messages() {
        let err = CoreError::transport("connect timed out");
        assert_eq!(
            compact_error(&err),
            "transport error: connect timed out"
        );
    }
}
