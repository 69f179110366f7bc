//! The DDNS watcher: periodically re-resolve the remote hostnames of
//! DNS-bound rules and requeue the ones whose address moved.

use tracing::info;

use aurora_model::{RuleParams, is_ip};

use crate::error::Result;
use crate::queue::{Job, JobPayload, PRIORITY_TRAFFIC};
use crate::reconcile::Engine;

impl Engine {
    /// One sweep over every DDNS-followed rule. Filter-NAT rules get a
    /// targeted filter rewrite; the proxy methods get a full re-apply.
    pub async fn ddns_sweep(&self) -> Result<()> {
        for entry in self.db().list_ddns_rules().await? {
            let Some(remote_address) =
                entry.rule.config.params.remote_address()
            else {
                continue;
            };
            let Some(current_ip) = entry.rule.config.remote_ip.clone()
            else {
                continue;
            };
            if is_ip(remote_address) {
                continue;
            }

            let updated_ip =
                match self.resolver().resolve(remote_address).await {
                    Ok(ip) => ip,
                    Err(_) => continue, // retried on the next sweep
                };
            if updated_ip == current_ip {
                continue;
            }

            info!(
                rule = entry.rule.id,
                remote_address,
                "DNS changed {current_ip} -> {updated_ip}"
            );
            let payload = match &entry.rule.config.params {
                RuleParams::Iptables(params) => JobPayload::FilterRewrite {
                    server_id: entry.server_id,
                    port_id: entry.rule.port_id,
                    local_port: entry.port_num,
                    remote_address: updated_ip,
                    remote_port: Some(params.remote_port),
                    forward_type: Some(params.forward_type),
                    update_status: true,
                },
                _ => JobPayload::ApplyRule {
                    rule_id: entry.rule.id,
                },
            };
            self.queue()
                .enqueue(Job::new(payload, PRIORITY_TRAFFIC))
                .await?;
        }
        Ok(())
    }
}
