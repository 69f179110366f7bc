//! Job records: small serializable payloads plus queue bookkeeping.

use aurora_model::ForwardType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Everything a worker can be asked to do. Payloads carry ids, not
/// entities; handlers re-read rows under their own snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Translate and apply one rule end to end.
    ApplyRule { rule_id: i64 },
    /// Rewrite just the filter entries for a port (DDNS follow, list,
    /// delete). `forward_type = None` means delete.
    FilterRewrite {
        server_id: i64,
        port_id: i64,
        local_port: u16,
        remote_address: String,
        remote_port: Option<u16>,
        forward_type: Option<ForwardType>,
        update_status: bool,
    },
    /// Zero the host-side counters for a port.
    ResetFilter { server_id: i64, port_num: u16 },
    /// Remove the service unit and filter entries for a port.
    CleanPort { server_id: i64, port_num: u16 },
    /// Clean every port on a server before it is dropped.
    CleanServer { server_id: i64 },
    /// Connect, probe facts and sync the helper scripts.
    ServerInit { server_id: i64 },
    /// Sample CPU/memory/disk from one server.
    ServerUsageProbe { server_id: i64 },
    /// Fan out one `ServerUsageProbe` per active server.
    UsageProbeFanout,
    /// Fan out one `CollectTraffic` per active server.
    TrafficFanout,
    /// Read and account filter counters on one server.
    CollectTraffic { server_id: i64 },
    /// Install or replace the shaping qdisc for a port.
    ApplyShaping {
        server_id: i64,
        port_num: u16,
        egress_limit: Option<u32>,
        ingress_limit: Option<u32>,
    },
    /// Re-resolve DDNS-followed rules and requeue changed ones.
    DdnsSweep,
    /// Evaluate expiry policies without waiting for a collection.
    ExpiryScan,
    /// Regenerate the worker host-inventory file.
    RegenerateInventory,
    /// Drop per-job artifact directories.
    SweepArtifacts,
    /// Drop stream history past the retention window.
    SweepStreamHistory,
    /// Prune old host usage samples.
    PruneServerUsage,
}

impl JobPayload {
    /// Short name used in logs and artifact paths.
    pub fn name(&self) -> &'static str {
        match self {
            JobPayload::ApplyRule { .. } => "apply_rule",
            JobPayload::FilterRewrite { .. } => "filter_rewrite",
            JobPayload::ResetFilter { .. } => "reset_filter",
            JobPayload::CleanPort { .. } => "clean_port",
            JobPayload::CleanServer { .. } => "clean_server",
            JobPayload::ServerInit { .. } => "server_init",
            JobPayload::ServerUsageProbe { .. } => "server_usage_probe",
            JobPayload::UsageProbeFanout => "usage_probe_fanout",
            JobPayload::TrafficFanout => "traffic_fanout",
            JobPayload::CollectTraffic { .. } => "collect_traffic",
            JobPayload::ApplyShaping { .. } => "apply_shaping",
            JobPayload::DdnsSweep => "ddns_sweep",
            JobPayload::ExpiryScan => "expiry_scan",
            JobPayload::RegenerateInventory => "regenerate_inventory",
            JobPayload::SweepArtifacts => "sweep_artifacts",
            JobPayload::SweepStreamHistory => "sweep_stream_history",
            JobPayload::PruneServerUsage => "prune_server_usage",
        }
    }

    /// The server this job must serialize against, when it touches one.
    pub fn server_id(&self) -> Option<i64> {
        match self {
            JobPayload::FilterRewrite { server_id, .. }
            | JobPayload::ResetFilter { server_id, .. }
            | JobPayload::CleanPort { server_id, .. }
            | JobPayload::CleanServer { server_id }
            | JobPayload::ServerInit { server_id }
            | JobPayload::ServerUsageProbe { server_id }
            | JobPayload::CollectTraffic { server_id }
            | JobPayload::ApplyShaping { server_id, .. } => Some(*server_id),
            _ => None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub payload: JobPayload,
    /// 0 is the highest of the ten levels.
    pub priority: u8,
    pub attempt: u32,
    pub max_retries: u32,
    /// Delayed jobs can be cancelled by this key before they fire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_key: Option<String>,
}

impl Job {
    pub fn new(payload: JobPayload, priority: u8) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            priority,
            attempt: 0,
            max_retries: 0,
            cancel_key: None,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_cancel_key(mut self, key: impl Into<String>) -> Self {
        self.cancel_key = Some(key.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip() {
        let payload = JobPayload::FilterRewrite {
            server_id: 3,
            port_id: 17,
            local_port: 10001,
            remote_address: "5.6.7.8".into(),
            remote_port: Some(443),
            forward_type: Some(ForwardType::All),
            update_status: true,
        };
        let encoded = serde_json::to_string(&payload).unwrap();
        assert!(encoded.contains("\"kind\":\"filter_rewrite\""));
        let decoded: JobPayload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn server_affinity() {
        assert_eq!(
            JobPayload::CollectTraffic { server_id: 9 }.server_id(),
            Some(9)
        );
        assert_eq!(JobPayload::TrafficFanout.server_id(), None);
    }
}
