//! Ports and their usage counters.

use serde::{Deserialize, Serialize};

use crate::limit::UsagePolicy;

/// Operator-owned port settings. Rate caps are kbit/s; the policy half is
/// written only by the limit enforcer when an action fires.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default,
)]
pub struct PortConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_limit: Option<u32>,
    #[serde(flatten)]
    pub policy: UsagePolicy,
}

/// A numbered listening port on a server. `(server_id, num)` is unique;
/// `external_num` is the alternative number advertised to users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub id: i64,
    pub server_id: i64,
    pub num: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_num: Option<u16>,
    #[serde(default)]
    pub config: PortConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub is_active: bool,
}

impl Port {
    /// The number shown to users: `external_num` when set, else `num`.
    pub fn display_num(&self) -> u16 {
        self.external_num.unwrap_or(self.num)
    }
}

/// Byte counters for one port. `download`/`upload` track the host's
/// current counters plus the rolled-forward accumulate; the accumulate
/// pair survives host-side counter resets; the checkpoint pair holds the
/// last raw counter observed, for reset detection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
pub struct PortUsage {
    pub port_id: i64,
    pub download: i64,
    pub upload: i64,
    pub download_accumulate: i64,
    pub upload_accumulate: i64,
    pub download_checkpoint: i64,
    pub upload_checkpoint: i64,
}

/// Grants a user access to a port; the policy mirrors the port-level
/// quota/expiry tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortUser {
    pub id: i64,
    pub port_id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub config: UsagePolicy,
}
