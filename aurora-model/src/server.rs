//! Servers, the engine-owned server config bag, and per-server grants.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::limit::UsagePolicy;
use crate::rule::Method;

/// Facts probed from the remote host, persisted at plan finish.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default,
)]
pub struct SystemFacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_release: Option<String>,
    /// Probe failure message, recorded instead of the fact set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

/// The server's semi-structured config bag. The typed fields are owned by
/// the reconciler; the flattened remainder carries per-binary installed
/// versions, per-method disabled toggles and the caddy domain table.
#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, Default,
)]
pub struct ServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemFacts>,
    /// Enabled-state of the service units the probe inspects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<BTreeMap<String, String>>,
    /// MD5 of the shipped helper script at last init.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ServerConfig {
    /// Installed version string recorded for a method's binary.
    pub fn binary_version(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(Value::as_str)
    }

    pub fn set_binary_version(&mut self, name: &str, version: &str) {
        self.extra
            .insert(name.to_string(), Value::String(version.to_string()));
    }

    /// Operators can switch individual methods off per server.
    pub fn method_disabled(&self, method: Method) -> bool {
        self.extra
            .get(&format!("{method}_disabled"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Domain table used when generating caddy reverse-proxy configs:
    /// domain name to (port number, path/protocol settings) entries.
    pub fn domains(&self) -> Option<&Value> {
        self.extra.get("domains")
    }

    /// Whether the filter-restore unit was reported enabled by the probe.
    pub fn filter_restore_enabled(&self) -> bool {
        self.services
            .as_ref()
            .and_then(|s| s.get("iptables-restore.service"))
            .map(|state| state == "enabled")
            .unwrap_or(false)
    }
}

/// A managed remote host. `(host, port)` is unique among active servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    /// Human-facing address shown in the UI, not used to connect.
    pub address: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing)]
    pub ssh_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file_id: Option<i64>,
    #[serde(default, skip_serializing)]
    pub sudo_password: Option<String>,
    #[serde(default)]
    pub config: ServerConfig,
    pub is_active: bool,
}

impl Server {
    /// Commands must be wrapped with privilege escalation for non-root
    /// transport users.
    pub fn needs_sudo(&self) -> bool {
        self.user != "root"
    }
}

/// Grants a user access to a server, carrying that user's per-server
/// traffic totals and quota policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerUser {
    pub id: i64,
    pub server_id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub download: i64,
    #[serde(default)]
    pub upload: i64,
    #[serde(default)]
    pub config: UsagePolicy,
}

/// One CPU/memory/disk sample from the periodic host probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerUsagePoint {
    pub server_id: i64,
    pub timestamp: DateTime<Utc>,
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extra_keys_round_trip() {
        let value = json!({
            "system": {"os_family": "Debian", "architecture": "x86_64"},
            "init": "d41d8cd98f00b204e9800998ecf8427e",
            "gost": "2.11.5",
            "gost_disabled": true,
        });
        let config: ServerConfig =
            serde_json::from_value(value.clone()).unwrap();
        assert_eq!(config.binary_version("gost"), Some("2.11.5"));
        assert!(config.method_disabled(Method::Gost));
        assert!(!config.method_disabled(Method::Iptables));
        assert_eq!(
            config.system.as_ref().unwrap().os_family.as_deref(),
            Some("Debian")
        );

        let encoded = serde_json::to_value(&config).unwrap();
        assert_eq!(encoded, value);
    }

    #[test]
    fn passwords_never_serialize() {
        let server = Server {
            id: 1,
            name: "hk-1".into(),
            address: "hk-1.example.com".into(),
            host: "203.0.113.7".into(),
            port: 22,
            user: "ops".into(),
            ssh_password: Some("secret".into()),
            key_file_id: None,
            sudo_password: Some("secret".into()),
            config: ServerConfig::default(),
            is_active: true,
        };
        let encoded = serde_json::to_value(&server).unwrap();
        assert!(encoded.get("ssh_password").is_none());
        assert!(encoded.get("sudo_password").is_none());
        assert!(server.needs_sudo());
    }
}
