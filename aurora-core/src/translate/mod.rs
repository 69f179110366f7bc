//! The rule translator: a pure function from desired state (port, rule,
//! server facts) to an [`ActionPlan`] of ordered remote steps, plus the
//! strict boundary validation of rule configs.
//!
//! DNS is the one effect the translator cannot own; callers resolve the
//! [`RemoteHost`] hint first and hand the answer back in.

pub mod methods;
pub mod reverse;

use aurora_model::{
    ForwardType, Method, Port, RuleConfig, RuleParams, Server, is_ip,
};
use serde_json::Value;

use crate::db::{PortState, ServerSnapshot};
use crate::error::{CoreError, Result};

/// The string the filter helper understands as "no remote restriction".
pub const ANYWHERE: &str = "ANYWHERE";

/// Where generated per-port config files live on the host.
pub const REMOTE_CONFIG_DIR: &str = "/usr/local/etc/aurora";

/// One remote step. Plans execute these in order; the first failure
/// fails the plan.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteStep {
    /// Regenerate the local worker host-inventory file. Idempotent.
    EnsureInventory,
    /// Install (or update) the method's binary and record its version.
    EnsureBinary { name: String, version_arg: String },
    /// Write a generated config file; skipped when the MD5 matches.
    WriteConfig {
        path: String,
        content: String,
        mode: u32,
    },
    /// Install the templated per-port service unit, enable it and
    /// start-or-restart it.
    WriteService {
        port_num: u16,
        command_line: String,
        remote_ip: String,
    },
    /// Stop, disable and remove the per-port service unit.
    RemoveService { port_num: u16 },
    /// Drive the filter helper.
    InstallFilter { port_num: u16, op: FilterOp },
    /// Install or replace the shaping qdisc for the port.
    ApplyShaping {
        port_num: u16,
        egress_kbit: Option<u32>,
        ingress_kbit: Option<u32>,
    },
    /// Gather OS facts and service states.
    ProbeFacts,
}

/// Subcommands of the on-host filter helper.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Forward {
        forward_type: ForwardType,
        remote_ip: String,
        remote_port: Option<u16>,
    },
    Delete,
    List,
    ListAll,
    Reset,
}

impl FilterOp {
    /// Render the helper's argument string for a local port.
    pub fn render_args(&self, port_num: u16) -> String {
        match self {
            FilterOp::Forward {
                forward_type,
                remote_ip,
                remote_port,
            } => match remote_port {
                Some(remote_port) => format!(
                    "-t={} forward {port_num} {remote_ip} {remote_port}",
                    forward_type.as_str()
                ),
                None => format!(
                    "-t={} forward {port_num} {remote_ip}",
                    forward_type.as_str()
                ),
            },
            FilterOp::Delete => format!("delete {port_num}"),
            FilterOp::List => format!("list {port_num}"),
            FilterOp::ListAll => "list_all".to_string(),
            FilterOp::Reset => format!("reset {port_num}"),
        }
    }
}

/// An ordered list of remote steps for one plan run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActionPlan {
    pub steps: Vec<RemoteStep>,
    /// Whether this plan mutates filter counters, i.e. whether the
    /// post-plan usage read must roll the accumulate forward.
    pub mutates_counters: bool,
}

/// What the method dials out to, before resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteHost {
    /// No remote restriction; accounting only.
    Anywhere,
    /// Already an address literal, usable verbatim.
    Literal(String),
    /// A DNS name the caller must resolve first.
    NeedsResolve(String),
}

impl RemoteHost {
    fn from_address(address: &str) -> Self {
        if is_ip(address) {
            RemoteHost::Literal(address.to_string())
        } else {
            RemoteHost::NeedsResolve(address.to_string())
        }
    }
}

/// The remote endpoint a rule's filter/accounting entries should be
/// tagged with. gost walks its chain and serve nodes; the DNS-followed
/// methods hand back their remote address; everything else is
/// unrestricted.
pub fn remote_host_hint(params: &RuleParams) -> RemoteHost {
    match params {
        RuleParams::Iptables(p) => RemoteHost::from_address(&p.remote_address),
        RuleParams::Brook(p) => p
            .remote_address
            .as_deref()
            .map(RemoteHost::from_address)
            .unwrap_or(RemoteHost::Anywhere),
        RuleParams::TinyPortMapper(p) => {
            RemoteHost::from_address(&p.remote_address)
        }
        RuleParams::Gost(p) => methods::gost_remote_host(p),
        _ => RemoteHost::Anywhere,
    }
}

/// Strict boundary validation: decode the submitted config against the
/// method schema, enforce the closed sets and the port-ownership rules.
/// Rejected configs never reach the reconciler.
pub fn validate_rule(
    server: &Server,
    port: &Port,
    method: Method,
    raw: &Value,
) -> Result<RuleConfig> {
    if server.config.method_disabled(method) {
        return Err(CoreError::validation(format!(
            "method {method} is disabled on server {}",
            server.name
        )));
    }

    let config = RuleConfig::decode(method, raw)
        .map_err(|e| CoreError::validation(e.to_string()))?;

    match &config.params {
        RuleParams::Gost(params) => {
            params
                .check_serve_nodes(port.num, port.external_num)
                .map_err(|e| CoreError::validation(e.to_string()))?;
        }
        RuleParams::Iptables(_) => {
            if let Some(remote_ip) = &config.remote_ip {
                if !is_ip(remote_ip) {
                    return Err(CoreError::validation(format!(
                        "Not a valid ip address: {remote_ip}"
                    )));
                }
            }
        }
        RuleParams::Brook(params) => {
            use aurora_model::BrookCommand;
            match params.command {
                BrookCommand::Relay
                | BrookCommand::Client
                | BrookCommand::Wsclient => {
                    if params.remote_address.is_none()
                        || params.remote_port.is_none()
                    {
                        return Err(CoreError::validation(format!(
                            "brook {:?} needs remote_address and remote_port",
                            params.command
                        )));
                    }
                }
                BrookCommand::Server | BrookCommand::Wsserver => {
                    if params.password.is_none() {
                        return Err(CoreError::validation(
                            "brook server needs a password",
                        ));
                    }
                }
            }
        }
        _ => {}
    }

    if let Some(tls) = &config.tls_settings {
        if !tls.path.starts_with('/') {
            return Err(CoreError::validation(format!(
                "tls path must be absolute: {}",
                tls.path
            )));
        }
    }

    Ok(config)
}

/// Build the full plan applying a rule to its port.
///
/// `resolved_ip` is the answer for this rule's [`remote_host_hint`],
/// already cached into `rule.config.remote_ip` by the caller.
pub fn plan_apply_rule(
    snapshot: &ServerSnapshot,
    state: &PortState,
    config: &RuleConfig,
    resolved_ip: Option<&str>,
) -> Result<ActionPlan> {
    let port = &state.port;
    let method = config.params.method();
    let spec = methods::spec(method);

    let remote_ip = resolved_ip.unwrap_or(ANYWHERE).to_string();
    let mut steps = vec![RemoteStep::EnsureInventory];

    if spec.has_service_unit
        && snapshot.server.config.binary_version(spec.binary).is_none()
    {
        steps.push(RemoteStep::EnsureBinary {
            name: spec.binary.to_string(),
            version_arg: spec.version_arg.to_string(),
        });
    }

    if let Some(content) =
        methods::config_content(snapshot, state, config)?
    {
        steps.push(RemoteStep::WriteConfig {
            path: format!("{REMOTE_CONFIG_DIR}/{}", port.num),
            content,
            mode: 0o644,
        });
    }

    if let Some(command_line) =
        methods::command_line(state, config, resolved_ip)?
    {
        steps.push(RemoteStep::WriteService {
            port_num: port.num,
            command_line,
            remote_ip: remote_ip.clone(),
        });
    }

    let mut mutates_counters = false;
    if spec.traffic_meter {
        let (forward_type, remote_port) = match &config.params {
            RuleParams::Iptables(p) => {
                (p.forward_type, Some(p.remote_port))
            }
            _ => (ForwardType::All, None),
        };
        // Capture the outgoing entries' counters before replacing them,
        // so the post-plan accumulate roll-forward sees the last delta.
        steps.push(RemoteStep::InstallFilter {
            port_num: port.num,
            op: FilterOp::List,
        });
        steps.push(RemoteStep::InstallFilter {
            port_num: port.num,
            op: FilterOp::Forward {
                forward_type,
                remote_ip,
                remote_port,
            },
        });
        mutates_counters = true;
    }

    if port.config.egress_limit.is_some()
        || port.config.ingress_limit.is_some()
    {
        steps.push(RemoteStep::ApplyShaping {
            port_num: port.num,
            egress_kbit: port.config.egress_limit,
            ingress_kbit: port.config.ingress_limit,
        });
    }

    Ok(ActionPlan {
        steps,
        mutates_counters,
    })
}

/// Remove the service unit and all filter entries for a port. The final
/// counter read happens before the delete so the last delta is never
/// lost.
pub fn plan_clean_port(port_num: u16) -> ActionPlan {
    ActionPlan {
        steps: vec![
            RemoteStep::RemoveService { port_num },
            RemoteStep::InstallFilter {
                port_num,
                op: FilterOp::List,
            },
            RemoteStep::InstallFilter {
                port_num,
                op: FilterOp::Delete,
            },
        ],
        mutates_counters: true,
    }
}

/// Rewrite just the filter entries (DDNS follow, delete, inspect).
pub fn plan_filter(port_num: u16, op: FilterOp) -> ActionPlan {
    let mutates_counters = matches!(
        op,
        FilterOp::Forward { .. } | FilterOp::Delete | FilterOp::Reset
    );
    ActionPlan {
        steps: vec![RemoteStep::InstallFilter { port_num, op }],
        mutates_counters,
    }
}

/// Apply (or clear) the shaping qdisc for a port.
pub fn plan_shaping(
    port_num: u16,
    egress_kbit: Option<u32>,
    ingress_kbit: Option<u32>,
) -> ActionPlan {
    ActionPlan {
        steps: vec![RemoteStep::ApplyShaping {
            port_num,
            egress_kbit,
            ingress_kbit,
        }],
        mutates_counters: false,
    }
}

/// Connect/init: refresh the inventory and probe facts.
pub fn plan_server_init() -> ActionPlan {
    ActionPlan {
        steps: vec![RemoteStep::EnsureInventory, RemoteStep::ProbeFacts],
        mutates_counters: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aurora_model::{PortConfig, ServerConfig};
    use serde_json::json;

    fn test_server() -> Server {
        Server {
            id: 1,
            name: "hk-1".into(),
            address: "hk-1.example.com".into(),
            host: "203.0.113.7".into(),
            port: 22,
            user: "root".into(),
            ssh_password: None,
            key_file_id: None,
            sudo_password: None,
            config: ServerConfig::default(),
            is_active: true,
        }
    }

    fn test_port(num: u16) -> Port {
        Port {
            id: 11,
            server_id: 1,
            num,
            external_num: None,
            config: PortConfig::default(),
            notes: None,
            is_active: true,
        }
    }

    fn snapshot_with(port: Port, rule: Option<aurora_model::ForwardRule>) -> ServerSnapshot {
        ServerSnapshot {
            server: test_server(),
            ports: vec![PortState {
                port,
                rule,
                usage: None,
                allowed_user_ids: vec![],
            }],
        }
    }

    #[test]
    fn rejects_gost_serve_node_on_foreign_port() {
        let err = validate_rule(
            &test_server(),
            &test_port(10001),
            Method::Gost,
            &json!({"ServeNodes": [":99"]}),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Port not allowed, ServeNode: :99"
        );
    }

    #[test]
    fn rejects_disabled_method() {
        let mut server = test_server();
        server
            .config
            .extra
            .insert("gost_disabled".into(), json!(true));
        let err = validate_rule(
            &server,
            &test_port(10001),
            Method::Gost,
            &json!({"ServeNodes": [":10001"]}),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn rejects_non_literal_remote_ip() {
        let err = validate_rule(
            &test_server(),
            &test_port(10001),
            Method::Iptables,
            &json!({
                "remote_address": "example.com",
                "remote_port": 443,
                "remote_ip": "still-a-name.example",
            }),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Not a valid ip address: still-a-name.example"
        );
    }

    #[test]
    fn iptables_plan_tags_filter_with_resolved_ip() {
        let port = test_port(10001);
        let config = RuleConfig::decode(
            Method::Iptables,
            &json!({
                "type": "TCP",
                "remote_address": "example.com",
                "remote_port": 443,
            }),
        )
        .unwrap();
        let snapshot = snapshot_with(port, None);
        let state = &snapshot.ports[0];

        let plan =
            plan_apply_rule(&snapshot, state, &config, Some("93.184.216.34"))
                .unwrap();
        assert!(plan.mutates_counters);
        assert!(plan.steps.contains(&RemoteStep::InstallFilter {
            port_num: 10001,
            op: FilterOp::Forward {
                forward_type: ForwardType::Tcp,
                remote_ip: "93.184.216.34".into(),
                remote_port: Some(443),
            },
        }));
        // iptables is a kernel method; no service unit is written.
        assert!(!plan
            .steps
            .iter()
            .any(|s| matches!(s, RemoteStep::WriteService { .. })));

        // The old counters are read before the entries are replaced.
        let list_pos = plan
            .steps
            .iter()
            .position(|s| {
                matches!(
                    s,
                    RemoteStep::InstallFilter { op: FilterOp::List, .. }
                )
            })
            .unwrap();
        let forward_pos = plan
            .steps
            .iter()
            .position(|s| {
                matches!(
                    s,
                    RemoteStep::InstallFilter {
                        op: FilterOp::Forward { .. },
                        ..
                    }
                )
            })
            .unwrap();
        assert!(list_pos < forward_pos);
    }

    #[test]
    fn remote_hint_prefers_literals() {
        let params = RuleParams::decode(
            Method::Iptables,
            json!({"remote_address": "1.2.3.4", "remote_port": 443}),
        )
        .unwrap();
        assert_eq!(
            remote_host_hint(&params),
            RemoteHost::Literal("1.2.3.4".into())
        );

        let params = RuleParams::decode(
            Method::Iptables,
            json!({"remote_address": "example.com", "remote_port": 443}),
        )
        .unwrap();
        assert_eq!(
            remote_host_hint(&params),
            RemoteHost::NeedsResolve("example.com".into())
        );
    }

    #[test]
    fn filter_args_render() {
        let op = FilterOp::Forward {
            forward_type: ForwardType::All,
            remote_ip: "5.6.7.8".into(),
            remote_port: Some(443),
        };
        assert_eq!(op.render_args(10001), "-t=ALL forward 10001 5.6.7.8 443");
        assert_eq!(FilterOp::Delete.render_args(10001), "delete 10001");
        assert_eq!(FilterOp::Reset.render_args(10001), "reset 10001");
        assert_eq!(FilterOp::ListAll.render_args(10001), "list_all");
    }

    #[test]
    fn clean_plan_reads_counters_before_delete() {
        let plan = plan_clean_port(10001);
        let list_pos = plan
            .steps
            .iter()
            .position(|s| {
                matches!(
                    s,
                    RemoteStep::InstallFilter { op: FilterOp::List, .. }
                )
            })
            .unwrap();
        let delete_pos = plan
            .steps
            .iter()
            .position(|s| {
                matches!(
                    s,
                    RemoteStep::InstallFilter { op: FilterOp::Delete, .. }
                )
            })
            .unwrap();
        assert!(list_pos < delete_pos);
        assert!(plan.mutates_counters);
    }
}
