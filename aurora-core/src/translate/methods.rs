//! The per-method table: binaries, version probes, command-line builders
//! and config-file generators.

use aurora_model::{
    BrookCommand, GostParams, Method, RuleParams, TlsSettings, WstunnelMode,
    net::bracketed,
};
use serde_json::json;
use url::Url;

use super::{REMOTE_CONFIG_DIR, RemoteHost};
use crate::db::{PortState, ServerSnapshot};
use crate::error::{CoreError, Result};

/// Static facts about one forwarding method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    /// Key under which the installed version is recorded in
    /// `server.config`, and the binary's base name.
    pub binary: &'static str,
    /// Argument that makes the binary print its version.
    pub version_arg: &'static str,
    /// Whether accounting filter entries are installed for the port.
    pub traffic_meter: bool,
    /// Kernel methods have no per-port service unit.
    pub has_service_unit: bool,
}

pub fn spec(method: Method) -> MethodSpec {
    match method {
        Method::Iptables => MethodSpec {
            binary: "iptables",
            version_arg: "--version",
            traffic_meter: true,
            has_service_unit: false,
        },
        Method::Gost => MethodSpec {
            binary: "gost",
            version_arg: "-V",
            traffic_meter: true,
            has_service_unit: true,
        },
        Method::V2ray => MethodSpec {
            binary: "v2ray",
            version_arg: "-version",
            traffic_meter: true,
            has_service_unit: true,
        },
        Method::Brook => MethodSpec {
            binary: "brook",
            version_arg: "-v",
            traffic_meter: true,
            has_service_unit: true,
        },
        Method::Socat => MethodSpec {
            binary: "socat",
            version_arg: "-V",
            traffic_meter: true,
            has_service_unit: true,
        },
        Method::Ehco => MethodSpec {
            binary: "ehco",
            version_arg: "-v",
            traffic_meter: true,
            has_service_unit: true,
        },
        Method::Wstunnel => MethodSpec {
            binary: "wstunnel",
            version_arg: "-V",
            traffic_meter: true,
            has_service_unit: true,
        },
        Method::Shadowsocks => MethodSpec {
            binary: "shadowsocks",
            version_arg: "-v",
            traffic_meter: true,
            has_service_unit: true,
        },
        Method::TinyPortMapper => MethodSpec {
            binary: "tiny_port_mapper",
            version_arg: "-h",
            traffic_meter: true,
            has_service_unit: true,
        },
        Method::Iperf => MethodSpec {
            binary: "iperf",
            version_arg: "-version",
            traffic_meter: true,
            has_service_unit: true,
        },
        Method::Realm => MethodSpec {
            binary: "realm",
            version_arg: "--version",
            traffic_meter: true,
            has_service_unit: true,
        },
        Method::Haproxy => MethodSpec {
            binary: "haproxy",
            version_arg: "-v",
            traffic_meter: true,
            has_service_unit: true,
        },
        Method::Caddy => MethodSpec {
            binary: "caddy",
            version_arg: "version",
            traffic_meter: false,
            has_service_unit: true,
        },
        Method::NodeExporter => MethodSpec {
            binary: "node_exporter",
            version_arg: "--version",
            traffic_meter: true,
            has_service_unit: true,
        },
    }
}

/// The `ExecStart` command line for the port's service unit, or `None`
/// for kernel methods.
pub fn command_line(
    state: &PortState,
    config: &aurora_model::RuleConfig,
    resolved_ip: Option<&str>,
) -> Result<Option<String>> {
    let num = state.port.num;
    let command = match &config.params {
        RuleParams::Iptables(_) => return Ok(None),
        RuleParams::Gost(_) => {
            format!("/usr/local/bin/gost -C {REMOTE_CONFIG_DIR}/{num}")
        }
        RuleParams::V2ray(_) => {
            format!("/usr/local/bin/v2ray -config {REMOTE_CONFIG_DIR}/{num}")
        }
        RuleParams::Haproxy(_) => {
            format!("/usr/sbin/haproxy -f {REMOTE_CONFIG_DIR}/{num}")
        }
        RuleParams::Caddy(_) => format!(
            "/usr/local/bin/caddy run --config {REMOTE_CONFIG_DIR}/{num} --adapter caddyfile"
        ),
        RuleParams::Iperf(_) => format!("/usr/bin/iperf3 -s -p {num}"),
        RuleParams::NodeExporter(_) => format!(
            "/usr/local/bin/node_exporter --web.listen-address=:{num} --collector.iptables"
        ),
        RuleParams::Shadowsocks(p) => {
            if p.encryption.is_aead() {
                format!(
                    "/usr/local/bin/shadowsocks_go2 -s 0.0.0.0:{num} -cipher {} -password {}{}",
                    p.encryption.as_str(),
                    p.password,
                    if p.udp { " -udp" } else { "" },
                )
            } else {
                format!(
                    "/usr/local/bin/shadowsocks_go -p {num} -m {} -k {}{}",
                    p.encryption.as_str(),
                    p.password,
                    if p.udp { " -u" } else { "" },
                )
            }
        }
        RuleParams::Ehco(p) => {
            let remote = format!(
                "{}{}:{}",
                p.transport_type.url_prefix(),
                bracketed(&p.remote_address),
                p.remote_port
            );
            format!(
                "/usr/local/bin/ehco -l :{num} --lt {} -r {remote} -ur {remote} --tt {}",
                p.listen_type.as_str(),
                p.transport_type.as_str(),
            )
        }
        RuleParams::Wstunnel(p) => match p.client_type {
            WstunnelMode::Client => {
                let remote_address =
                    p.remote_address.as_deref().ok_or_else(|| {
                        CoreError::validation(
                            "wstunnel client needs remote_address",
                        )
                    })?;
                let remote_port = p.remote_port.ok_or_else(|| {
                    CoreError::validation(
                        "wstunnel client needs remote_port",
                    )
                })?;
                format!(
                    "/usr/local/bin/wstunnel {}-L 0.0.0.0:{num}:127.0.0.1:{} {}://{remote_address}:{remote_port}",
                    if p.forward_type == aurora_model::ForwardType::Udp {
                        "-u "
                    } else {
                        ""
                    },
                    p.proxy_port,
                    p.protocol.as_str(),
                )
            }
            WstunnelMode::Server => format!(
                "/usr/local/bin/wstunnel --server {}://0.0.0.0:{num} -r 127.0.0.1:{}",
                p.protocol.as_str(),
                p.proxy_port,
            ),
        },
        RuleParams::Brook(p) => {
            let remote_ip = resolved_ip
                .or(p.remote_address.as_deref())
                .map(bracketed)
                .unwrap_or_default();
            let args = match p.command {
                BrookCommand::Relay => format!(
                    "-f :{num} -t {remote_ip}:{}",
                    p.remote_port.unwrap_or_default()
                ),
                BrookCommand::Server | BrookCommand::Wsserver => format!(
                    "-l :{num} -p {}",
                    p.password.clone().unwrap_or_default()
                ),
                BrookCommand::Client => format!(
                    "--socks5 127.0.0.1:{num} -s {remote_ip}:{} -p {}",
                    p.remote_port.unwrap_or_default(),
                    p.password.clone().unwrap_or_default(),
                ),
                BrookCommand::Wsclient => format!(
                    "--socks5 127.0.0.1:{num} --wsserver ws://{remote_ip}:{} -p {}",
                    p.remote_port.unwrap_or_default(),
                    p.password.clone().unwrap_or_default(),
                ),
            };
            let command = match p.command {
                BrookCommand::Relay => "relay",
                BrookCommand::Server => "server",
                BrookCommand::Wsserver => "wsserver",
                BrookCommand::Client => "client",
                BrookCommand::Wsclient => "wsclient",
            };
            format!("/usr/local/bin/brook {command} {args}")
        }
        RuleParams::Socat(p) => {
            let remote = bracketed(&p.remote_address);
            let mut parts = Vec::new();
            if p.forward_type.tcp() {
                parts.push(format!(
                    "socat TCP6-LISTEN:{num},fork,reuseaddr TCP:{remote}:{}",
                    p.remote_port
                ));
            }
            if p.forward_type.udp() {
                parts.push(format!(
                    "socat -T 120 UDP6-LISTEN:{num},fork,reuseaddr UDP:{remote}:{}",
                    p.remote_port
                ));
            }
            format!("/bin/sh -c \"{}\"", parts.join(" & "))
        }
        RuleParams::TinyPortMapper(p) => {
            let remote_ip = bracketed(
                resolved_ip.unwrap_or(p.remote_address.as_str()),
            );
            format!(
                "/usr/local/bin/tiny_port_mapper --log-level 3 --disable-color -l [::]:{num} -r {remote_ip}:{}{}{}",
                p.remote_port,
                if p.forward_type.tcp() { " -t" } else { "" },
                if p.forward_type.udp() { " -u" } else { "" },
            )
        }
        RuleParams::Realm(p) => format!(
            "/usr/local/bin/realm -l [::]:{num} -u -r {}:{} {}--tcp-timeout 0 --udp-timeout 120",
            bracketed(&p.remote_address),
            p.remote_port,
            match p.command.transport_arg() {
                "" => String::new(),
                arg => format!("{arg} "),
            },
        ),
    };
    Ok(Some(command))
}

/// Generated config-file content for the methods that take one.
pub fn config_content(
    snapshot: &ServerSnapshot,
    state: &PortState,
    config: &aurora_model::RuleConfig,
) -> Result<Option<String>> {
    let content = match &config.params {
        RuleParams::Gost(p) => {
            let value = json!({
                "Retries": p.retries,
                "ServeNodes": p.effective_serve_nodes(
                    state.port.num,
                    state.port.external_num,
                ),
                "ChainNodes": p.chain_nodes,
            });
            Some(serde_json::to_string_pretty(&value)?)
        }
        RuleParams::V2ray(p) => {
            let value = json!({
                "inbounds": p.inbounds,
                "outbounds": p.outbounds,
                "routing": p.routing,
                "dns": p.dns,
            });
            Some(serde_json::to_string_pretty(&value)?)
        }
        RuleParams::Haproxy(p) => {
            Some(haproxy_config(state.port.num, p))
        }
        RuleParams::Caddy(_) => Some(caddy_config(snapshot, state)),
        _ => None,
    };
    Ok(content)
}

fn haproxy_config(
    port_num: u16,
    params: &aurora_model::HaproxyParams,
) -> String {
    let mut config = format!(
        r#"global
    ulimit-n 51200
defaults
    log global
    retries 1
    option redispatch
    mode {mode}
    option dontlognull
        timeout connect 5000
        timeout client 95000
        timeout server 95000

frontend {port_num}-in
    bind *:{port_num}
    mode {mode}
    default_backend {port_num}-out

backend {port_num}-out
    mode {mode}
    balance {balance}
"#,
        mode = params.mode,
        balance = params.balance_mode,
    );
    for (idx, node) in params.backend_nodes.iter().enumerate() {
        config.push_str(&format!(
            "    server server{idx} {node} check inter 10000 maxconn {}{}\n",
            params.maxconn,
            params
                .send_proxy
                .as_deref()
                .map(|sp| format!(" {sp}"))
                .unwrap_or_default(),
        ));
    }
    config
}

/// Caddyfile for a caddy-method port: one site per domain, reverse
/// proxying the sibling ports whose rules point at this port and carry
/// TLS settings.
fn caddy_config(snapshot: &ServerSnapshot, state: &PortState) -> String {
    let mut sites: Vec<(String, Vec<(u16, TlsSettings)>)> = Vec::new();
    for sibling in &snapshot.ports {
        let Some(rule) = &sibling.rule else { continue };
        if rule.config.reverse_proxy != Some(state.port.id) {
            continue;
        }
        let Some(tls) = &rule.config.tls_settings else { continue };
        if !tls.path.starts_with('/') {
            continue;
        }
        let idx = match sites
            .iter()
            .position(|(name, _)| name == &tls.domain)
        {
            Some(idx) => idx,
            None => {
                sites.push((tls.domain.clone(), Vec::new()));
                sites.len() - 1
            }
        };
        sites[idx].1.push((sibling.port.num, tls.clone()));
    }

    let mut config = String::from(
        "localhost {\n  respond \"Hola, Aurora Panel!\"\n}\n",
    );
    for (domain, entries) in sites {
        config.push_str(&format!("{domain} {{\n"));
        for (num, tls) in entries {
            match tls.protocol.as_str() {
                "ws" => config.push_str(&format!(
                    concat!(
                        "  @{num} {{\n",
                        "    path {path}\n",
                        "    header Connection *Upgrade*\n",
                        "    header Upgrade websocket\n",
                        "  }}\n",
                        "  reverse_proxy @{num} localhost:{num} {{\n",
                        "    transport http {{\n",
                        "      keepalive off\n",
                        "    }}\n",
                        "  }}\n",
                    ),
                    num = num,
                    path = tls.path,
                )),
                "h2" => config.push_str(&format!(
                    concat!(
                        "  reverse_proxy {path} localhost:{num} {{\n",
                        "    transport http {{\n",
                        "      keepalive off\n",
                        "      versions h2c\n",
                        "    }}\n",
                        "  }}\n",
                    ),
                    num = num,
                    path = tls.path,
                )),
                other => {
                    tracing::warn!(
                        "Unknown caddy protocol {other}, skipping port {num}"
                    );
                }
            }
        }
        config.push_str("}\n");
    }
    config
}

/// Where a gost rule dials out: the first chain node's host, else the
/// first tcp serve node's target, else unrestricted.
pub fn gost_remote_host(params: &GostParams) -> RemoteHost {
    if let Some(first_chain) = params.chain_nodes.first() {
        let host = Url::parse(first_chain)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string));
        return match host {
            None => RemoteHost::Literal("127.0.0.1".to_string()),
            Some(host) if host.is_empty() => {
                RemoteHost::Literal("127.0.0.1".to_string())
            }
            Some(host) => RemoteHost::from_address(&host),
        };
    }

    if let Some(tcp_node) = params
        .serve_nodes
        .iter()
        .find(|node| node.starts_with("tcp"))
    {
        if let Ok(url) = Url::parse(tcp_node) {
            let path = url.path();
            if path.len() > 1 {
                let target = &path[1..];
                let host = target
                    .rsplit_once(':')
                    .map(|(host, _)| host)
                    .unwrap_or(target);
                if !host.is_empty() {
                    return RemoteHost::from_address(host);
                }
            }
        }
    }

    RemoteHost::Anywhere
}

/// Name of the templated per-port service unit.
pub fn service_unit_name(port_num: u16) -> String {
    format!("aurora@{port_num}.service")
}

#[cfg(test)]
mod tests {
    use super::*;
    use aurora_model::{
        Method, Port, PortConfig, RuleConfig, Server, ServerConfig,
    };
    use serde_json::json;

    fn state_for(num: u16, external: Option<u16>) -> PortState {
        PortState {
            port: Port {
                id: 11,
                server_id: 1,
                num,
                external_num: external,
                config: PortConfig::default(),
                notes: None,
                is_active: true,
            },
            rule: None,
            usage: None,
            allowed_user_ids: vec![],
        }
    }

    fn snapshot(ports: Vec<PortState>) -> ServerSnapshot {
        ServerSnapshot {
            server: Server {
                id: 1,
                name: "hk-1".into(),
                address: "hk-1".into(),
                host: "203.0.113.7".into(),
                port: 22,
                user: "root".into(),
                ssh_password: None,
                key_file_id: None,
                sudo_password: None,
                config: ServerConfig::default(),
                is_active: true,
            },
            ports,
        }
    }

    fn decode(method: Method, value: serde_json::Value) -> RuleConfig {
        RuleConfig::decode(method, &value).unwrap()
    }

    #[test]
    fn ehco_command_wraps_transports() {
        let config = decode(
            Method::Ehco,
            json!({
                "listen_type": "raw",
                "transport_type": "mwss",
                "remote_address": "example.com",
                "remote_port": 443,
            }),
        );
        let cmd = command_line(&state_for(10001, None), &config, None)
            .unwrap()
            .unwrap();
        assert_eq!(
            cmd,
            "/usr/local/bin/ehco -l :10001 --lt raw -r wss://example.com:443 -ur wss://example.com:443 --tt mwss"
        );
    }

    #[test]
    fn ehco_brackets_v6_remotes() {
        let config = decode(
            Method::Ehco,
            json!({
                "transport_type": "raw",
                "remote_address": "2001:db8::1",
                "remote_port": 443,
            }),
        );
        let cmd = command_line(&state_for(10001, None), &config, None)
            .unwrap()
            .unwrap();
        assert!(cmd.contains("-r [2001:db8::1]:443"));
    }

    #[test]
    fn shadowsocks_picks_binary_by_cipher() {
        let aead = decode(
            Method::Shadowsocks,
            json!({
                "encryption": "AEAD_AES_256_GCM",
                "password": "hunter2",
                "udp": true,
            }),
        );
        let cmd = command_line(&state_for(10001, None), &aead, None)
            .unwrap()
            .unwrap();
        assert_eq!(
            cmd,
            "/usr/local/bin/shadowsocks_go2 -s 0.0.0.0:10001 -cipher AEAD_AES_256_GCM -password hunter2 -udp"
        );

        let stream = decode(
            Method::Shadowsocks,
            json!({"encryption": "aes-256-cfb", "password": "hunter2"}),
        );
        let cmd = command_line(&state_for(10001, None), &stream, None)
            .unwrap()
            .unwrap();
        assert_eq!(
            cmd,
            "/usr/local/bin/shadowsocks_go -p 10001 -m aes-256-cfb -k hunter2"
        );
    }

    #[test]
    fn socat_splits_protocols() {
        let config = decode(
            Method::Socat,
            json!({
                "type": "ALL",
                "remote_address": "5.6.7.8",
                "remote_port": 443,
            }),
        );
        let cmd = command_line(&state_for(10001, None), &config, None)
            .unwrap()
            .unwrap();
        assert_eq!(
            cmd,
            "/bin/sh -c \"socat TCP6-LISTEN:10001,fork,reuseaddr TCP:5.6.7.8:443 & socat -T 120 UDP6-LISTEN:10001,fork,reuseaddr UDP:5.6.7.8:443\""
        );
    }

    #[test]
    fn brook_relay_uses_resolved_ip() {
        let config = decode(
            Method::Brook,
            json!({
                "command": "relay",
                "remote_address": "example.com",
                "remote_port": 443,
            }),
        );
        let cmd = command_line(
            &state_for(10001, None),
            &config,
            Some("93.184.216.34"),
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            cmd,
            "/usr/local/bin/brook relay -f :10001 -t 93.184.216.34:443"
        );
    }

    #[test]
    fn tiny_port_mapper_flags_by_type() {
        let config = decode(
            Method::TinyPortMapper,
            json!({
                "type": "TCP",
                "remote_address": "5.6.7.8",
                "remote_port": 443,
            }),
        );
        let cmd = command_line(&state_for(10001, None), &config, None)
            .unwrap()
            .unwrap();
        assert!(cmd.ends_with("-r 5.6.7.8:443 -t"));
        assert!(!cmd.contains("-u"));
    }

    #[test]
    fn realm_includes_ws_transport_args() {
        let config = decode(
            Method::Realm,
            json!({
                "command": "ws-in",
                "remote_address": "5.6.7.8",
                "remote_port": 443,
            }),
        );
        let cmd = command_line(&state_for(10001, None), &config, None)
            .unwrap()
            .unwrap();
        assert_eq!(
            cmd,
            "/usr/local/bin/realm -l [::]:10001 -u -r 5.6.7.8:443 -b 'ws;host=abc;path=/' --tcp-timeout 0 --udp-timeout 120"
        );
    }

    #[test]
    fn gost_config_rewrites_external_nodes() {
        let config = decode(
            Method::Gost,
            json!({"ServeNodes": [":20001"], "Retries": 2}),
        );
        let state = state_for(10001, Some(20001));
        let snapshot = snapshot(vec![state]);
        let content =
            config_content(&snapshot, &snapshot.ports[0], &config)
                .unwrap()
                .unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["ServeNodes"], json!([":10001"]));
        assert_eq!(parsed["Retries"], 2);
    }

    #[test]
    fn gost_remote_host_walks_chain_nodes() {
        let params: GostParams = serde_json::from_value(json!({
            "ChainNodes": ["relay+tls://user@example.com:443"],
        }))
        .unwrap();
        assert_eq!(
            gost_remote_host(&params),
            RemoteHost::NeedsResolve("example.com".into())
        );

        let params: GostParams = serde_json::from_value(json!({
            "ServeNodes": ["tcp://:10001/1.2.3.4:443"],
        }))
        .unwrap();
        assert_eq!(
            gost_remote_host(&params),
            RemoteHost::Literal("1.2.3.4".into())
        );

        let params = GostParams::default();
        assert_eq!(gost_remote_host(&params), RemoteHost::Anywhere);
    }

    #[test]
    fn haproxy_config_lists_backends() {
        let config = decode(
            Method::Haproxy,
            json!({
                "backend_nodes": ["10.0.0.1:80", "10.0.0.2:80"],
                "mode": "tcp",
            }),
        );
        let state = state_for(8080, None);
        let snapshot = snapshot(vec![state]);
        let content =
            config_content(&snapshot, &snapshot.ports[0], &config)
                .unwrap()
                .unwrap();
        assert!(content.contains("frontend 8080-in"));
        assert!(content.contains("bind *:8080"));
        assert!(content
            .contains("server server0 10.0.0.1:80 check inter 10000 maxconn 20480"));
        assert!(content.contains("server server1 10.0.0.2:80"));
    }

    #[test]
    fn wstunnel_client_and_server_commands() {
        let client = decode(
            Method::Wstunnel,
            json!({
                "client_type": "client",
                "protocol": "wss",
                "proxy_port": 1080,
                "remote_address": "tunnel.example.com",
                "remote_port": 443,
            }),
        );
        let cmd = command_line(&state_for(10001, None), &client, None)
            .unwrap()
            .unwrap();
        assert_eq!(
            cmd,
            "/usr/local/bin/wstunnel -L 0.0.0.0:10001:127.0.0.1:1080 wss://tunnel.example.com:443"
        );

        let server = decode(
            Method::Wstunnel,
            json!({
                "client_type": "server",
                "protocol": "ws",
                "proxy_port": 1080,
            }),
        );
        let cmd = command_line(&state_for(10001, None), &server, None)
            .unwrap()
            .unwrap();
        assert_eq!(
            cmd,
            "/usr/local/bin/wstunnel --server ws://0.0.0.0:10001 -r 127.0.0.1:1080"
        );
    }

    #[test]
    fn wstunnel_client_requires_remote() {
        let config = decode(
            Method::Wstunnel,
            json!({
                "client_type": "client",
                "protocol": "ws",
                "proxy_port": 1080,
            }),
        );
        assert!(
            command_line(&state_for(10001, None), &config, None).is_err()
        );
    }

    #[test]
    fn caddy_config_proxies_sibling_rules() {
        let caddy_state = state_for(443, None);
        let mut sibling = state_for(10001, None);
        sibling.port.id = 12;

        let mut rule_config = RuleConfig::decode(
            Method::V2ray,
            &json!({"inbounds": [], "outbounds": []}),
        )
        .unwrap();
        rule_config.reverse_proxy = Some(caddy_state.port.id);
        rule_config.tls_settings = Some(aurora_model::TlsSettings {
            domain: "cdn.example.com".into(),
            path: "/stream".into(),
            protocol: "ws".into(),
        });
        sibling.rule = Some(aurora_model::ForwardRule {
            id: 21,
            port_id: sibling.port.id,
            method: Method::V2ray,
            config: rule_config,
            status: aurora_model::RuleStatus::Running,
            is_active: true,
        });

        let snapshot = snapshot(vec![caddy_state, sibling]);
        let caddy = decode(Method::Caddy, json!({}));
        let content =
            config_content(&snapshot, &snapshot.ports[0], &caddy)
                .unwrap()
                .unwrap();
        assert!(content.contains("cdn.example.com {"));
        assert!(content.contains("path /stream"));
        assert!(content.contains("reverse_proxy @10001 localhost:10001"));
    }

    #[test]
    fn unit_name_is_port_scoped() {
        assert_eq!(service_unit_name(10001), "aurora@10001.service");
    }
}
