//! Reverse lookup: recognize what is actually running on a host.
//!
//! The forward direction (`command_line`, `config_content`) is pure, so
//! observed on-host state can be checked against it: the unit's
//! `ExecStart` identifies the method, and for the config-file methods
//! the file body parses back into the discriminated params.

use aurora_model::{GostParams, Method, V2rayParams};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// Identify the method from a service unit's command line.
pub fn method_of_command(command_line: &str) -> Option<Method> {
    let binary = command_line.split_whitespace().next()?;
    let name = binary.rsplit('/').next()?;
    match name {
        "gost" => Some(Method::Gost),
        "v2ray" => Some(Method::V2ray),
        "brook" => Some(Method::Brook),
        "socat" | "sh" => {
            // socat runs under a shell wrapper with two listeners.
            command_line.contains("socat").then_some(Method::Socat)
        }
        "ehco" => Some(Method::Ehco),
        "wstunnel" => Some(Method::Wstunnel),
        "shadowsocks_go" | "shadowsocks_go2" => Some(Method::Shadowsocks),
        "tiny_port_mapper" => Some(Method::TinyPortMapper),
        "iperf3" => Some(Method::Iperf),
        "realm" => Some(Method::Realm),
        "haproxy" => Some(Method::Haproxy),
        "caddy" => Some(Method::Caddy),
        "node_exporter" => Some(Method::NodeExporter),
        _ => None,
    }
}

/// Rebuild a gost rule's params from the config file on the host.
pub fn rebuild_gost_params(config_file: &str) -> Result<GostParams> {
    let value: Value = serde_json::from_str(config_file)?;
    serde_json::from_value(value).map_err(|e| {
        CoreError::validation(format!("unrecognizable gost config: {e}"))
    })
}

/// Rebuild a v2ray rule's params from the config file on the host.
pub fn rebuild_v2ray_params(config_file: &str) -> Result<V2rayParams> {
    let value: Value = serde_json::from_str(config_file)?;
    serde_json::from_value(value).map_err(|e| {
        CoreError::validation(format!("unrecognizable v2ray config: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_unit_commands() {
        assert_eq!(
            method_of_command(
                "/usr/local/bin/gost -C /usr/local/etc/aurora/10001"
            ),
            Some(Method::Gost)
        );
        assert_eq!(
            method_of_command(
                "/bin/sh -c \"socat TCP6-LISTEN:1,fork TCP:1.2.3.4:1\""
            ),
            Some(Method::Socat)
        );
        assert_eq!(
            method_of_command("/usr/bin/iperf3 -s -p 5201"),
            Some(Method::Iperf)
        );
        assert_eq!(method_of_command("/usr/bin/emacs --daemon"), None);
    }

    #[test]
    fn gost_config_round_trips() {
        let params = GostParams {
            retries: 3,
            serve_nodes: vec![":10001".into()],
            chain_nodes: vec!["relay+tls://1.2.3.4:443".into()],
        };
        let encoded =
            serde_json::to_string_pretty(&params).unwrap();
        let rebuilt = rebuild_gost_params(&encoded).unwrap();
        assert_eq!(rebuilt, params);
    }
}
