//! Blocking plan executor. Runs on the blocking pool with exclusive use
//! of one [`HostConnection`]; everything it learns (probed facts,
//! reported versions, captured counter listings) comes back in
//! [`StepResults`] for the async side to persist.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use md5::{Digest, Md5};
use regex::Regex;
use std::sync::OnceLock;

use aurora_model::SystemFacts;

use crate::connector::HostConnection;
use crate::error::{CoreError, Result};
use crate::translate::{FilterOp, RemoteStep};

/// Helper scripts shipped by the control plane and md5-synced onto every
/// host before use.
pub const FILTER_HELPER: &str = include_str!("../../scripts/iptables.sh");
pub const SHAPING_HELPER: &str = include_str!("../../scripts/tc.sh");
pub const INSTALL_HELPER: &str = include_str!("../../scripts/install.sh");

pub const FILTER_HELPER_PATH: &str = "/usr/local/bin/aurora-iptables.sh";
const SHAPING_HELPER_PATH: &str = "/usr/local/bin/aurora-tc.sh";
const INSTALL_HELPER_PATH: &str = "/usr/local/bin/aurora-install.sh";

const SYSTEMD_DIR: &str = "/etc/systemd/system";

/// Service units whose enabled-state the facts probe records.
const PROBED_UNITS: [&str; 2] =
    ["iptables-restore.service", "netfilter-persistent.service"];

/// Facts parsed from one probe run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbedFacts {
    pub system: SystemFacts,
    pub services: BTreeMap<String, String>,
}

/// Everything a plan run learned, for the async side to persist.
#[derive(Debug, Clone, Default)]
pub struct StepResults {
    /// Merged output of every remote command, in order.
    pub combined_output: String,
    /// (binary name, reported version) pairs from EnsureBinary steps.
    pub versions: Vec<(String, String)>,
    pub facts: Option<ProbedFacts>,
    /// Output of the last counter-listing step, for usage accounting.
    pub traffic_capture: Option<String>,
}

pub fn content_md5(content: &str) -> String {
    format!("{:x}", Md5::digest(content.as_bytes()))
}

/// Sync a shipped script onto the host unless its MD5 already matches.
fn ensure_script(
    conn: &mut HostConnection,
    remote_path: &str,
    content: &str,
) -> Result<()> {
    if conn.exists(remote_path)? {
        let (status, output) =
            conn.run_unchecked(&format!("md5sum {remote_path}"))?;
        if status == 0 {
            let remote_md5 =
                output.split_whitespace().next().unwrap_or_default();
            if remote_md5 == content_md5(content) {
                return Ok(());
            }
        }
    }
    conn.put_content(content, remote_path, None, Some(0o755))
}

fn binary_path(name: &str) -> String {
    match name {
        "haproxy" => "/usr/sbin/haproxy".to_string(),
        "iperf" => "/usr/bin/iperf3".to_string(),
        "socat" => "/usr/bin/socat".to_string(),
        "iptables" => "/usr/sbin/iptables".to_string(),
        "shadowsocks" => "/usr/local/bin/shadowsocks_go".to_string(),
        other => format!("/usr/local/bin/{other}"),
    }
}

fn render_unit(port_num: u16, command_line: &str) -> String {
    format!(
        r#"[Unit]
Description=Aurora forward service for port {port_num}
After=network.target

[Service]
Type=simple
ExecStart={command_line}
Restart=always
RestartSec=3
LimitNOFILE=1048576
StandardOutput=journal
StandardError=journal

[Install]
WantedBy=multi-user.target
"#
    )
}

fn unit_path(port_num: u16) -> String {
    format!("{SYSTEMD_DIR}/aurora@{port_num}.service")
}

/// Compact a journal excerpt down to the message part of each line.
pub fn extract_unit_errors(raw: &str) -> String {
    static LINE: OnceLock<Regex> = OnceLock::new();
    let line = LINE.get_or_init(|| {
        Regex::new(r"\w+\[[0-9]+\]: (.*)$").expect("static regex")
    });

    raw.lines()
        .filter_map(|l| line.captures(l))
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse the probe command's segmented output.
pub fn parse_probed_facts(raw: &str) -> ProbedFacts {
    let mut segments = raw.split("---AURORA---");

    let mut system = SystemFacts::default();
    if let Some(os_release) = segments.next() {
        let mut values = BTreeMap::new();
        for line in os_release.lines() {
            if let Some((key, value)) = line.split_once('=') {
                values.insert(
                    key.trim().to_string(),
                    value.trim().trim_matches('"').to_string(),
                );
            }
        }
        system.os_family = values
            .get("ID_LIKE")
            .and_then(|v| v.split_whitespace().next())
            .or(values.get("ID").map(String::as_str))
            .map(capitalize);
        system.distribution = values.get("NAME").cloned();
        system.distribution_version = values.get("VERSION_ID").cloned();
        system.distribution_release =
            values.get("VERSION_CODENAME").cloned();
    }

    if let Some(arch) = segments.next() {
        let arch = arch.trim();
        if !arch.is_empty() {
            system.architecture = Some(arch.to_string());
        }
    }

    let mut services = BTreeMap::new();
    if let Some(units) = segments.next() {
        for line in units.lines() {
            if let Some((unit, state)) = line.split_once('=') {
                services
                    .insert(unit.trim().to_string(), state.trim().to_string());
            }
        }
    }

    ProbedFacts { system, services }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn probe_command() -> String {
    let units = PROBED_UNITS.join(" ");
    format!(
        "cat /etc/os-release; echo '---AURORA---'; uname -m; \
         echo '---AURORA---'; for unit in {units}; do \
         state=$(systemctl is-enabled $unit 2>/dev/null || echo unknown); \
         echo \"$unit=$state\"; done"
    )
}

/// Execute the remote steps of a plan in order. The first failing step
/// fails the plan; a set cancellation flag stops at the next boundary.
pub fn execute_plan(
    conn: &mut HostConnection,
    steps: &[RemoteStep],
    cancelled: &AtomicBool,
) -> Result<StepResults> {
    let mut results = StepResults::default();

    for step in steps {
        if cancelled.load(Ordering::Relaxed) {
            return Err(CoreError::Cancelled(
                "plan cancelled at step boundary".to_string(),
            ));
        }
        execute_step(conn, step, &mut results)?;
    }
    Ok(results)
}

fn record_output(results: &mut StepResults, output: &str) {
    if output.is_empty() {
        return;
    }
    if !results.combined_output.is_empty() {
        results.combined_output.push('\n');
    }
    results.combined_output.push_str(output);
}

fn execute_step(
    conn: &mut HostConnection,
    step: &RemoteStep,
    results: &mut StepResults,
) -> Result<()> {
    match step {
        // Local step; the engine regenerates the inventory before the
        // transport is opened.
        RemoteStep::EnsureInventory => Ok(()),

        RemoteStep::EnsureBinary { name, version_arg } => {
            ensure_script(conn, INSTALL_HELPER_PATH, INSTALL_HELPER)?;
            let output =
                conn.run(&format!("sh {INSTALL_HELPER_PATH} {name}"))?;
            record_output(results, &output);

            let (status, version) = conn.run_unchecked(&format!(
                "{} {version_arg}",
                binary_path(name)
            ))?;
            if status == 0 {
                let first_line = version
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                if !first_line.is_empty() {
                    results.versions.push((name.clone(), first_line));
                }
            }
            Ok(())
        }

        RemoteStep::WriteConfig {
            path,
            content,
            mode,
        } => {
            if conn.exists(path)? {
                let (status, output) =
                    conn.run_unchecked(&format!("md5sum {path}"))?;
                let remote_md5 =
                    output.split_whitespace().next().unwrap_or_default();
                if status == 0 && remote_md5 == content_md5(content) {
                    return Ok(());
                }
            }
            if let Some(parent) = path.rsplit_once('/').map(|(dir, _)| dir)
            {
                conn.ensure_folder(parent)?;
            }
            conn.put_content(content, path, None, Some(*mode))
        }

        RemoteStep::WriteService {
            port_num,
            command_line,
            ..
        } => {
            let unit = render_unit(*port_num, command_line);
            let path = unit_path(*port_num);
            conn.put_content(&unit, &path, None, Some(0o644))?;
            conn.run("systemctl daemon-reload")?;
            conn.run(&format!("systemctl enable aurora@{port_num}"))?;
            let output =
                conn.run(&format!("systemctl restart aurora@{port_num}"))?;
            record_output(results, &output);

            // Post-condition: the unit must actually be running.
            let (status, _) = conn.run_unchecked(&format!(
                "systemctl is-active aurora@{port_num}"
            ))?;
            if status != 0 {
                let (_, journal) = conn.run_unchecked(&format!(
                    "journalctl -u aurora@{port_num} -n 10 --no-pager"
                ))?;
                return Err(CoreError::remote_step(format!(
                    "aurora@{port_num} is not active after restart\n{journal}"
                )));
            }
            Ok(())
        }

        RemoteStep::RemoveService { port_num } => {
            let (_, output) = conn.run_unchecked(&format!(
                "systemctl stop aurora@{port_num}; \
                 systemctl disable aurora@{port_num}"
            ))?;
            record_output(results, &output);
            conn.run(&format!(
                "rm -f {} {}/{port_num}",
                unit_path(*port_num),
                crate::translate::REMOTE_CONFIG_DIR
            ))?;
            conn.run("systemctl daemon-reload")?;
            Ok(())
        }

        RemoteStep::InstallFilter { port_num, op } => {
            ensure_script(conn, FILTER_HELPER_PATH, FILTER_HELPER)?;
            let output = conn.run(&format!(
                "sh {FILTER_HELPER_PATH} {}",
                op.render_args(*port_num)
            ))?;
            record_output(results, &output);
            if matches!(op, FilterOp::List | FilterOp::ListAll) {
                results.traffic_capture = Some(output);
            }
            Ok(())
        }

        RemoteStep::ApplyShaping {
            port_num,
            egress_kbit,
            ingress_kbit,
        } => {
            ensure_script(conn, SHAPING_HELPER_PATH, SHAPING_HELPER)?;
            let mut args = String::new();
            if let Some(egress) = egress_kbit {
                args.push_str(&format!("-e={egress}kbit "));
            }
            if let Some(ingress) = ingress_kbit {
                args.push_str(&format!("-i={ingress}kbit "));
            }
            args.push_str(&port_num.to_string());
            let output =
                conn.run(&format!("sh {SHAPING_HELPER_PATH} {args}"))?;
            record_output(results, &output);
            Ok(())
        }

        RemoteStep::ProbeFacts => {
            ensure_script(conn, FILTER_HELPER_PATH, FILTER_HELPER)?;
            let output = conn.run(&probe_command())?;
            results.facts = Some(parse_probed_facts(&output));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_template_embeds_command() {
        let unit = render_unit(
            10001,
            "/usr/local/bin/gost -C /usr/local/etc/aurora/10001",
        );
        assert!(unit.contains(
            "ExecStart=/usr/local/bin/gost -C /usr/local/etc/aurora/10001"
        ));
        assert!(unit.contains("Description=Aurora forward service for port 10001"));
        assert!(unit.contains("WantedBy=multi-user.target"));
    }

    #[test]
    fn extracts_journal_messages() {
        let raw = concat!(
            "-- Logs begin at Mon 2026-07-27 --\n",
            "Jul 27 10:00:01 hk-1 gost[4217]: parse config error\n",
            "Jul 27 10:00:01 hk-1 systemd[1]: aurora@10001.service: Failed with result 'exit-code'.\n",
            "unrelated line\n",
        );
        let extracted = extract_unit_errors(raw);
        assert_eq!(
            extracted,
            "parse config error\naurora@10001.service: Failed with result 'exit-code'."
        );
    }

    #[test]
    fn parses_probe_output() {
        let raw = concat!(
            "NAME=\"Debian GNU/Linux\"\n",
            "VERSION_ID=\"12\"\n",
            "VERSION_CODENAME=bookworm\n",
            "ID=debian\n",
            "---AURORA---\n",
            "x86_64\n",
            "---AURORA---\n",
            "iptables-restore.service=enabled\n",
            "netfilter-persistent.service=unknown\n",
        );
        let facts = parse_probed_facts(raw);
        assert_eq!(facts.system.os_family.as_deref(), Some("Debian"));
        assert_eq!(
            facts.system.distribution.as_deref(),
            Some("Debian GNU/Linux")
        );
        assert_eq!(
            facts.system.distribution_version.as_deref(),
            Some("12")
        );
        assert_eq!(
            facts.system.distribution_release.as_deref(),
            Some("bookworm")
        );
        assert_eq!(facts.system.architecture.as_deref(), Some("x86_64"));
        assert_eq!(
            facts.services.get("iptables-restore.service").unwrap(),
            "enabled"
        );
    }

    #[test]
    fn os_family_prefers_id_like() {
        let raw = "ID=ubuntu\nID_LIKE=debian\n---AURORA---\nx86_64\n---AURORA---\n";
        let facts = parse_probed_facts(raw);
        assert_eq!(facts.system.os_family.as_deref(), Some("Debian"));
    }

    #[test]
    fn helper_md5_is_stable() {
        assert_eq!(content_md5(FILTER_HELPER), content_md5(FILTER_HELPER));
        assert_ne!(content_md5(FILTER_HELPER), content_md5(SHAPING_HELPER));
    }
}
