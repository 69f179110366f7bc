//! End-to-end checks over the pure half of the engine: translate a rule,
//! render its remote steps, account its counters and enforce its policy,
//! without touching a database or a host.

use aurora_core::db::{PortState, ServerSnapshot};
use aurora_core::enforce::check_limits;
use aurora_core::traffic::{parse_counters, roll_usage};
use aurora_core::translate::{
    RemoteStep, methods, plan_apply_rule, plan_clean_port, reverse,
    validate_rule,
};
use aurora_model::{
    LimitAction, Method, Port, PortConfig, PortUsage, RuleConfig, Server,
    ServerConfig, UsagePolicy,
};
use serde_json::json;

fn server() -> Server {
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

fn port(num: u16) -> Port {
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

fn snapshot(state: PortState) -> ServerSnapshot {
    ServerSnapshot {
        server: server(),
        ports: vec![state],
    }
}

/// Create-filter-NAT scenario: the plan installs accounting-tagged
/// entries for the resolved address and the rendered helper invocation
/// matches the documented contract.
#[test]
fn filter_nat_rule_end_to_end() {
    let config = validate_rule(
        &server(),
        &port(10001),
        Method::Iptables,
        &json!({
            "type": "TCP",
            "remote_address": "example.com",
            "remote_port": 443,
        }),
    )
    .unwrap();

    let state = PortState {
        port: port(10001),
        rule: None,
        usage: None,
        allowed_user_ids: vec![],
    };
    let snapshot = snapshot(state);
    let plan = plan_apply_rule(
        &snapshot,
        &snapshot.ports[0],
        &config,
        Some("93.184.216.34"),
    )
    .unwrap();

    let rendered: Vec<String> = plan
        .steps
        .iter()
        .filter_map(|step| match step {
            RemoteStep::InstallFilter { port_num, op } => {
                Some(op.render_args(*port_num))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        rendered,
        vec![
            "list 10001".to_string(),
            "-t=TCP forward 10001 93.184.216.34 443".to_string(),
        ]
    );
}

/// The service-unit round-trip law: for every unit-backed method, the
/// translator's command line identifies the method again.
#[test]
fn command_lines_identify_their_method() {
    let cases = vec![
        (Method::Gost, json!({"ServeNodes": [":10001"]})),
        (
            Method::Ehco,
            json!({
                "transport_type": "ws",
                "remote_address": "5.6.7.8",
                "remote_port": 443,
            }),
        ),
        (
            Method::Shadowsocks,
            json!({"encryption": "AEAD_AES_128_GCM", "password": "pw"}),
        ),
        (
            Method::Socat,
            json!({"type": "TCP", "remote_address": "5.6.7.8", "remote_port": 443}),
        ),
        (
            Method::Realm,
            json!({"remote_address": "5.6.7.8", "remote_port": 443}),
        ),
        (Method::Iperf, json!({})),
        (Method::NodeExporter, json!({})),
    ];

    for (method, raw) in cases {
        let config = RuleConfig::decode(method, &raw).unwrap();
        let state = PortState {
            port: port(10001),
            rule: None,
            usage: None,
            allowed_user_ids: vec![],
        };
        let command = methods::command_line(&state, &config, None)
            .unwrap()
            .unwrap_or_else(|| panic!("{method} has no unit command"));
        assert_eq!(
            reverse::method_of_command(&command),
            Some(method),
            "command {command:?} did not identify {method}"
        );
    }
}

/// Quota-exceeded scenario: 600 down + 500 up crosses a 1000-byte quota
/// and selects the 1 Mbit tier.
#[test]
fn quota_crossing_selects_throttle_tier() {
    let listing = concat!(
        "  3  600 DNAT tcp -- 0.0.0.0/0 /* DOWNLOAD 10001-> */\n",
        "  2  500 DNAT tcp -- 0.0.0.0/0 /* UPLOAD 10001-> */\n",
    );
    let observed = parse_counters(listing);
    let usage = observed.get(&10001).unwrap();

    let rolled = roll_usage(
        PortUsage {
            port_id: 11,
            ..Default::default()
        },
        None,
        usage,
        false,
    );
    assert_eq!(rolled.download + rolled.upload, 1100);

    let policy = UsagePolicy {
        quota: Some(1000),
        valid_until: None,
        quota_action: LimitAction::SpeedLimit1m,
        due_action: LimitAction::NoAction,
    };
    let action =
        check_limits(&policy, rolled.download + rolled.upload, 0).unwrap();
    assert_eq!(action, LimitAction::SpeedLimit1m);
    assert_eq!(action.speed_kbit(), Some(1000));
}

/// Counter-reset scenario from the collector's point of view, driven by
/// parsed listings rather than hand-built observations.
#[test]
fn reset_skips_then_rolls_forward() {
    let before = PortUsage {
        port_id: 11,
        download: 800,
        upload: 0,
        download_accumulate: 800,
        upload_accumulate: 0,
        download_checkpoint: 800,
        upload_checkpoint: 0,
    };

    // A reconcile reset the host counters and zeroed the checkpoints
    // while this pass was in flight.
    let mut row_now = before;
    row_now.download_checkpoint = 0;
    row_now.upload_checkpoint = 0;

    let observed =
        parse_counters("  1  50 DNAT tcp -- /* DOWNLOAD 10001-> */\n");
    let observed = observed.get(&10001).unwrap();

    let skipped = roll_usage(row_now, Some(&before), observed, false);
    assert_eq!(skipped.download, 800);

    let settled = roll_usage(skipped, Some(&skipped), observed, true);
    assert_eq!(settled.download, 850);
    assert_eq!(settled.download_accumulate, 850);
}

/// Rule deletion cleanup keeps the final counter read ahead of the
/// entry removal.
#[test]
fn clean_plan_orders_read_before_delete() {
    let plan = plan_clean_port(10001);
    let ops: Vec<String> = plan
        .steps
        .iter()
        .filter_map(|step| match step {
            RemoteStep::InstallFilter { port_num, op } => {
                Some(op.render_args(*port_num))
            }
            RemoteStep::RemoveService { port_num } => {
                Some(format!("remove-unit {port_num}"))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        ops,
        vec![
            "remove-unit 10001".to_string(),
            "list 10001".to_string(),
            "delete 10001".to_string(),
        ]
    );
}

/// Gost validation rejection, exactly as the boundary reports it.
#[test]
fn gost_foreign_port_rejected_with_message() {
    let err = validate_rule(
        &server(),
        &port(10001),
        Method::Gost,
        &json!({"ServeNodes": [":99"]}),
    )
    .unwrap_err();
    assert_eq!(err.to_string(), "Port not allowed, ServeNode: :99");
}
