//! The traffic collector: read accounting-tagged counters on every
//! active server, apply the per-port update rule, aggregate per-user
//! totals and hand the result to the limit enforcer.

pub mod rollup;

pub use rollup::{TrafficObservation, roll_usage};

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::error::Result;
use crate::queue::{Job, JobPayload, PRIORITY_SERVER, PRIORITY_TRAFFIC};
use crate::reconcile::Engine;
use crate::translate::{ActionPlan, FilterOp, RemoteStep};

/// Extract per-port byte counters from the filter helper's listing.
///
/// Matching lines carry a comment `UPLOAD <num>->` or `DOWNLOAD <num>->`
/// (with a `-UDP` suffix for the UDP pair) and lead with packet and byte
/// columns; suffixed and unsuffixed matches sum per direction.
pub fn parse_counters(raw: &str) -> BTreeMap<u16, TrafficObservation> {
    static TAG: OnceLock<Regex> = OnceLock::new();
    let tag = TAG.get_or_init(|| {
        Regex::new(r"/\* (UPLOAD|DOWNLOAD)(?:-UDP)? ([0-9]+)->")
            .expect("static regex")
    });

    let mut counters: BTreeMap<u16, TrafficObservation> = BTreeMap::new();
    for line in raw.lines() {
        let Some(captures) = tag.captures(line) else { continue };
        let Ok(port_num) = captures[2].parse::<u16>() else { continue };
        let Some(bytes) = line
            .split_whitespace()
            .nth(1)
            .and_then(|field| field.parse::<i64>().ok())
        else {
            continue;
        };

        let entry = counters.entry(port_num).or_default();
        match &captures[1] {
            "UPLOAD" => entry.upload += bytes,
            _ => entry.download += bytes,
        }
    }
    counters
}

impl Engine {
    /// Enqueue one collection job per active server.
    pub async fn traffic_fanout(&self) -> Result<()> {
        for server in self.db().list_active_servers().await? {
            self.queue()
                .enqueue(Job::new(
                    JobPayload::CollectTraffic {
                        server_id: server.id,
                    },
                    PRIORITY_TRAFFIC,
                ))
                .await?;
        }
        Ok(())
    }

    /// Enqueue one host usage probe per active server.
    pub async fn usage_probe_fanout(&self) -> Result<()> {
        for server in self.db().list_active_servers().await? {
            self.queue()
                .enqueue(Job::new(
                    JobPayload::ServerUsageProbe {
                        server_id: server.id,
                    },
                    PRIORITY_SERVER,
                ))
                .await?;
        }
        Ok(())
    }

    /// One collection pass for one server: list all counters, apply the
    /// update rule per port, then aggregate and enforce.
    pub async fn collect_traffic(
        &self,
        job: &Job,
        server_id: i64,
    ) -> Result<()> {
        let snapshot = self.db().load_server_snapshot(server_id).await?;
        let server = snapshot.server.clone();

        let plan = ActionPlan {
            steps: vec![RemoteStep::InstallFilter {
                port_num: 0,
                op: FilterOp::ListAll,
            }],
            mutates_counters: false,
        };
        let results = self.run_plan(&server, Some(job), &plan).await?;

        let Some(capture) = results.traffic_capture else {
            return Ok(());
        };
        for (port_num, observed) in parse_counters(&capture) {
            let Some(state) = snapshot.port_by_num(port_num) else {
                warn!(server_id, port_num, "Counters for unknown port");
                continue;
            };
            self.db()
                .apply_observation(
                    state.port.id,
                    state.usage.as_ref(),
                    &observed,
                    false,
                )
                .await?;
        }

        self.aggregate_and_enforce(server_id).await
    }

    /// Sum each port's usage into every permitted user's per-server
    /// totals, then evaluate port and server-user policies.
    pub async fn aggregate_and_enforce(
        &self,
        server_id: i64,
    ) -> Result<()> {
        let snapshot = self.db().load_server_snapshot(server_id).await?;

        let mut per_user: BTreeMap<i64, (i64, i64)> = BTreeMap::new();
        for state in &snapshot.ports {
            let Some(usage) = &state.usage else { continue };

            self.check_port_limits(state).await?;
            for user_id in &state.allowed_user_ids {
                let entry = per_user.entry(*user_id).or_default();
                entry.0 += usage.download;
                entry.1 += usage.upload;
            }
        }

        for server_user in self.db().server_users(server_id).await? {
            let (download, upload) = per_user
                .get(&server_user.user_id)
                .copied()
                .unwrap_or_default();
            self.db()
                .set_server_user_usage(server_user.id, download, upload)
                .await?;

            self.check_server_user_limits(
                &snapshot,
                &server_user,
                download + upload,
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = concat!(
        "   17  83886080 DNAT  tcp  --  *  *  0.0.0.0/0  0.0.0.0/0  tcp dpt:10001 /* UPLOAD 10001->1.2.3.4:443 */\n",
        "   12  20971520 DNAT  tcp  --  *  *  0.0.0.0/0  0.0.0.0/0  tcp dpt:10001 /* DOWNLOAD 10001-> */\n",
        "    3      4096 DNAT  udp  --  *  *  0.0.0.0/0  0.0.0.0/0  udp dpt:10001 /* UPLOAD-UDP 10001-> */\n",
        "    1      1024 DNAT  udp  --  *  *  0.0.0.0/0  0.0.0.0/0  udp dpt:10001 /* DOWNLOAD-UDP 10001-> */\n",
        "    9   1048576 DNAT  tcp  --  *  *  0.0.0.0/0  0.0.0.0/0  tcp dpt:10002 /* DOWNLOAD 10002-> */\n",
        "Chain FORWARD (policy ACCEPT 0 packets, 0 bytes)\n",
    );

    #[test]
    fn sums_protocol_suffixed_and_plain_counters() {
        let counters = parse_counters(LISTING);
        let first = counters.get(&10001).unwrap();
        assert_eq!(first.upload, 83_886_080 + 4_096);
        assert_eq!(first.download, 20_971_520 + 1_024);

        let second = counters.get(&10002).unwrap();
        assert_eq!(second.download, 1_048_576);
        assert_eq!(second.upload, 0);
    }

    #[test]
    fn ignores_untagged_and_malformed_lines() {
        let counters = parse_counters(
            "Chain PREROUTING (policy ACCEPT)\n\
             garbage /* UPLOAD notanumber-> */\n",
        );
        assert!(counters.is_empty());
    }
}
