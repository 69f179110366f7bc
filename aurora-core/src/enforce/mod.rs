//! The limit enforcer: evaluate quota/expiry policies after each
//! collection pass and take the configured action.

use chrono::Utc;
use tracing::info;

use aurora_model::{LimitAction, UsagePolicy};

use crate::db::{PortState, ServerSnapshot};
use crate::error::Result;
use crate::queue::{Job, JobPayload, PRIORITY_CLEAN, PRIORITY_RULE};
use crate::reconcile::Engine;

/// Evaluate one policy against a usage total. Expiry wins over quota;
/// an untriggered policy yields no action at all.
pub fn check_limits(
    policy: &UsagePolicy,
    usage: i64,
    now_ms: i64,
) -> Option<LimitAction> {
    if let Some(valid_until) = policy.valid_until {
        if now_ms >= valid_until {
            return Some(policy.due_action);
        }
    }
    if let Some(quota) = policy.quota {
        if usage >= quota {
            return Some(policy.quota_action);
        }
    }
    None
}

impl Engine {
    /// Evaluate a port's own policy.
    pub(crate) async fn check_port_limits(
        &self,
        state: &PortState,
    ) -> Result<()> {
        let Some(usage) = &state.usage else {
            return Ok(());
        };
        let total = usage.download + usage.upload;
        if let Some(action) = check_limits(
            &state.port.config.policy,
            total,
            Utc::now().timestamp_millis(),
        ) {
            self.apply_port_limit(state, action).await?;
        }
        Ok(())
    }

    /// A server-user action fires against every port on that server the
    /// user is permitted to use.
    pub(crate) async fn check_server_user_limits(
        &self,
        snapshot: &ServerSnapshot,
        server_user: &aurora_model::ServerUser,
        usage: i64,
    ) -> Result<()> {
        let Some(action) = check_limits(
            &server_user.config,
            usage,
            Utc::now().timestamp_millis(),
        ) else {
            return Ok(());
        };
        if action == LimitAction::NoAction {
            return Ok(());
        }

        info!(
            user_id = server_user.user_id,
            server_id = server_user.server_id,
            ?action,
            "Server-user limit reached"
        );
        for state in &snapshot.ports {
            if state.allowed_user_ids.contains(&server_user.user_id) {
                self.apply_port_limit(state, action).await?;
            }
        }
        Ok(())
    }

    /// Take one action on one port.
    ///
    /// Throttling persists the tier on the port and enqueues a shaping
    /// job at the highest priority, but only when the persisted tier
    /// actually changes, so repeated evaluations are idempotent.
    /// Deletion drops the rule row first and leaves the final counter
    /// accounting to the clean-port plan.
    pub(crate) async fn apply_port_limit(
        &self,
        state: &PortState,
        action: LimitAction,
    ) -> Result<()> {
        match action {
            LimitAction::NoAction => Ok(()),
            LimitAction::DeleteRule => {
                let Some(rule) = &state.rule else {
                    return Ok(());
                };
                info!(
                    port = state.port.num,
                    rule = rule.id,
                    "Quota action: deleting forward rule"
                );
                self.db().delete_rule(rule.id).await?;
                self.queue()
                    .enqueue(Job::new(
                        JobPayload::CleanPort {
                            server_id: state.port.server_id,
                            port_num: state.port.num,
                        },
                        PRIORITY_CLEAN,
                    ))
                    .await?;
                Ok(())
            }
            throttle => {
                let Some(kbit) = throttle.speed_kbit() else {
                    return Ok(());
                };
                if state.port.config.egress_limit == Some(kbit)
                    && state.port.config.ingress_limit == Some(kbit)
                {
                    return Ok(());
                }

                info!(
                    port = state.port.num,
                    kbit, "Quota action: throttling port"
                );
                let mut config = state.port.config.clone();
                config.egress_limit = Some(kbit);
                config.ingress_limit = Some(kbit);
                self.db()
                    .update_port_config(state.port.id, &config)
                    .await?;

                self.queue()
                    .enqueue(Job::new(
                        JobPayload::ApplyShaping {
                            server_id: state.port.server_id,
                            port_num: state.port.num,
                            egress_limit: Some(kbit),
                            ingress_limit: Some(kbit),
                        },
                        PRIORITY_RULE,
                    ))
                    .await?;
                Ok(())
            }
        }
    }

    /// Minutely scan so expiries fire without waiting for a collection.
    pub async fn expiry_scan(&self) -> Result<()> {
        for server in self.db().list_active_servers().await? {
            self.aggregate_and_enforce(server.id).await?;
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(
        quota: Option<i64>,
        valid_until: Option<i64>,
        quota_action: LimitAction,
        due_action: LimitAction,
    ) -> UsagePolicy {
        UsagePolicy {
            quota,
            valid_until,
            quota_action,
            due_action,
        }
    }

    #[test]
    fn quota_exceeded_returns_quota_action() {
        let policy = policy(
            Some(1000),
            None,
            LimitAction::SpeedLimit1m,
            LimitAction::NoAction,
        );
        // download=600 + upload=500 crosses the 1000-byte quota.
        assert_eq!(
            check_limits(&policy, 1100, 0),
            Some(LimitAction::SpeedLimit1m)
        );
        assert_eq!(check_limits(&policy, 999, 0), None);
    }

    #[test]
    fn expiry_wins_over_quota() {
        let policy = policy(
            Some(10),
            Some(5_000),
            LimitAction::SpeedLimit1m,
            LimitAction::DeleteRule,
        );
        assert_eq!(
            check_limits(&policy, 100, 6_000),
            Some(LimitAction::DeleteRule)
        );
        assert_eq!(
            check_limits(&policy, 100, 4_000),
            Some(LimitAction::SpeedLimit1m)
        );
    }

    #[test]
    fn empty_policy_never_fires() {
        let policy = UsagePolicy::default();
        assert_eq!(check_limits(&policy, i64::MAX, i64::MAX), None);
    }
}
