use aurora_model::{ForwardRule, Method, RuleConfig, RuleStatus};
use sqlx::Row;
use sqlx::postgres::PgRow;

use super::{Database, conflict_on_unique};
use crate::error::{CoreError, Result};

/// A DDNS-followed rule joined with its port and server coordinates.
#[derive(Debug, Clone)]
pub struct DdnsRule {
    pub rule: ForwardRule,
    pub port_num: u16,
    pub server_id: i64,
}

pub(crate) fn map_rule(row: &PgRow) -> Result<ForwardRule> {
    let method = Method::parse(row.try_get::<String, _>("method")?.as_str())?;
    let config: serde_json::Value = row.try_get("config")?;
    let status: String = row.try_get("status")?;
    Ok(ForwardRule {
        id: row.try_get("id")?,
        port_id: row.try_get("port_id")?,
        method,
        config: RuleConfig::decode(method, &config)?,
        status: RuleStatus::parse(&status).unwrap_or_default(),
        is_active: row.try_get("is_active")?,
    })
}

impl Database {
    pub async fn get_rule(&self, rule_id: i64) -> Result<ForwardRule> {
        let row =
            sqlx::query("SELECT * FROM port_forward_rules WHERE id = $1")
                .bind(rule_id)
                .fetch_optional(self.pool())
                .await?
                .ok_or_else(|| {
                    CoreError::not_found(format!("rule {rule_id}"))
                })?;
        map_rule(&row)
    }

    pub async fn get_rule_for_port(
        &self,
        port_id: i64,
    ) -> Result<Option<ForwardRule>> {
        let row = sqlx::query(
            "SELECT * FROM port_forward_rules WHERE port_id = $1",
        )
        .bind(port_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(map_rule).transpose()
    }

    pub async fn create_rule(
        &self,
        port_id: i64,
        method: Method,
        config: &RuleConfig,
    ) -> Result<ForwardRule> {
        let row = sqlx::query(
            r#"
            INSERT INTO port_forward_rules (port_id, method, config, status)
            VALUES ($1, $2, $3, 'starting')
            RETURNING *
            "#,
        )
        .bind(port_id)
        .bind(method.as_str())
        .bind(config.encode()?)
        .fetch_one(self.pool())
        .await
        .map_err(|e| conflict_on_unique(e, "port already has a forward rule"))?;
        map_rule(&row)
    }

    pub async fn update_rule(
        &self,
        rule_id: i64,
        method: Method,
        config: &RuleConfig,
    ) -> Result<ForwardRule> {
        let row = sqlx::query(
            r#"
            UPDATE port_forward_rules
            SET method = $1, config = $2, status = 'starting'
            WHERE id = $3
            RETURNING *
            "#,
        )
        .bind(method.as_str())
        .bind(config.encode()?)
        .bind(rule_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| CoreError::not_found(format!("rule {rule_id}")))?;
        map_rule(&row)
    }

    /// Reconciler-owned status write. A late `starting` event must not
    /// overwrite a rule that already reached `running`.
    pub async fn update_rule_status(
        &self,
        rule_id: i64,
        status: RuleStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE port_forward_rules
            SET status = $2
            WHERE id = $1
              AND NOT (status = 'running' AND $2 = 'starting')
            "#,
        )
        .bind(rule_id)
        .bind(status.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Store the runner ident so the UI can fetch the plan's stdout later.
    pub async fn set_rule_runner(
        &self,
        rule_id: i64,
        ident: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE port_forward_rules
            SET config = jsonb_set(config, '{runner}', to_jsonb($2::text))
            WHERE id = $1
            "#,
        )
        .bind(rule_id)
        .bind(ident)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Persist the failure blob and flip the rule to `failed`.
    pub async fn set_rule_error(
        &self,
        rule_id: i64,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE port_forward_rules
            SET status = 'failed',
                config = jsonb_set(config, '{error}', to_jsonb($2::text))
            WHERE id = $1
            "#,
        )
        .bind(rule_id)
        .bind(error)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Cache the resolved remote address before filter steps emit.
    pub async fn set_rule_remote_ip(
        &self,
        rule_id: i64,
        remote_ip: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE port_forward_rules
            SET config = jsonb_set(config, '{remote_ip}', to_jsonb($2::text))
            WHERE id = $1
            "#,
        )
        .bind(rule_id)
        .bind(remote_ip)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn delete_rule(&self, rule_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM port_forward_rules WHERE id = $1")
            .bind(rule_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// All rules of methods the DDNS watcher follows, with the port and
    /// server coordinates needed to enqueue a re-apply.
    pub async fn list_ddns_rules(&self) -> Result<Vec<DdnsRule>> {
        let rows = sqlx::query(
            r#"
            SELECT r.*, p.num AS port_num, p.server_id AS server_id
            FROM port_forward_rules r
            JOIN ports p ON p.id = r.port_id
            WHERE r.method = ANY($1) AND r.is_active AND p.is_active
            "#,
        )
        .bind(
            Method::ALL
                .iter()
                .filter(|m| m.follows_ddns())
                .map(|m| m.as_str())
                .collect::<Vec<_>>(),
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(DdnsRule {
                    rule: map_rule(row)?,
                    port_num: row.try_get::<i32, _>("port_num")? as u16,
                    server_id: row.try_get("server_id")?,
                })
            })
            .collect()
    }
}
