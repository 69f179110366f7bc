use aurora_model::User;
use sqlx::Row;
use sqlx::postgres::PgRow;

use super::{Database, conflict_on_unique};
use crate::error::Result;

fn map_user(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        hashed_password: row.try_get("hashed_password")?,
        is_active: row.try_get("is_active")?,
        is_ops: row.try_get("is_ops")?,
        is_superuser: row.try_get("is_superuser")?,
    })
}

impl Database {
    pub async fn get_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(map_user).transpose()
    }

    pub async fn create_superuser(
        &self,
        email: &str,
        hashed_password: &str,
    ) -> Result<User> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (email, hashed_password, is_superuser)
            VALUES ($1, $2, TRUE)
            RETURNING *
            "#,
        )
        .bind(email)
        .bind(hashed_password)
        .fetch_one(self.pool())
        .await
        .map_err(|e| conflict_on_unique(e, "user already exists"))?;
        map_user(&row)
    }
}
