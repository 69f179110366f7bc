//! Postgres persistence. One [`Database`] handle wraps the pool; the
//! entity repositories live in the sibling modules as impl blocks.

mod files;
mod ports;
mod rules;
mod servers;
mod usage;
mod users;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::error::Result;

pub use ports::{PortInput, PortState};
pub use rules::DdnsRule;
pub use servers::{ServerInput, ServerSnapshot};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to Postgres");
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

/// Map a unique-constraint violation into [`CoreError::Conflict`] with a
/// readable message; pass every other database error through.
pub(crate) fn conflict_on_unique(
    err: sqlx::Error,
    message: &str,
) -> crate::error::CoreError {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.is_unique_violation() {
            return crate::error::CoreError::conflict(message.to_string());
        }
    }
    err.into()
}
