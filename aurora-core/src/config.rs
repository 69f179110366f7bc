//! Runtime settings. Everything arrives through environment variables,
//! loaded once at startup; `.env` files are honored for development.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone)]
pub struct Settings {
    /// Postgres connection string.
    pub database_url: String,
    pub redis_host: String,
    pub redis_port: u16,

    /// Cadence of the traffic-collection fanout.
    pub traffic_interval: Duration,
    /// Cadence of the DDNS re-resolution sweep.
    pub ddns_interval: Duration,
    /// Cadence of the per-server CPU/memory/disk probe.
    pub server_usage_interval: Duration,
    /// Per-server SSH connect/auth budget.
    pub ssh_connection_timeout: Duration,

    /// Root of the uploaded-blob tree and per-job artifacts.
    pub file_storage_path: PathBuf,
    /// Days of job output history kept before the retention sweep.
    pub task_output_storage_days: i64,

    pub pubsub_prefix: String,
    pub pubsub_stopword: String,
    /// Idle budget for live subscribers before they are detached.
    pub pubsub_timeout: Duration,
    /// Pause before publishing the stopword so its score sorts last.
    pub pubsub_sleep: Duration,

    pub secret_key: String,
    pub enable_sentry: bool,
    pub environment: String,
    /// Operator-pinned DNS server, tried before the DoH providers.
    pub dns_server: Option<String>,

    /// Queue worker parallelism.
    pub worker_count: usize,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| {
            CoreError::validation(format!("invalid value for {name}: {raw}"))
        }),
        Err(_) => Ok(default),
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").map_err(|_| {
            CoreError::validation("DATABASE_URL must be set")
        })?;

        Ok(Self {
            database_url,
            redis_host: var_or("REDIS_HOST", "127.0.0.1"),
            redis_port: parse_var("REDIS_PORT", 6379)?,
            traffic_interval: Duration::from_secs(parse_var(
                "TRAFFIC_INTERVAL_SECONDS",
                600,
            )?),
            ddns_interval: Duration::from_secs(parse_var(
                "DDNS_INTERVAL_SECONDS",
                300,
            )?),
            server_usage_interval: Duration::from_secs(parse_var(
                "SERVER_USAGE_INTERVAL_SECONDS",
                60,
            )?),
            ssh_connection_timeout: Duration::from_secs(parse_var(
                "SSH_CONNECTION_TIMEOUT",
                10,
            )?),
            file_storage_path: PathBuf::from(var_or(
                "FILE_STORAGE_PATH",
                "storage",
            )),
            task_output_storage_days: parse_var(
                "TASK_OUTPUT_STORAGE_DAYS",
                7,
            )?,
            pubsub_prefix: var_or("PUBSUB_PREFIX", "aurora:task"),
            pubsub_stopword: var_or("PUBSUB_STOPWORD", "AURORA_DONE"),
            pubsub_timeout: Duration::from_secs(parse_var(
                "PUBSUB_TIMEOUT_SECONDS",
                120,
            )?),
            pubsub_sleep: Duration::from_millis(
                (parse_var("PUBSUB_SLEEP_SECONDS", 0.1_f64)? * 1000.0)
                    as u64,
            ),
            secret_key: var_or("SECRET_KEY", "aurora-panel"),
            enable_sentry: parse_var("ENABLE_SENTRY", false)?,
            environment: var_or("ENVIRONMENT", "development"),
            dns_server: env::var("DNS_SERVER").ok().filter(|s| !s.is_empty()),
            worker_count: parse_var("WORKER_COUNT", 4)?,
        })
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}", self.redis_host, self.redis_port)
    }
}
