use thiserror::Error;

/// Engine-wide error type. One variant per failure kind the reconciler
/// distinguishes, plus wrappers for the infrastructure crates.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Unreachable host, auth failure or connect timeout. Not locally
    /// recoverable; fails the current plan and is retried on the next
    /// scheduled pass.
    #[error("transport error: {0}")]
    Transport(String),

    /// Rule config rejected by the translator schema. Returned to the
    /// caller at the boundary, never reaches the reconciler.
    #[error("{0}")]
    Validation(String),

    /// Uniqueness invariant violated (duplicate port, second rule).
    #[error("{0}")]
    Conflict(String),

    /// A remote step exited non-zero or failed its post-condition.
    #[error("remote step failed: {0}")]
    RemoteStep(String),

    /// Job cancelled at a step boundary. Terminal but not a failure.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("model error: {0}")]
    Model(#[from] aurora_model::ModelError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn remote_step(message: impl Into<String>) -> Self {
        Self::RemoteStep(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
