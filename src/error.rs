use thiserror::Error;

/// Problems with the environment the harness is configured from.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required environment variable `{0}` is not set")]
    Missing(&'static str),

    #[error("environment variable `{var}` has invalid value `{value}`")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("database handle used before it was initialized")]
    Uninitialized,

    #[error("database handle used after it was closed")]
    Closed,

    #[error("blocking query refused, only async access is allowed: {0}")]
    SyncDisallowed(String),

    #[error("synchronous override is already active on this handle")]
    SyncScopeActive,

    #[error("blocking database access needs a multi-threaded tokio runtime")]
    BlockingUnsupported,

    #[error("unsupported database URL `{0}`")]
    UnsupportedUrl(String),

    #[error("invalid SQL identifier `{0}`")]
    InvalidIdentifier(String),

    #[error("no row in `{table}` matches the given fields")]
    NotFound { table: &'static str },

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
