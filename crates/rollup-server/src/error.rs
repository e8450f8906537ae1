//! Error types for the aggregate engine

use thiserror::Error;

/// Result type alias for engine operations
pub type AggregateResult<T> = std::result::Result<T, AggregateError>;

/// Problems with the table registry or runtime settings.
///
/// Raised while loading configuration at startup; the only one that can
/// surface later is [`ConfigError::TableNotFound`] for an unknown name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Aggregate table '{0}' is not registered")]
    TableNotFound(String),

    #[error("Aggregate table '{0}' is registered more than once")]
    DuplicateTable(String),

    #[error("Table '{table}': field '{field}' is partition scoped, so two_stage must be enabled")]
    TwoStageRequired { table: String, field: String },

    #[error("Table '{table}': '{name}' is not a plain SQL identifier")]
    InvalidIdentifier { table: String, name: String },

    #[error("Table '{table}': output column '{column}' is defined more than once")]
    DuplicateColumn { table: String, column: String },

    #[error("Table '{table}': field '{field}' {reason}")]
    InvalidField {
        table: String,
        field: String,
        reason: String,
    },

    #[error("Table '{table}': column '{column}' is produced but not declared in the expected schema")]
    UndeclaredColumn { table: String, column: String },

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),
}

/// Errors that abort an engine operation.
///
/// Statement failures are not in here on purpose: they are rolled back and
/// recorded in the operation's report.
#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("A sync or repair cycle is already in progress")]
    SyncInProgress,
}

impl AggregateError {
    /// True when the store itself is unreachable, as opposed to a single
    /// statement being rejected.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, AggregateError::Database(e) if is_connectivity_error(e))
    }
}

/// Classify a sqlx error as loss of the store rather than a statement failure.
pub fn is_connectivity_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_)
    )
}
