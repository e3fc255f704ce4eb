//! Error types for Cadence

use thiserror::Error;

use crate::scheduler::cron::CronError;

/// Core error type for scheduler operations
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Task descriptor not found
    #[error("Task not found: {id}")]
    TaskNotFound { id: i64 },

    /// Execution record not found
    #[error("Execution not found: {id}")]
    ExecutionNotFound { id: i64 },

    /// No implementation registered under the descriptor's type name
    #[error("Task type not registered: {type_name}")]
    TaskTypeNotRegistered { type_name: String },

    /// Cron expression could not be parsed
    #[error("Invalid cron expression '{expression}': {source}")]
    InvalidCronExpression {
        expression: String,
        #[source]
        source: CronError,
    },

    /// The descriptor is already running in its claim scope
    #[error("Task is already running: {id}")]
    AlreadyRunning { id: i64 },

    /// The scheduler has not been (or could not be) initialized
    #[error("Task scheduler is not active")]
    NotActive,

    /// Invalid execution state transition
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn invalid_cron(expression: impl Into<String>, source: CronError) -> Self {
        Self::InvalidCronExpression {
            expression: expression.into(),
            source,
        }
    }

    /// Configuration problems skip a descriptor for one cycle; everything
    /// else is an infrastructure fault.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::TaskTypeNotRegistered { .. } | Self::InvalidCronExpression { .. }
        )
    }
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Not found")]
    NotFound,

    #[error("Decode failed: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound,
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
                // PostgreSQL class 23 and SQLite extended constraint codes
                if code.starts_with("23") || code == "2067" || code == "1555" {
                    Self::Constraint(db_err.message().to_string())
                } else {
                    Self::Query(db_err.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut => Self::Connection("Pool timeout".to_string()),
            sqlx::Error::Io(e) => Self::Connection(e.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Decode(err.to_string())
            }
            _ => Self::Query(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.into())
    }
}

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;
