//! Error types for the tool gateway.
//!
//! Uses `thiserror` for ergonomic error definitions with automatic `From` conversions.
//! [`ErrorKind`] is the flat classification recorded in invocation records; the
//! dispatcher retries only kinds reported as transient.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use thiserror::Error;

/// Main error type for the gateway.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Duplicate tool name: {0}")]
    DuplicateToolName(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Network timeout after {0}ms")]
    NetworkTimeout(u64),

    #[error("HTTP call failed: {0}")]
    Http(String),

    #[error("Completion request failed: {0}")]
    Completion(String),

    #[error("Tool execution failed: {0}")]
    Tool(String),

    #[error("Request deadline exceeded after {0}ms")]
    DeadlineExceeded(u64),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: Cow<'static, str> },
}

/// Database-related errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Statement timeout after {0}ms")]
    Timeout(u64),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Transaction is {0}, no further statements accepted")]
    TransactionClosed(&'static str),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(Cow<'static, str>),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        field: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),
}

/// Flat error classification recorded in invocation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    UnknownTool,
    PoolExhausted,
    QueryError,
    NetworkTimeout,
    ToolError,
    UnknownTable,
    Timeout,
    Internal,
}

impl AgentError {
    /// Classification used for ledger records and retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::UnknownTool(_) | Self::DuplicateToolName(_) => ErrorKind::UnknownTool,
            Self::Database(DatabaseError::PoolExhausted) => ErrorKind::PoolExhausted,
            Self::Database(DatabaseError::TableNotFound(_)) => ErrorKind::UnknownTable,
            Self::Database(DatabaseError::Timeout(_)) => ErrorKind::Timeout,
            Self::Database(_) => ErrorKind::QueryError,
            Self::NetworkTimeout(_) => ErrorKind::NetworkTimeout,
            Self::Http(_) | Self::Completion(_) | Self::Tool(_) => ErrorKind::ToolError,
            Self::DeadlineExceeded(_) => ErrorKind::Timeout,
            Self::Config(_) | Self::Json(_) | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Transient errors may be retried by the dispatcher; everything else is
    /// terminal on first occurrence.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PoolExhausted | ErrorKind::NetworkTimeout
        )
    }
}

/// Result type alias for AgentError.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Result type alias for DatabaseError.
pub type DbResult<T> = std::result::Result<T, DatabaseError>;
