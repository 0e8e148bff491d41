//! Typed errors callers need to tell apart.
//!
//! Everything else travels as `anyhow::Error` with context strings; these
//! enums are matched or downcast where behavior depends on the variant.

use thiserror::Error;

/// Fatal construction-time misconfiguration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no required key field configured")]
    NoRequiredKeyField,

    #[error("only_pages and skip_pages are mutually exclusive")]
    ConflictingPageFilters,

    #[error("agent goal name must not be empty")]
    MissingGoal,

    #[error("agent table name must not be empty")]
    MissingTable,

    #[error("missing value for required key field '{0}'")]
    MissingKey(String),

    #[error("'{0}' is not a configured key field")]
    UnknownKey(String),

    #[error("{given} key values given but only {available} key fields are configured")]
    TooManyKeyValues { given: usize, available: usize },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure talking to the shared record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store refused a write because the target changed underneath it.
    #[error("write conflict on table '{table}': {detail}")]
    Conflict { table: String, detail: String },

    #[error("table '{0}' not found")]
    TableNotFound(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn conflict(table: &str, detail: impl Into<String>) -> Self {
        Self::Conflict {
            table: table.to_string(),
            detail: detail.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Operational agent failures (as opposed to deliberate skips).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("table '{0}' not found")]
    TableNotFound(String),

    #[error("no entry in '{table}' matches {keys}")]
    EntryNotFound { table: String, keys: String },

    #[error("{count} entries in '{table}' match {keys}")]
    AmbiguousEntry {
        table: String,
        keys: String,
        count: usize,
    },
}
