//! Error types for the incident engine.
//!
//! Split by subsystem so callers can match on the failure domain. Anything
//! affecting the correctness of an incident record propagates; best-effort
//! audit/log writes are warned and swallowed at the call site instead.

use thiserror::Error;

/// Configuration resolution errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration key: {key}")]
    MissingKey { key: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// State store errors. `NotFound` is a distinct, checkable condition: a
/// targeted update that affected zero rows, as opposed to a driver failure.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
}

impl DatabaseError {
    /// Whether this error is the zero-rows-affected condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DatabaseError::NotFound { .. })
    }
}

impl From<tokio_postgres::Error> for DatabaseError {
    fn from(e: tokio_postgres::Error) -> Self {
        DatabaseError::Query(e.to_string())
    }
}

/// Investigator subprocess launch/wait errors.
///
/// A non-zero exit code is NOT an error here; it is a normal result that the
/// output validator classifies. These variants cover the cases where the
/// process could not be run or observed at all.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn investigator: {reason}")]
    Spawn { reason: String },

    #[error("failed to capture investigator {stream}")]
    Pipe { stream: &'static str },

    #[error("failed waiting for investigator: {reason}")]
    Wait { reason: String },
}

/// Workspace provisioning errors.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace directory {path}: {reason}")]
    Create { path: String, reason: String },

    #[error("failed to write incident context {path}: {reason}")]
    WriteContext { path: String, reason: String },

    #[error("failed to read report {path}: {reason}")]
    ReadReport { path: String, reason: String },
}

/// Top-level error for the orchestrator pipeline and CLI.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}
