//! Typed errors for discovery, reconciliation, storage and counters.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
    #[error("config load: {0}")]
    Load(String),
}

/// Failure reported by a database backend.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("database: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("collection not found: {0}")]
    CollectionNotFound(String),
    #[error("duplicate key in {collection}: violates unique index {index}")]
    DuplicateKey { collection: String, index: String },
    #[error("document failed validation for {collection}: {message}")]
    Validation { collection: String, message: String },
    #[error("field {field} in {collection} is not an integer")]
    NotANumber { collection: String, field: String },
    #[error("index {index} for {collection} conflicts with existing {existing}")]
    IndexConflict {
        collection: String,
        index: String,
        existing: String,
    },
    #[error("metadata for {collection} is unreadable: {message}")]
    Metadata { collection: String, message: String },
    #[error("session already committed or aborted")]
    SessionClosed,
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("collection '{collection}' declared by both {first} and {second}")]
    DuplicateCollection {
        collection: String,
        first: String,
        second: String,
    },
    #[error("invalid descriptor for '{collection}': {reason}")]
    InvalidDescriptor { collection: String, reason: String },
    #[error("schema provider {module}: {message}")]
    Provider { module: String, message: String },
}

/// The step of a descriptor's reconciliation, named as in the progress log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileStep {
    CreateCollection,
    UpdateValidator,
    CreateUniqueIndex,
    CreatePartialUniqueIndex,
    CreateIndex,
}

impl fmt::Display for ReconcileStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcileStep::CreateCollection => "create collection",
            ReconcileStep::UpdateValidator => "update schema",
            ReconcileStep::CreateUniqueIndex => "create unique attribute",
            ReconcileStep::CreatePartialUniqueIndex => "create unique-if-exists attribute",
            ReconcileStep::CreateIndex => "create index attribute",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("[schema] {collection} - {step} failed: {source}")]
    Step {
        collection: String,
        step: ReconcileStep,
        #[source]
        source: DbError,
    },
    #[error("reconciliation cancelled after {completed} collection(s)")]
    Cancelled { completed: usize },
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

impl ReconcileError {
    /// Collection the failure belongs to, when it belongs to one.
    pub fn collection(&self) -> Option<&str> {
        match self {
            ReconcileError::Step { collection, .. } => Some(collection),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum CounterError {
    #[error("counter not found: {0}")]
    NotFound(String),
    #[error("counter {name} is malformed: {reason}")]
    Malformed { name: String, reason: String },
    #[error("counter {name} cannot move backwards (amount {amount})")]
    NegativeAmount { name: String, amount: i64 },
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Umbrella error for the bootstrap binary.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Counter(#[from] CounterError),
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Db(DbError::Sqlx(e))
    }
}
