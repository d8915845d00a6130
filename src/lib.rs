//! Provision SDK: discovers collection descriptors from feature modules, reconciles them with the
//! database (collections, validators, unique and general indexes) and issues sequential codes.

pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod migration;
pub mod service;
pub mod store;

pub use config::{Collation, Counter, IndexDescriptor, IndexOptions, SchemaDescriptor, Settings};
pub use db::{DocumentStore, MemoryDatabase, PgDatabase, PgSession, SchemaAdmin};
pub use discovery::{discover, FsTreeReader, JsonFileProvider, SchemaProvider, SchemaRegistry};
pub use error::{AppError, ConfigError, CounterError, DbError, DiscoveryError, ReconcileError, ReconcileStep};
pub use migration::{reconcile, CancelFlag, ReconcileMode, ReconcileReport, Reconciler};
pub use service::{generate, CodeGenerator, CountersSchema};
pub use store::ensure_database_exists;
