//! Database handle seams: document operations and administrative (DDL) operations.
//! `postgres` is the production backend; `memory` runs the same contract in-process.

pub mod memory;
pub mod postgres;

use crate::config::{Collation, IndexDescriptor, IndexField, IndexOptions, SchemaDescriptor};
use crate::error::{DbError, ReconcileStep};
use async_trait::async_trait;
use serde_json::Value;

pub use memory::MemoryDatabase;
pub use postgres::{PgDatabase, PgSession};

/// Equality filter: every `(field, value)` pair must match the value at that dotted field path.
pub type Filter = [(String, Value)];

/// Document-level operations on a named collection.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert documents, enforcing the collection's validator and unique indexes. Returns count inserted.
    async fn insert_many(&self, collection: &str, docs: &[Value]) -> Result<u64, DbError>;

    async fn delete_all(&self, collection: &str) -> Result<u64, DbError>;

    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>, DbError>;

    /// Atomically add `amount` to the integer `field` of the first document matching `filter`
    /// and return the document as it is after the update. `None` when nothing matched.
    async fn increment(
        &self,
        collection: &str,
        filter: &Filter,
        field: &str,
        amount: i64,
    ) -> Result<Option<Value>, DbError>;
}

/// Administrative operations used by the reconciler.
#[async_trait]
pub trait SchemaAdmin: Send + Sync {
    async fn collection_exists(&self, name: &str) -> Result<bool, DbError>;

    async fn create_collection(&self, name: &str, collation: &Collation) -> Result<(), DbError>;

    /// Replace the collection's validator with `schema`. Never merges with a prior validator.
    async fn update_validator(&self, name: &str, schema: &Value) -> Result<(), DbError>;

    async fn validator(&self, name: &str) -> Result<Option<Value>, DbError>;

    /// Create the index unless one with the same name exists. Returns true when it was created.
    async fn create_index(&self, collection: &str, index: &IndexRequest) -> Result<bool, DbError>;

    async fn index_names(&self, collection: &str) -> Result<Vec<String>, DbError>;

    async fn create_unique_index(&self, collection: &str, fields: &[String]) -> Result<bool, DbError> {
        self.create_index(collection, &IndexRequest::unique(collection, fields))
            .await
    }

    async fn create_partial_unique_index(&self, collection: &str, fields: &[String]) -> Result<bool, DbError> {
        self.create_index(collection, &IndexRequest::partial_unique(collection, fields))
            .await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    Plain,
    /// Unique across all documents; a missing field counts as null and collides with other nulls.
    Unique,
    /// Unique among documents where every indexed field is non-null.
    PartialUnique,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IndexRequest {
    pub name: String,
    pub fields: Vec<IndexField>,
    pub kind: IndexKind,
    pub options: IndexOptions,
}

impl IndexRequest {
    pub fn unique(collection: &str, fields: &[String]) -> Self {
        IndexRequest {
            name: index_name(collection, fields, "uniq"),
            fields: fields.iter().cloned().map(IndexField::Name).collect(),
            kind: IndexKind::Unique,
            options: IndexOptions::default(),
        }
    }

    pub fn partial_unique(collection: &str, fields: &[String]) -> Self {
        IndexRequest {
            name: index_name(collection, fields, "uniq_partial"),
            fields: fields.iter().cloned().map(IndexField::Name).collect(),
            kind: IndexKind::PartialUnique,
            options: IndexOptions::default(),
        }
    }

    /// General index; the caller's `options.name` wins over the derived name.
    pub fn from_descriptor(collection: &str, index: &IndexDescriptor) -> Self {
        let name = match &index.options.name {
            Some(n) if !n.is_empty() => n.clone(),
            _ => {
                let parts: Vec<String> = index
                    .spec
                    .iter()
                    .map(|f| match f.direction() {
                        crate::config::IndexDirection::Asc => f.name().to_string(),
                        crate::config::IndexDirection::Desc => format!("{}_desc", f.name()),
                    })
                    .collect();
                index_name(collection, &parts, "idx")
            }
        };
        IndexRequest {
            name,
            fields: index.spec.clone(),
            kind: IndexKind::Plain,
            options: index.options.clone(),
        }
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(IndexField::name).collect()
    }

    /// Same kind over the same fields in the same order and directions. Names and options are not compared.
    pub fn same_definition(&self, other: &IndexRequest) -> bool {
        self.kind == other.kind
            && self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(&other.fields)
                .all(|(a, b)| a.name() == b.name() && a.direction() == b.direction())
    }

    /// Human-readable spec for progress logs, e.g. `customer, date desc`.
    pub fn describe(&self) -> String {
        self.fields
            .iter()
            .map(|f| match f.direction() {
                crate::config::IndexDirection::Asc => f.name().to_string(),
                crate::config::IndexDirection::Desc => format!("{} desc", f.name()),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Index requests for a descriptor in unique, partial-unique, general order; empty field lists skipped.
pub fn index_requests(d: &SchemaDescriptor) -> Vec<(ReconcileStep, IndexRequest)> {
    let name = d.collection.as_str();
    let mut jobs = Vec::new();
    for fields in d.unique.iter().filter(|f| !f.is_empty()) {
        jobs.push((ReconcileStep::CreateUniqueIndex, IndexRequest::unique(name, fields)));
    }
    for fields in d.unique_if_exists.iter().filter(|f| !f.is_empty()) {
        jobs.push((
            ReconcileStep::CreatePartialUniqueIndex,
            IndexRequest::partial_unique(name, fields),
        ));
    }
    for idx in d.indexes.iter().filter(|i| !i.spec.is_empty()) {
        jobs.push((ReconcileStep::CreateIndex, IndexRequest::from_descriptor(name, idx)));
    }
    jobs
}

const MAX_IDENTIFIER_LEN: usize = 63;

/// Deterministic index name `<collection>_<fields>_<suffix>`, shortened with a stable
/// hash suffix when it would exceed PostgreSQL's identifier limit.
pub fn index_name(collection: &str, fields: &[String], suffix: &str) -> String {
    let raw = format!("{}_{}_{}", collection, fields.join("_"), suffix);
    let name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.len() <= MAX_IDENTIFIER_LEN {
        return name;
    }
    format!("{}_{:08x}", &name[..50], fnv1a(raw.as_bytes()) as u32)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Value at a dotted field path (`address.city`), treating explicit null as absent.
pub(crate) fn field_value<'a>(doc: &'a Value, field: &str) -> Option<&'a Value> {
    field
        .split('.')
        .try_fold(doc, |v, part| v.get(part))
        .filter(|v| !v.is_null())
}
