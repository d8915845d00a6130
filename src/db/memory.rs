//! In-process backend. Honors the same contract as PostgreSQL: strict collection creation,
//! validator enforcement on insert, unique and partial-unique indexes, collation-aware
//! comparison and atomic increments (one lock around all state).

use crate::config::Collation;
use crate::db::{field_value, DocumentStore, Filter, IndexKind, IndexRequest, SchemaAdmin};
use crate::error::DbError;
use crate::service::DocumentValidator;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

#[derive(Debug)]
struct MemCollection {
    collation: Collation,
    validator: Option<Value>,
    indexes: Vec<IndexRequest>,
    docs: Vec<Value>,
}

impl MemCollection {
    /// Comparable form of a value under the collection's collation.
    fn normalize(&self, v: &Value) -> Value {
        match v {
            Value::String(s) if self.collation.case_insensitive() => Value::String(s.to_lowercase()),
            other => other.clone(),
        }
    }

    /// Index key for `doc`, or `None` when the index does not cover it.
    fn index_key(&self, index: &IndexRequest, doc: &Value) -> Option<Vec<Option<Value>>> {
        let key: Vec<Option<Value>> = index
            .field_names()
            .iter()
            .map(|f| field_value(doc, f).map(|v| self.normalize(v)))
            .collect();
        let covers_all = key.iter().all(Option::is_some);
        match index.kind {
            IndexKind::Unique => Some(key),
            IndexKind::PartialUnique if covers_all => Some(key),
            _ => None,
        }
    }

    fn check_unique(&self, pending: &[Value], doc: &Value, collection: &str) -> Result<(), DbError> {
        for index in &self.indexes {
            let Some(key) = self.index_key(index, doc) else {
                continue;
            };
            let clash = self
                .docs
                .iter()
                .chain(pending.iter())
                .any(|other| self.index_key(index, other).as_ref() == Some(&key));
            if clash {
                return Err(DbError::DuplicateKey {
                    collection: collection.to_string(),
                    index: index.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn matches(&self, doc: &Value, filter: &Filter) -> bool {
        filter.iter().all(|(field, expected)| {
            let actual = field_value(doc, field).cloned().unwrap_or(Value::Null);
            self.normalize(&actual) == self.normalize(expected)
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryDatabase {
    collections: Mutex<HashMap<String, MemCollection>>,
    ddl: AtomicU64,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of collection and index creations performed so far.
    pub fn ddl_count(&self) -> u64 {
        self.ddl.load(Ordering::SeqCst)
    }

    pub async fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn documents(&self, collection: &str) -> Result<Vec<Value>, DbError> {
        let guard = self.collections.lock().await;
        let c = guard
            .get(collection)
            .ok_or_else(|| DbError::CollectionNotFound(collection.to_string()))?;
        Ok(c.docs.clone())
    }
}

#[async_trait]
impl DocumentStore for MemoryDatabase {
    async fn insert_many(&self, collection: &str, docs: &[Value]) -> Result<u64, DbError> {
        let mut guard = self.collections.lock().await;
        let c = guard
            .get_mut(collection)
            .ok_or_else(|| DbError::CollectionNotFound(collection.to_string()))?;
        let mut pending: Vec<Value> = Vec::with_capacity(docs.len());
        for doc in docs {
            if let Some(schema) = &c.validator {
                DocumentValidator::validate(doc, schema).map_err(|message| DbError::Validation {
                    collection: collection.to_string(),
                    message,
                })?;
            }
            c.check_unique(&pending, doc, collection)?;
            let mut doc = doc.clone();
            if let Value::Object(obj) = &mut doc {
                obj.entry("_id")
                    .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
            }
            pending.push(doc);
        }
        let count = pending.len() as u64;
        c.docs.extend(pending);
        Ok(count)
    }

    async fn delete_all(&self, collection: &str) -> Result<u64, DbError> {
        let mut guard = self.collections.lock().await;
        let c = guard
            .get_mut(collection)
            .ok_or_else(|| DbError::CollectionNotFound(collection.to_string()))?;
        let count = c.docs.len() as u64;
        c.docs.clear();
        Ok(count)
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>, DbError> {
        let guard = self.collections.lock().await;
        let c = guard
            .get(collection)
            .ok_or_else(|| DbError::CollectionNotFound(collection.to_string()))?;
        Ok(c.docs.iter().find(|d| c.matches(d, filter)).cloned())
    }

    async fn increment(
        &self,
        collection: &str,
        filter: &Filter,
        field: &str,
        amount: i64,
    ) -> Result<Option<Value>, DbError> {
        let mut guard = self.collections.lock().await;
        let c = guard
            .get_mut(collection)
            .ok_or_else(|| DbError::CollectionNotFound(collection.to_string()))?;
        let Some(pos) = c.docs.iter().position(|d| c.matches(d, filter)) else {
            return Ok(None);
        };
        let not_a_number = || DbError::NotANumber {
            collection: collection.to_string(),
            field: field.to_string(),
        };
        let doc = &mut c.docs[pos];
        let current = match doc.get(field) {
            None | Some(Value::Null) => 0,
            Some(v) => v.as_i64().ok_or_else(not_a_number)?,
        };
        let next = current.checked_add(amount).ok_or_else(not_a_number)?;
        match doc {
            Value::Object(obj) => {
                obj.insert(field.to_string(), Value::from(next));
            }
            _ => return Err(not_a_number()),
        }
        Ok(Some(doc.clone()))
    }
}

#[async_trait]
impl SchemaAdmin for MemoryDatabase {
    async fn collection_exists(&self, name: &str) -> Result<bool, DbError> {
        Ok(self.collections.lock().await.contains_key(name))
    }

    async fn create_collection(&self, name: &str, collation: &Collation) -> Result<(), DbError> {
        let mut guard = self.collections.lock().await;
        if guard.contains_key(name) {
            return Err(DbError::Validation {
                collection: name.to_string(),
                message: "collection already exists".into(),
            });
        }
        guard.insert(
            name.to_string(),
            MemCollection {
                collation: collation.clone(),
                validator: None,
                indexes: Vec::new(),
                docs: Vec::new(),
            },
        );
        self.ddl.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_validator(&self, name: &str, schema: &Value) -> Result<(), DbError> {
        let mut guard = self.collections.lock().await;
        let c = guard
            .get_mut(name)
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))?;
        c.validator = Some(schema.clone());
        Ok(())
    }

    async fn validator(&self, name: &str) -> Result<Option<Value>, DbError> {
        let guard = self.collections.lock().await;
        let c = guard
            .get(name)
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))?;
        Ok(c.validator.clone())
    }

    async fn create_index(&self, collection: &str, index: &IndexRequest) -> Result<bool, DbError> {
        let mut guard = self.collections.lock().await;
        if !guard.contains_key(collection) {
            return Err(DbError::CollectionNotFound(collection.to_string()));
        }
        // Index names share one namespace across collections, as in a PostgreSQL schema.
        for (owner, other) in guard.iter() {
            let Some(existing) = other.indexes.iter().find(|i| i.name == index.name) else {
                continue;
            };
            if owner == collection && existing.same_definition(index) {
                return Ok(false);
            }
            return Err(DbError::IndexConflict {
                collection: collection.to_string(),
                index: index.name.clone(),
                existing: format!("{:?} index on {} ({})", existing.kind, owner, existing.describe()),
            });
        }
        let c = guard
            .get_mut(collection)
            .ok_or_else(|| DbError::CollectionNotFound(collection.to_string()))?;
        // Building a unique index over existing duplicates fails, as it does in PostgreSQL.
        let mut seen: Vec<Vec<Option<Value>>> = Vec::new();
        for doc in &c.docs {
            if let Some(key) = c.index_key(index, doc) {
                if seen.contains(&key) {
                    return Err(DbError::DuplicateKey {
                        collection: collection.to_string(),
                        index: index.name.clone(),
                    });
                }
                seen.push(key);
            }
        }
        c.indexes.push(index.clone());
        self.ddl.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn index_names(&self, collection: &str) -> Result<Vec<String>, DbError> {
        let guard = self.collections.lock().await;
        let c = guard
            .get(collection)
            .ok_or_else(|| DbError::CollectionNotFound(collection.to_string()))?;
        let mut names: Vec<String> = c.indexes.iter().map(|i| i.name.clone()).collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn with_collection(name: &str) -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.create_collection(name, &Collation::default()).await.unwrap();
        db
    }

    #[tokio::test]
    async fn unique_index_treats_missing_fields_as_equal() {
        let db = with_collection("customers").await;
        db.create_unique_index("customers", &["code".to_string()]).await.unwrap();
        db.insert_many("customers", &[json!({ "name": "a" })]).await.unwrap();
        let err = db
            .insert_many("customers", &[json!({ "name": "b" })])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn collation_makes_unique_case_insensitive() {
        let db = with_collection("users").await;
        db.create_unique_index("users", &["email".to_string()]).await.unwrap();
        db.insert_many("users", &[json!({ "email": "Ana@Example.test" })])
            .await
            .unwrap();
        assert!(db
            .insert_many("users", &[json!({ "email": "ana@example.test" })])
            .await
            .is_err());
        let found = db
            .find_one("users", &[("email".to_string(), json!("ANA@EXAMPLE.TEST"))])
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn batch_insert_is_all_or_nothing() {
        let db = with_collection("items").await;
        db.create_unique_index("items", &["sku".to_string()]).await.unwrap();
        let r = db
            .insert_many("items", &[json!({ "sku": "x" }), json!({ "sku": "x" })])
            .await;
        assert!(r.is_err());
        assert!(db.documents("items").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn validator_is_enforced_on_insert() {
        let db = with_collection("items").await;
        db.update_validator("items", &json!({ "required": ["sku"] }))
            .await
            .unwrap();
        let err = db.insert_many("items", &[json!({})]).await.unwrap_err();
        assert!(matches!(err, DbError::Validation { .. }));
    }

    #[tokio::test]
    async fn increment_rejects_non_integer_field() {
        let db = with_collection("counters").await;
        db.insert_many("counters", &[json!({ "name": "x", "seq": "abc" })])
            .await
            .unwrap();
        let err = db
            .increment("counters", &[("name".to_string(), json!("x"))], "seq", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotANumber { .. }));
    }

    #[tokio::test]
    async fn same_index_name_with_other_definition_is_a_conflict() {
        let db = with_collection("c").await;
        assert!(db.create_index("c", &IndexRequest::unique("c", &["a.b".to_string()])).await.unwrap());
        assert!(!db.create_index("c", &IndexRequest::unique("c", &["a.b".to_string()])).await.unwrap());
        let err = db
            .create_index("c", &IndexRequest::unique("c", &["a_b".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::IndexConflict { ref index, .. } if index == "c_a_b_uniq"));
    }

    #[tokio::test]
    async fn index_names_are_shared_across_collections() {
        let db = with_collection("a_b").await;
        db.create_collection("a", &Collation::default()).await.unwrap();
        db.create_unique_index("a_b", &["c".to_string()]).await.unwrap();
        let err = db.create_unique_index("a", &["b_c".to_string()]).await.unwrap_err();
        assert!(matches!(err, DbError::IndexConflict { .. }));
    }

    #[tokio::test]
    async fn operations_on_missing_collection_fail() {
        let db = MemoryDatabase::new();
        assert!(matches!(
            db.insert_many("ghost", &[json!({})]).await,
            Err(DbError::CollectionNotFound(_))
        ));
        assert!(db.update_validator("ghost", &json!({})).await.is_err());
    }
}
