//! Sequential business codes (invoice numbers and the like) from a stored counter and a template.
//!
//! Template tokens: `<seq>` is the next sequence value zero-padded to `seq_pad` digits (never
//! truncated), `<yyyy>` the four-digit year and `<mm>` the two-digit month.
//! Every occurrence of a token is replaced; anything else passes through literally.

use crate::config::{Counter, SchemaDescriptor};
use crate::db::DocumentStore;
use crate::discovery::SchemaProvider;
use crate::error::{CounterError, DbError, DiscoveryError};
use chrono::{Datelike, NaiveDate};
use serde_json::{json, Value};

pub const COUNTERS_COLLECTION: &str = "counters";

/// Code for `counter.seq + 1` as of `as_of`. Pure: the counter is not modified.
pub fn generate(counter: &Counter, as_of: NaiveDate) -> String {
    render(&counter.template, i128::from(counter.seq) + 1, counter.seq_pad, as_of)
}

fn render(template: &str, seq: i128, seq_pad: usize, as_of: NaiveDate) -> String {
    template
        .replace("<seq>", &format!("{:0width$}", seq, width = seq_pad))
        .replace("<yyyy>", &format!("{:04}", as_of.year()))
        .replace("<mm>", &format!("{:02}", as_of.month()))
}

pub struct CodeGenerator;

impl CodeGenerator {
    /// Read a counter by name.
    pub async fn find(store: &dyn DocumentStore, name: &str) -> Result<Counter, CounterError> {
        let doc = store
            .find_one(COUNTERS_COLLECTION, &name_filter(name))
            .await?
            .ok_or_else(|| CounterError::NotFound(name.to_string()))?;
        parse_counter(name, doc)
    }

    /// The code the next issue would produce, without reserving it. Another caller may take it first.
    pub async fn preview(store: &dyn DocumentStore, name: &str, as_of: NaiveDate) -> Result<String, CounterError> {
        let counter = Self::find(store, name).await?;
        Ok(generate(&counter, as_of))
    }

    /// Atomically add `amount` to the counter's `seq`. Returns the counter after the update.
    /// Sequences only move forward: a negative `amount` is rejected before the store is touched.
    pub async fn increment(store: &dyn DocumentStore, name: &str, amount: i64) -> Result<Counter, CounterError> {
        if amount < 0 {
            return Err(CounterError::NegativeAmount {
                name: name.to_string(),
                amount,
            });
        }
        tracing::debug!(counter = %name, amount, "increment");
        let doc = store
            .increment(COUNTERS_COLLECTION, &name_filter(name), "seq", amount)
            .await?
            .ok_or_else(|| CounterError::NotFound(name.to_string()))?;
        parse_counter(name, doc)
    }

    /// Reserve and format the next code in one atomic step: the increment returns the new
    /// value, so no other caller can observe or issue the same sequence number.
    pub async fn next_code(store: &dyn DocumentStore, name: &str, as_of: NaiveDate) -> Result<String, CounterError> {
        let counter = Self::increment(store, name, 1).await?;
        let code = render(&counter.template, i128::from(counter.seq), counter.seq_pad, as_of);
        tracing::info!(counter = %name, seq = counter.seq, code = %code, "issued code");
        Ok(code)
    }

    /// Insert counters whose names are not stored yet. Existing counters keep their `seq`.
    /// Returns the number inserted.
    pub async fn seed(store: &dyn DocumentStore, counters: &[Counter]) -> Result<u64, CounterError> {
        let mut inserted = 0;
        for c in counters {
            if store
                .find_one(COUNTERS_COLLECTION, &name_filter(&c.name))
                .await?
                .is_some()
            {
                tracing::debug!(counter = %c.name, "already seeded");
                continue;
            }
            let doc = serde_json::to_value(c).map_err(|e| CounterError::Malformed {
                name: c.name.clone(),
                reason: e.to_string(),
            })?;
            match store.insert_many(COUNTERS_COLLECTION, &[doc]).await {
                Ok(n) => inserted += n,
                // Seeded concurrently by another process.
                Err(DbError::DuplicateKey { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(inserted)
    }

    /// Descriptor for the `counters` collection.
    pub fn counters_descriptor() -> SchemaDescriptor {
        SchemaDescriptor::new(
            COUNTERS_COLLECTION,
            json!({
                "bsonType": "object",
                "required": ["name", "template", "seq", "seq_pad"],
                "properties": {
                    "name": { "bsonType": "string", "description": "sequence name, e.g. sales" },
                    "template": { "bsonType": "string", "description": "code template using <seq>, <yyyy>, <mm>" },
                    "seq": { "bsonType": ["int", "long"], "minimum": 0, "description": "last issued value" },
                    "seq_pad": { "bsonType": "int", "minimum": 0, "description": "minimum digits of <seq>" }
                }
            }),
        )
        .with_unique(&["name"])
    }
}

/// Registers the `counters` collection with schema discovery.
pub struct CountersSchema;

impl SchemaProvider for CountersSchema {
    fn module(&self) -> &str {
        "counters"
    }

    fn descriptors(&self) -> Result<Vec<SchemaDescriptor>, DiscoveryError> {
        Ok(vec![CodeGenerator::counters_descriptor()])
    }
}

fn name_filter(name: &str) -> Vec<(String, Value)> {
    vec![("name".to_string(), Value::String(name.to_string()))]
}

fn parse_counter(name: &str, doc: Value) -> Result<Counter, CounterError> {
    let counter: Counter = serde_json::from_value(doc).map_err(|e| CounterError::Malformed {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    if counter.seq < 0 {
        return Err(CounterError::Malformed {
            name: name.to_string(),
            reason: format!("seq is negative ({})", counter.seq),
        });
    }
    Ok(counter)
}
