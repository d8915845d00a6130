//! Descriptor validation: shape of each descriptor and uniqueness of collection names.

use crate::config::SchemaDescriptor;
use crate::db::index_requests;
use crate::error::DiscoveryError;
use std::collections::{HashMap, HashSet};

pub fn validate_descriptor(d: &SchemaDescriptor) -> Result<(), DiscoveryError> {
    let invalid = |reason: String| DiscoveryError::InvalidDescriptor {
        collection: d.collection.clone(),
        reason,
    };
    if d.collection.trim().is_empty() {
        return Err(invalid("collection name is empty".into()));
    }
    if !d.schema.is_object() {
        return Err(invalid("schema must be a JSON object".into()));
    }

    for keys in [&d.unique, &d.unique_if_exists] {
        check_keys(keys).map_err(invalid)?;
    }

    for idx in &d.indexes {
        if idx.spec.iter().any(|f| f.name().is_empty()) {
            return Err(invalid("empty field name in index spec".into()));
        }
    }

    // Index names are derived from sanitized field paths, so `a.b` and `a_b` meet.
    let mut names = HashSet::new();
    for (_, req) in index_requests(d) {
        if !names.insert(req.name.clone()) {
            return Err(invalid(format!(
                "two index entries resolve to the same index name '{}'",
                req.name
            )));
        }
    }
    Ok(())
}

/// Keys within one list must not repeat a field nor repeat each other.
fn check_keys(keys: &[Vec<String>]) -> Result<(), String> {
    let mut seen_keys: HashSet<Vec<&str>> = HashSet::new();
    for key in keys {
        let mut fields = HashSet::new();
        for f in key {
            if f.is_empty() {
                return Err("empty field name in unique key".into());
            }
            if !fields.insert(f.as_str()) {
                return Err(format!("field '{}' repeated in unique key {:?}", f, key));
            }
        }
        if key.is_empty() {
            continue;
        }
        let mut sorted: Vec<&str> = key.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        if !seen_keys.insert(sorted) {
            return Err(format!("unique key {:?} declared more than once", key));
        }
    }
    Ok(())
}

/// Validate every descriptor and reject a collection declared twice. `owners` names the
/// module each descriptor came from, in the same order.
pub fn validate_all(descriptors: &[SchemaDescriptor], owners: &[String]) -> Result<(), DiscoveryError> {
    let mut by_collection: HashMap<&str, &str> = HashMap::new();
    for (i, d) in descriptors.iter().enumerate() {
        validate_descriptor(d)?;
        let owner = owners.get(i).map(String::as_str).unwrap_or("<unknown>");
        if let Some(first) = by_collection.insert(d.collection.as_str(), owner) {
            return Err(DiscoveryError::DuplicateCollection {
                collection: d.collection.clone(),
                first: first.to_string(),
                second: owner.to_string(),
            });
        }
    }
    Ok(())
}
