//! Document validation against a collection's structural schema.
//!
//! The schema is JSON-Schema-like, in the `$jsonSchema` dialect document databases use:
//! `bsonType`/`type`, `required`, `properties`, `items`, `enum`, `minimum`, `maximum`,
//! `minLength`, `maxLength`, `pattern` and `additionalProperties: false`. `description`
//! and unknown keywords are ignored.

use regex::Regex;
use serde_json::{Map, Value};

pub struct DocumentValidator;

impl DocumentValidator {
    /// Validate a whole document. Returns the first violation as a message naming the field path.
    pub fn validate(doc: &Value, schema: &Value) -> Result<(), String> {
        let schema = schema.get("$jsonSchema").unwrap_or(schema);
        validate_node("", doc, schema)
    }
}

fn validate_node(path: &str, v: &Value, schema: &Value) -> Result<(), String> {
    let Some(rules) = schema.as_object() else {
        return Ok(());
    };
    let label = if path.is_empty() { "document" } else { path };

    if let Some(types) = rules.get("bsonType").or_else(|| rules.get("type")) {
        check_type(label, v, types)?;
    }
    if let Some(Value::Array(allowed)) = rules.get("enum") {
        if !allowed.iter().any(|a| value_eq(v, a)) {
            return Err(format!(
                "{} must be one of: {:?}",
                label,
                allowed.iter().take(5).collect::<Vec<_>>()
            ));
        }
    }
    if let Some(n) = v.as_f64() {
        if let Some(min) = rules.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(format!("{} must be at least {}", label, min));
            }
        }
        if let Some(max) = rules.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(format!("{} must be at most {}", label, max));
            }
        }
    }
    if let Some(s) = v.as_str() {
        let len = s.chars().count() as u64;
        if let Some(min) = rules.get("minLength").and_then(Value::as_u64) {
            if len < min {
                return Err(format!("{} must be at least {} characters", label, min));
            }
        }
        if let Some(max) = rules.get("maxLength").and_then(Value::as_u64) {
            if len > max {
                return Err(format!("{} must be at most {} characters", label, max));
            }
        }
        if let Some(pattern) = rules.get("pattern").and_then(Value::as_str) {
            let re = Regex::new(pattern).map_err(|_| format!("invalid pattern for {}", label))?;
            if !re.is_match(s) {
                return Err(format!("{} does not match required pattern", label));
            }
        }
    }
    if let Value::Object(obj) = v {
        validate_object(path, obj, rules)?;
    }
    if let (Value::Array(items), Some(item_schema)) = (v, rules.get("items")) {
        for (i, item) in items.iter().enumerate() {
            validate_node(&format!("{}[{}]", label, i), item, item_schema)?;
        }
    }
    Ok(())
}

fn validate_object(path: &str, obj: &Map<String, Value>, rules: &Map<String, Value>) -> Result<(), String> {
    let child = |field: &str| {
        if path.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", path, field)
        }
    };
    if let Some(Value::Array(required)) = rules.get("required") {
        for field in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(field) {
                return Err(format!("{} is required", child(field)));
            }
        }
    }
    let properties = rules.get("properties").and_then(Value::as_object);
    if let Some(props) = properties {
        for (field, field_schema) in props {
            if let Some(fv) = obj.get(field) {
                validate_node(&child(field), fv, field_schema)?;
            }
        }
    }
    if rules.get("additionalProperties") == Some(&Value::Bool(false)) {
        for field in obj.keys() {
            let declared = properties.map(|p| p.contains_key(field)).unwrap_or(false);
            if !declared && field != "_id" {
                return Err(format!("{} is not an allowed field", child(field)));
            }
        }
    }
    Ok(())
}

fn check_type(label: &str, v: &Value, types: &Value) -> Result<(), String> {
    let names: Vec<&str> = match types {
        Value::String(s) => vec![s.as_str()],
        Value::Array(a) => a.iter().filter_map(Value::as_str).collect(),
        _ => return Ok(()),
    };
    let mut matched = false;
    for name in &names {
        matched |= match *name {
            "string" | "objectId" => v.is_string(),
            "int" | "long" | "integer" => v.is_i64() || v.is_u64(),
            "double" | "number" | "decimal" => v.is_number(),
            "bool" | "boolean" => v.is_boolean(),
            "object" => v.is_object(),
            "array" => v.is_array(),
            "null" => v.is_null(),
            "date" => v.as_str().map(is_date).unwrap_or(false),
            other => return Err(format!("{} declares unsupported type '{}'", label, other)),
        };
    }
    if matched {
        Ok(())
    } else {
        Err(format!("{} must be of type {}", label, names.join(" or ")))
    }
}

fn is_date(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
        || chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(n), Value::Number(m)) => n.as_f64() == m.as_f64(),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn customer_schema() -> Value {
        json!({
            "bsonType": "object",
            "required": ["name", "email"],
            "properties": {
                "name": { "bsonType": "string", "description": "display name", "minLength": 1 },
                "email": { "bsonType": "string", "pattern": "^[^@]+@[^@]+$" },
                "tier": { "enum": ["gold", "silver"] },
                "credit": { "bsonType": ["double", "int"], "minimum": 0 },
                "since": { "bsonType": "date" },
                "tags": { "bsonType": "array", "items": { "bsonType": "string" } },
                "address": {
                    "bsonType": "object",
                    "required": ["city"],
                    "properties": { "city": { "bsonType": "string" } }
                }
            }
        })
    }

    #[test]
    fn accepts_valid_document() {
        let doc = json!({
            "name": "Acme",
            "email": "ops@acme.test",
            "tier": "gold",
            "credit": 10.5,
            "since": "2024-01-15",
            "tags": ["b2b"],
            "address": { "city": "Lyon" }
        });
        assert!(DocumentValidator::validate(&doc, &customer_schema()).is_ok());
    }

    #[test]
    fn reports_first_violation_with_path() {
        let schema = customer_schema();
        let missing = json!({ "name": "Acme" });
        assert_eq!(
            DocumentValidator::validate(&missing, &schema).unwrap_err(),
            "email is required"
        );
        let nested = json!({ "name": "Acme", "email": "a@b", "address": {} });
        assert_eq!(
            DocumentValidator::validate(&nested, &schema).unwrap_err(),
            "address.city is required"
        );
        let item = json!({ "name": "Acme", "email": "a@b", "tags": ["ok", 3] });
        assert_eq!(
            DocumentValidator::validate(&item, &schema).unwrap_err(),
            "tags[1] must be of type string"
        );
    }

    #[test]
    fn checks_bounds_enum_and_pattern() {
        let schema = customer_schema();
        for doc in [
            json!({ "name": "", "email": "a@b" }),
            json!({ "name": "A", "email": "nope" }),
            json!({ "name": "A", "email": "a@b", "tier": "bronze" }),
            json!({ "name": "A", "email": "a@b", "credit": -1 }),
            json!({ "name": "A", "email": "a@b", "since": "yesterday" }),
        ] {
            assert!(DocumentValidator::validate(&doc, &schema).is_err(), "{}", doc);
        }
    }

    #[test]
    fn json_schema_wrapper_and_closed_objects() {
        let schema = json!({
            "$jsonSchema": {
                "type": "object",
                "properties": { "a": { "type": "integer" } },
                "additionalProperties": false
            }
        });
        assert!(DocumentValidator::validate(&json!({ "a": 1, "_id": "x" }), &schema).is_ok());
        assert_eq!(
            DocumentValidator::validate(&json!({ "a": 1, "b": 2 }), &schema).unwrap_err(),
            "b is not an allowed field"
        );
    }

    #[test]
    fn empty_schema_accepts_anything() {
        assert!(DocumentValidator::validate(&json!({ "x": [1, {}] }), &json!({})).is_ok());
    }
}
