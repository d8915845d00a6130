//! Descriptor and counter types matching the JSON layout of `schema.json` files and the `counters` collection.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// One managed collection: structural validator, uniqueness constraints and secondary indexes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub collection: String,
    #[serde(default = "empty_object")]
    pub schema: Value,
    /// Compound keys unique across all documents; a missing field counts as null.
    #[serde(default)]
    pub unique: Vec<Vec<String>>,
    /// Compound keys unique only among documents where every listed field is present and non-null.
    #[serde(default, rename = "uniqueIfExists", alias = "unique_if_exists")]
    pub unique_if_exists: Vec<Vec<String>>,
    #[serde(default)]
    pub indexes: Vec<IndexDescriptor>,
}

impl SchemaDescriptor {
    pub fn new(collection: impl Into<String>, schema: Value) -> Self {
        SchemaDescriptor {
            collection: collection.into(),
            schema,
            unique: Vec::new(),
            unique_if_exists: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn with_unique(mut self, fields: &[&str]) -> Self {
        self.unique.push(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn with_unique_if_exists(mut self, fields: &[&str]) -> Self {
        self.unique_if_exists
            .push(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn with_index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.push(index);
        self
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub spec: Vec<IndexField>,
    #[serde(default)]
    pub options: IndexOptions,
}

impl IndexDescriptor {
    pub fn on(fields: &[&str]) -> Self {
        IndexDescriptor {
            spec: fields.iter().map(|f| IndexField::Name(f.to_string())).collect(),
            options: IndexOptions::default(),
        }
    }

    /// Field names in spec order, directions dropped.
    pub fn field_names(&self) -> Vec<String> {
        self.spec.iter().map(|f| f.name().to_string()).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexField {
    Name(String),
    Spec {
        name: String,
        #[serde(default)]
        direction: Option<IndexDirection>,
    },
}

impl IndexField {
    pub fn name(&self) -> &str {
        match self {
            IndexField::Name(n) => n,
            IndexField::Spec { name, .. } => name,
        }
    }

    pub fn direction(&self) -> IndexDirection {
        match self {
            IndexField::Name(_) => IndexDirection::Asc,
            IndexField::Spec { direction, .. } => direction.unwrap_or(IndexDirection::Asc),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexDirection {
    Asc,
    Desc,
}

impl IndexDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            IndexDirection::Asc => "ASC",
            IndexDirection::Desc => "DESC",
        }
    }
}

impl Serialize for IndexDirection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            IndexDirection::Asc => serializer.serialize_i8(1),
            IndexDirection::Desc => serializer.serialize_i8(-1),
        }
    }
}

impl<'de> Deserialize<'de> for IndexDirection {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = Value::deserialize(deserializer)?;
        match &v {
            Value::Number(n) if n.as_i64() == Some(1) => Ok(IndexDirection::Asc),
            Value::Number(n) if n.as_i64() == Some(-1) => Ok(IndexDirection::Desc),
            Value::String(s) if s.eq_ignore_ascii_case("asc") => Ok(IndexDirection::Asc),
            Value::String(s) if s.eq_ignore_ascii_case("desc") => Ok(IndexDirection::Desc),
            other => Err(serde::de::Error::custom(format!(
                "index direction must be 1, -1, \"asc\" or \"desc\"; got {}",
                other
            ))),
        }
    }
}

/// Driver-level index options. Unknown keys are kept in `extra` and handed to the backend unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexOptions {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    /// Index only documents where every indexed field is present.
    #[serde(default)]
    pub sparse: bool,
    #[serde(default, rename = "where")]
    pub where_: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Comparison rules for a collection. Strength 2 compares letters case-insensitively
/// while still distinguishing base letters and diacritics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collation {
    pub locale: String,
    pub strength: u8,
}

impl Default for Collation {
    fn default() -> Self {
        Collation {
            locale: "en".into(),
            strength: 2,
        }
    }
}

impl Collation {
    /// Identifier used for the database collation object, e.g. `en_level2`.
    pub fn object_name(&self) -> String {
        let locale: String = self
            .locale
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        format!("{}_level{}", locale, self.strength)
    }

    /// ICU locale string with the comparison level keyword.
    pub fn icu_locale(&self) -> String {
        format!("{}-u-ks-level{}", self.locale, self.strength)
    }

    /// Case is ignored at strengths 1 and 2.
    pub fn case_insensitive(&self) -> bool {
        self.strength <= 2
    }
}

/// A named, persisted sequence in the `counters` collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub name: String,
    #[serde(default)]
    pub template: String,
    /// Last issued value; the next code uses `seq + 1`.
    #[serde(default)]
    pub seq: i64,
    #[serde(default)]
    pub seq_pad: usize,
}
