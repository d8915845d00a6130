//! Schema discovery: feature modules register a `SchemaProvider` with a `SchemaRegistry`,
//! either in code or as a `schema.json` file under the modules root (at most two levels deep).
//! Discovery is fail-fast: one unit that cannot be loaded aborts the whole run.

use crate::config::{validate_all, SchemaDescriptor};
use crate::error::DiscoveryError;
use serde_json::Value;
use std::path::{Path, PathBuf};

pub const SCHEMA_FILE: &str = "schema.json";
pub const MAX_DEPTH: usize = 2;

/// A feature module's collection declarations.
pub trait SchemaProvider: Send + Sync {
    /// Module name, used in error messages.
    fn module(&self) -> &str;

    fn descriptors(&self) -> Result<Vec<SchemaDescriptor>, DiscoveryError>;
}

/// Locates and reads descriptor files.
pub trait ModuleTreeReader {
    /// Paths of files named `file_name` at most `max_depth` directories below `root`, sorted.
    fn find(&self, root: &Path, file_name: &str, max_depth: usize) -> Result<Vec<PathBuf>, DiscoveryError>;

    fn read(&self, path: &Path) -> Result<String, DiscoveryError>;
}

/// `ModuleTreeReader` over the local file system.
pub struct FsTreeReader;

impl ModuleTreeReader for FsTreeReader {
    fn find(&self, root: &Path, file_name: &str, max_depth: usize) -> Result<Vec<PathBuf>, DiscoveryError> {
        let mut found = Vec::new();
        walk(root, file_name, max_depth, &mut found)?;
        found.sort();
        Ok(found)
    }

    fn read(&self, path: &Path) -> Result<String, DiscoveryError> {
        std::fs::read_to_string(path).map_err(|source| DiscoveryError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn walk(dir: &Path, file_name: &str, depth_left: usize, found: &mut Vec<PathBuf>) -> Result<(), DiscoveryError> {
    let io_err = |source| DiscoveryError::Io {
        path: dir.to_path_buf(),
        source,
    };
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_dir() {
            if depth_left > 0 {
                walk(&path, file_name, depth_left - 1, found)?;
            }
        } else if path.file_name().map_or(false, |n| n == file_name) {
            found.push(path);
        }
    }
    Ok(())
}

/// Descriptors from one `schema.json`: a single descriptor object or an array of them.
pub struct JsonFileProvider {
    module: String,
    path: PathBuf,
    source: String,
}

impl JsonFileProvider {
    pub fn new(module: impl Into<String>, path: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        JsonFileProvider {
            module: module.into(),
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SchemaProvider for JsonFileProvider {
    fn module(&self) -> &str {
        &self.module
    }

    fn descriptors(&self) -> Result<Vec<SchemaDescriptor>, DiscoveryError> {
        let parse_err = |source| DiscoveryError::Parse {
            path: self.path.clone(),
            source,
        };
        let value: Value = serde_json::from_str(&self.source).map_err(parse_err)?;
        match value {
            Value::Array(_) => serde_json::from_value(value).map_err(parse_err),
            Value::Object(_) => Ok(vec![serde_json::from_value(value).map_err(parse_err)?]),
            _ => Err(DiscoveryError::Provider {
                module: self.module.clone(),
                message: format!("{} must hold an object or an array", self.path.display()),
            }),
        }
    }
}

/// Ordered set of providers. Registration order is discovery order.
#[derive(Default)]
pub struct SchemaRegistry {
    providers: Vec<Box<dyn SchemaProvider>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: SchemaProvider + 'static>(&mut self, provider: P) -> &mut Self {
        self.providers.push(Box::new(provider));
        self
    }

    pub fn with<P: SchemaProvider + 'static>(mut self, provider: P) -> Self {
        self.register(provider);
        self
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Register one `JsonFileProvider` per `schema.json` found under `root`. Files are read now,
    /// so an unreadable file fails here rather than half-way through reconciliation.
    pub fn load_tree(&mut self, root: &Path, reader: &dyn ModuleTreeReader) -> Result<&mut Self, DiscoveryError> {
        for path in reader.find(root, SCHEMA_FILE, MAX_DEPTH)? {
            let module = module_name(root, &path);
            let source = reader.read(&path)?;
            tracing::debug!(module = %module, path = %path.display(), "schema unit");
            self.register(JsonFileProvider::new(module, path, source));
        }
        Ok(self)
    }

    /// Flatten every provider's descriptors, validating each and rejecting duplicate collections.
    pub fn descriptors(&self) -> Result<Vec<SchemaDescriptor>, DiscoveryError> {
        let mut all = Vec::new();
        let mut owners = Vec::new();
        for p in &self.providers {
            let ds = p.descriptors()?;
            owners.extend(std::iter::repeat(p.module().to_string()).take(ds.len()));
            all.extend(ds);
        }
        validate_all(&all, &owners)?;
        tracing::info!(
            "[schema] discovered {} collection(s) from {} module(s)",
            all.len(),
            self.providers.len()
        );
        Ok(all)
    }
}

/// Module name of a descriptor file: its directory relative to the root, `.` for the root itself.
fn module_name(root: &Path, path: &Path) -> String {
    path.parent()
        .and_then(|p| p.strip_prefix(root).ok())
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| ".".to_string())
}

/// Discover every descriptor under `root` on the local file system.
pub fn discover(root: &Path) -> Result<Vec<SchemaDescriptor>, DiscoveryError> {
    let mut registry = SchemaRegistry::new();
    registry.load_tree(root, &FsTreeReader)?;
    registry.descriptors()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    struct Inline(&'static str, Vec<SchemaDescriptor>);

    impl SchemaProvider for Inline {
        fn module(&self) -> &str {
            self.0
        }

        fn descriptors(&self) -> Result<Vec<SchemaDescriptor>, DiscoveryError> {
            Ok(self.1.clone())
        }
    }

    #[test]
    fn finds_units_two_levels_deep_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "stock/schema.json", r#"{ "collection": "items" }"#);
        write(
            dir.path(),
            "sales/schema.json",
            r#"[{ "collection": "invoices" }, { "collection": "customers" }]"#,
        );
        write(dir.path(), "sales/returns/schema.json", r#"{ "collection": "returns" }"#);
        write(dir.path(), "sales/returns/deep/schema.json", r#"{ "collection": "ignored" }"#);
        write(dir.path(), "stock/notes.json", r#"{ "collection": "notes" }"#);

        let names: Vec<String> = discover(dir.path())
            .unwrap()
            .into_iter()
            .map(|d| d.collection)
            .collect();
        assert_eq!(names, vec!["returns", "invoices", "customers", "items"]);
    }

    #[test]
    fn one_broken_unit_aborts_discovery() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "sales/schema.json", r#"{ "collection": "invoices" }"#);
        write(dir.path(), "stock/schema.json", r#"{ "collection": "#);
        match discover(dir.path()) {
            Err(DiscoveryError::Parse { path, .. }) => assert!(path.ends_with("stock/schema.json")),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            discover(&dir.path().join("nope")),
            Err(DiscoveryError::Io { .. })
        ));
    }

    #[test]
    fn duplicate_collection_across_modules_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "sales/schema.json", r#"{ "collection": "parties" }"#);
        write(dir.path(), "purchase/schema.json", r#"{ "collection": "parties" }"#);
        match discover(dir.path()) {
            Err(DiscoveryError::DuplicateCollection { collection, first, second }) => {
                assert_eq!(collection, "parties");
                assert_eq!(first, "purchase");
                assert_eq!(second, "sales");
            }
            other => panic!("expected duplicate error, got {:?}", other),
        }
    }

    #[test]
    fn registry_keeps_registration_order() {
        let registry = SchemaRegistry::new()
            .with(Inline("b", vec![SchemaDescriptor::new("beta", json!({}))]))
            .with(Inline("a", vec![SchemaDescriptor::new("alpha", json!({}))]));
        let names: Vec<String> = registry
            .descriptors()
            .unwrap()
            .into_iter()
            .map(|d| d.collection)
            .collect();
        assert_eq!(names, vec!["beta", "alpha"]);
    }

    #[test]
    fn scalar_file_is_a_provider_error() {
        let p = JsonFileProvider::new("x", "x/schema.json", "42");
        assert!(matches!(p.descriptors(), Err(DiscoveryError::Provider { .. })));
    }

    #[test]
    fn module_names_are_relative() {
        let root = Path::new("/srv/modules");
        assert_eq!(module_name(root, Path::new("/srv/modules/sales/schema.json")), "sales");
        assert_eq!(
            module_name(root, Path::new("/srv/modules/sales/returns/schema.json")),
            "sales/returns"
        );
        assert_eq!(module_name(root, Path::new("/srv/modules/schema.json")), ".");
    }
}
