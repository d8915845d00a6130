//! Runtime settings from the environment (`.env` is honored by the binary via dotenvy).

use crate::config::Collation;
use crate::error::ConfigError;
use crate::migration::ReconcileMode;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Settings {
    pub database_url: String,
    /// PostgreSQL schema holding collections and `_sys_collections`. Must be a valid identifier.
    pub schema: String,
    pub modules_path: PathBuf,
    pub max_connections: u32,
    pub mode: ReconcileMode,
    pub collation: Collation,
    pub counters_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_url: "postgres://localhost/provision".into(),
            schema: "public".into(),
            modules_path: PathBuf::from("modules"),
            max_connections: 5,
            mode: ReconcileMode::FailFast,
            collation: Collation::default(),
            counters_path: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut s = Settings::default();
        if let Some(v) = lookup("DATABASE_URL") {
            s.database_url = v;
        }
        if let Some(v) = lookup("PROVISION_SCHEMA") {
            if !is_identifier(&v) {
                return Err(ConfigError::Invalid { key: "PROVISION_SCHEMA", value: v });
            }
            s.schema = v;
        }
        if let Some(v) = lookup("PROVISION_MODULES_PATH") {
            s.modules_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PROVISION_MAX_CONNECTIONS") {
            s.max_connections = match v.parse() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::Invalid { key: "PROVISION_MAX_CONNECTIONS", value: v }),
            };
        }
        if let Some(v) = lookup("PROVISION_MODE") {
            s.mode = v.parse()?;
        }
        if let Some(v) = lookup("PROVISION_COLLATION_LOCALE") {
            s.collation.locale = v;
        }
        if let Some(v) = lookup("PROVISION_COLLATION_STRENGTH") {
            s.collation.strength = match v.parse() {
                Ok(n) if (1..=5).contains(&n) => n,
                _ => return Err(ConfigError::Invalid { key: "PROVISION_COLLATION_STRENGTH", value: v }),
            };
        }
        s.counters_path = lookup("PROVISION_COUNTERS_PATH")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Ok(s)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let s = from(&[]).unwrap();
        assert_eq!(s.schema, "public");
        assert_eq!(s.mode, ReconcileMode::FailFast);
        assert_eq!(s.collation, Collation::default());
        assert!(s.counters_path.is_none());
    }

    #[test]
    fn overrides() {
        let s = from(&[
            ("PROVISION_SCHEMA", "erp"),
            ("PROVISION_MODE", "best-effort"),
            ("PROVISION_COLLATION_STRENGTH", "3"),
            ("PROVISION_COUNTERS_PATH", "seed/counters.json"),
        ])
        .unwrap();
        assert_eq!(s.schema, "erp");
        assert_eq!(s.mode, ReconcileMode::BestEffort);
        assert_eq!(s.collation.strength, 3);
        assert_eq!(s.counters_path, Some(PathBuf::from("seed/counters.json")));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(from(&[("PROVISION_SCHEMA", "bad-name")]).is_err());
        assert!(from(&[("PROVISION_MAX_CONNECTIONS", "0")]).is_err());
        assert!(from(&[("PROVISION_MODE", "sometimes")]).is_err());
        assert!(from(&[("PROVISION_COLLATION_STRENGTH", "9")]).is_err());
    }
}
