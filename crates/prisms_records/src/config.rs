//! Configuration for record keepers.
//!
//! This module provides the [`KeeperConfig`] struct which is resolved once
//! when a keeper is constructed and held by value for its lifetime. It is
//! persisted as TOML.
//!
//! # Key Configuration Fields
//!
//! - `namespace`: isolates one logical dataset inside a shared store
//! - `center_id`: this replica's center ID (auto-assigned when absent)
//! - `installation`: deployment identifier used to detect a copied database
//! - `local_priority`: tie-breaker between descriptors of the same center
//! - `retention`: initial auto-purge settings
//!
//! # Example
//!
//! ```ignore
//! use prisms_records::config::KeeperConfig;
//!
//! let config = KeeperConfig::from_toml_str(r#"
//!     namespace = "clinic"
//!     center_id = 12
//!
//!     [retention]
//!     max_entry_count = 10000
//! "#)?;
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RecordError, Result};
use crate::records::{AutoPurger, RecordType, TypeRegistry};

fn default_max_sync_retries() -> u32 {
    3
}

fn default_purge_interval() -> i64 {
    30_000
}

/// Settings for one record keeper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeeperConfig {
    /// Name of the logical dataset this keeper manages
    pub namespace: String,

    /// This replica's center ID. A random one is minted if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center_id: Option<i32>,

    /// Identifier of this deployment. If the stored identifier differs, the
    /// database is treated as copied from another machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation: Option<String>,

    /// Synchronization priority of this replica
    #[serde(default)]
    pub local_priority: i32,

    /// How many failed exports of a change to one peer are tolerated before
    /// the in-memory keeper stops holding it back from purge
    #[serde(default = "default_max_sync_retries")]
    pub max_sync_retries: u32,

    /// Minimum time between background purges of the in-memory keeper
    /// (milliseconds)
    #[serde(default = "default_purge_interval")]
    pub purge_interval_millis: i64,

    /// Auto-purge settings seeded into a fresh store
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Initial auto-purge settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_entry_count: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_millis: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_users: Vec<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_types: Vec<RecordTypeName>,
}

/// A record type named by its stored parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordTypeName {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<String>,
    /// +1 created, -1 deleted, 0 modified
    pub additivity: i64,
}

impl KeeperConfig {
    /// A configuration with defaults for everything but the namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            center_id: None,
            installation: None,
            local_priority: 0,
            max_sync_retries: default_max_sync_retries(),
            purge_interval_millis: default_purge_interval(),
            retention: RetentionConfig::default(),
        }
    }

    /// Set the center ID.
    pub fn with_center_id(mut self, center_id: i32) -> Self {
        self.center_id = Some(center_id);
        self
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: KeeperConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Save as TOML, creating parent directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject settings no keeper can run with.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(RecordError::Config("namespace must not be empty".into()));
        }
        if let Some(id) = self.center_id
            && id < 0
        {
            return Err(RecordError::Config(format!(
                "center_id must not be negative, got {}",
                id
            )));
        }
        if self.max_sync_retries == 0 {
            return Err(RecordError::Config(
                "max_sync_retries must be at least 1".into(),
            ));
        }
        if self.purge_interval_millis < 0 {
            return Err(RecordError::Config(
                "purge_interval_millis must not be negative".into(),
            ));
        }
        Ok(())
    }
}

impl RetentionConfig {
    /// Resolve into an [`AutoPurger`], looking excluded types up in
    /// `registry`.
    pub fn to_auto_purger(&self, registry: &TypeRegistry) -> Result<AutoPurger> {
        let excluded_types = self
            .excluded_types
            .iter()
            .map(|name| {
                registry.record_type(&name.subject, name.change.as_deref(), name.additivity)
            })
            .collect::<Result<Vec<RecordType>>>()?;
        Ok(AutoPurger {
            max_entry_count: self.max_entry_count,
            max_age: self.max_age_millis,
            excluded_users: self.excluded_users.clone(),
            excluded_types,
        })
    }

    /// Whether any setting is present.
    pub fn is_empty(&self) -> bool {
        *self == RetentionConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Additivity, CenterChanges, SubjectType};

    #[test]
    fn test_parse_minimal() {
        let config = KeeperConfig::from_toml_str(r#"namespace = "clinic""#).unwrap();
        assert_eq!(config, KeeperConfig::new("clinic"));
        assert_eq!(config.max_sync_retries, 3);
        assert_eq!(config.purge_interval_millis, 30_000);
        assert!(config.retention.is_empty());
    }

    #[test]
    fn test_parse_retention() {
        let config = KeeperConfig::from_toml_str(
            r#"
            namespace = "clinic"
            center_id = 12
            local_priority = 2

            [retention]
            max_entry_count = 5
            excluded_users = [7]

            [[retention.excluded_types]]
            subject = "center"
            change = "name"
            additivity = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.center_id, Some(12));

        let purger = config
            .retention
            .to_auto_purger(&TypeRegistry::new())
            .unwrap();
        assert_eq!(purger.max_entry_count, Some(5));
        assert_eq!(purger.excluded_users, vec![7]);
        assert_eq!(
            purger.excluded_types,
            vec![
                RecordType::new(
                    SubjectType::CENTER,
                    Some(CenterChanges::NAME),
                    Additivity::Modified
                )
                .unwrap()
            ]
        );
    }

    #[test]
    fn test_unknown_excluded_type_is_rejected() {
        let retention = RetentionConfig {
            excluded_types: vec![RecordTypeName {
                subject: "invoice".into(),
                change: None,
                additivity: 1,
            }],
            ..Default::default()
        };
        assert!(matches!(
            retention.to_auto_purger(&TypeRegistry::new()),
            Err(RecordError::UnknownSubjectType(_))
        ));
    }

    #[test]
    fn test_validate() {
        assert!(KeeperConfig::from_toml_str(r#"namespace = " ""#).is_err());
        assert!(KeeperConfig::from_toml_str("namespace = \"a\"\ncenter_id = -1").is_err());
        assert!(
            KeeperConfig::from_toml_str("namespace = \"a\"\nmax_sync_retries = 0").is_err()
        );
        assert!(matches!(
            KeeperConfig::from_toml_str("center_id = 1"),
            Err(RecordError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("keeper.toml");
        let mut config = KeeperConfig::new("clinic").with_center_id(4);
        config.retention.max_age_millis = Some(60_000);
        config.save(&path).unwrap();
        assert_eq!(KeeperConfig::load(&path).unwrap(), config);
    }
}
