//! Operator configuration, loaded once at startup and passed by reference to
//! every component that needs it.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{info, warn};

use crate::util::errors::{Error, Result, StdError};

/// Version stamped onto resources this operator creates and compared against
/// the version recorded on incoming upgrade tasks.
pub const OPERATOR_VERSION: &str = "1.2.0";

/// Where the mounted ConfigMap lands unless OPERATOR_CONFIG says otherwise.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pg-operator/config.yaml";

/// A named storage class/size/access-mode bundle clusters reference by name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub access_mode: String,
    pub size: String,
    pub storage_class: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            access_mode: "ReadWriteOnce".to_string(),
            size: "1Gi".to_string(),
            storage_class: None,
        }
    }
}

/// Memory requests substituted when a cluster spec leaves them empty.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResourceDefaults {
    pub instance_memory: String,
    pub backrest_memory: String,
    pub pgadmin_memory: String,
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            instance_memory: "512Mi".to_string(),
            backrest_memory: "48Mi".to_string(),
            pgadmin_memory: "128Mi".to_string(),
        }
    }
}

/// Operator-level fallbacks for repository backends. A cluster that enables
/// `s3` or `gcs` without filling in its own values inherits these.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackrestDefaults {
    pub s3_bucket: String,
    pub s3_endpoint: String,
    pub s3_region: String,
    pub gcs_bucket: String,
}

/// Which operator versions may submit upgrade tasks. The recorded version on
/// the task must match `required_major` exactly and be at least
/// `minimum_minor`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct UpgradePolicy {
    pub required_major: u32,
    pub minimum_minor: u32,
}

impl Default for UpgradePolicy {
    fn default() -> Self {
        Self {
            required_major: 1,
            minimum_minor: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Registry prefix for every image this operator runs
    pub image_prefix: String,
    /// Named storage configurations cluster specs may reference
    pub storage: BTreeMap<String, StorageConfig>,
    /// Storage name used for primary data volumes when a spec names none
    pub primary_storage: String,
    /// Storage name used for replica data volumes when a spec names none
    pub replica_storage: String,
    /// Storage name used for backup repository volumes when a spec names none
    pub backrest_storage: String,
    /// Storage name used for WAL volumes when a spec names none
    pub wal_storage: String,

    pub resources: ResourceDefaults,
    pub backrest: BackrestDefaults,
    pub upgrade: UpgradePolicy,

    /// Upper bound on concurrent per-instance disk usage probes
    pub df_concurrency: usize,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        let mut storage = BTreeMap::new();
        storage.insert("default".to_string(), StorageConfig::default());
        Self {
            image_prefix: "registry.solidbase.dev".to_string(),
            storage,
            primary_storage: "default".to_string(),
            replica_storage: "default".to_string(),
            backrest_storage: "default".to_string(),
            wal_storage: "default".to_string(),
            resources: ResourceDefaults::default(),
            backrest: BackrestDefaults::default(),
            upgrade: UpgradePolicy::default(),
            df_concurrency: 8,
        }
    }
}

impl OperatorConfig {
    /// Loads configuration: built-in defaults, overlaid by the YAML file at
    /// OPERATOR_CONFIG (or the default mount path) when present, then the
    /// DF_CONCURRENCY override.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("OPERATOR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => Self::from_yaml(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no operator config at {path}, using built-in defaults");
                Self::default()
            }
            Err(e) => {
                return Err(Error::StdError(StdError::Config(format!(
                    "reading {path}: {e}"
                ))))
            }
        };

        if let Ok(raw) = std::env::var("DF_CONCURRENCY") {
            config.df_concurrency = raw.parse().map_err(|_| {
                Error::StdError(StdError::Config(
                    "DF_CONCURRENCY must be a positive integer".to_string(),
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| Error::StdError(StdError::Config(format!("parsing operator config: {e}"))))
    }

    pub fn storage_config(&self, name: &str) -> Option<&StorageConfig> {
        self.storage.get(name)
    }

    /// Checks the storage role names resolve. Primary and replica must name
    /// existing entries; WAL and backup repository fall back to primary.
    fn validate(&mut self) -> Result<()> {
        let primary = self
            .storage
            .get(&self.primary_storage)
            .cloned()
            .ok_or_else(|| {
                Error::StdError(StdError::Config(format!(
                    "primary_storage {:?} does not name a storage entry",
                    self.primary_storage
                )))
            })?;

        if !self.storage.contains_key(&self.replica_storage) {
            return Err(Error::StdError(StdError::Config(format!(
                "replica_storage {:?} does not name a storage entry",
                self.replica_storage
            ))));
        }

        for role in [&self.wal_storage, &self.backrest_storage] {
            if !self.storage.contains_key(role) {
                warn!("storage entry {role:?} not set, falling back to primary storage");
                self.storage.insert(role.clone(), primary.clone());
            }
        }

        if self.df_concurrency == 0 {
            return Err(Error::StdError(StdError::Config(
                "df_concurrency must be at least 1".to_string(),
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_defaults_validate() {
        let mut config = OperatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.df_concurrency, 8);
        assert_eq!(config.upgrade.required_major, 1);
        assert_eq!(config.resources.instance_memory, "512Mi");
        assert!(config.storage_config("default").is_some());
    }

    #[test]
    fn partial_yaml_keeps_default_for_missing_sections() {
        let raw = r#"
df_concurrency: 3
upgrade:
  required_major: 4
"#;
        let config = OperatorConfig::from_yaml(raw).unwrap();
        assert_eq!(config.df_concurrency, 3);
        assert_eq!(config.upgrade.required_major, 4);
        assert_eq!(config.upgrade.minimum_minor, 1);
        assert_eq!(config.resources.backrest_memory, "48Mi");
    }

    #[test]
    fn wal_and_backrest_roles_fall_back_to_primary() {
        let raw = r#"
storage:
  fast:
    size: 10Gi
    storage_class: ssd
primary_storage: fast
replica_storage: fast
backrest_storage: bulk
wal_storage: journal
"#;
        let mut config = OperatorConfig::from_yaml(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.storage["bulk"], config.storage["fast"]);
        assert_eq!(config.storage["journal"], config.storage["fast"]);
    }

    #[test]
    fn unknown_primary_storage_is_rejected() {
        let raw = r#"
primary_storage: missing
"#;
        let mut config = OperatorConfig::from_yaml(raw).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("primary_storage"));
    }

    #[test]
    fn zero_probe_concurrency_is_rejected() {
        let mut config = OperatorConfig::default();
        config.df_concurrency = 0;
        assert!(config.validate().is_err());
    }
}
