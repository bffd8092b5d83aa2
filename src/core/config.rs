//! `keystone.toml` settings.

use crate::core::error::KeystoneError;
use crate::core::registry::DuplicatePolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "keystone.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub namereg: NameRegConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub journal: JournalConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    /// Name-service key the hub address is published under.
    #[serde(default = "default_publish_as")]
    pub publish_as: String,
    #[serde(default = "default_true")]
    pub publish: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            publish_as: default_publish_as(),
            publish: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NameRegConfig {
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    #[serde(default = "default_fee")]
    pub fee: u64,
}

impl Default for NameRegConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            fee: default_fee(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default)]
    pub on_duplicate: DuplicatePolicy,
    /// Read every registration back through the hub.
    #[serde(default = "default_true")]
    pub verify_registrations: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            on_duplicate: DuplicatePolicy::default(),
            verify_registrations: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct JournalConfig {
    #[serde(default = "default_journal_path")]
    pub path: PathBuf,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: default_journal_path(),
        }
    }
}

fn default_publish_as() -> String {
    "hub".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ttl() -> u64 {
    5000
}

fn default_fee() -> u64 {
    2000
}

fn default_journal_path() -> PathBuf {
    PathBuf::from(".keystone").join("journal.db")
}

/// Load config from `path`, or from `keystone.toml` in the current directory.
/// A missing file means defaults, not an error.
pub fn load_config(path: Option<&Path>) -> Result<BootstrapConfig, KeystoneError> {
    let config_path = match path {
        Some(p) => p.to_path_buf(),
        None => PathBuf::from(CONFIG_FILE_NAME),
    };

    if !config_path.exists() {
        if path.is_some() {
            return Err(KeystoneError::Config(format!(
                "config file {} does not exist",
                config_path.display()
            )));
        }
        return Ok(BootstrapConfig::default());
    }

    let content = fs::read_to_string(&config_path).map_err(KeystoneError::IoError)?;
    toml::from_str(&content)
        .map_err(|e| KeystoneError::Config(format!("{}: {}", config_path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BootstrapConfig::default();
        assert_eq!(config.hub.publish_as, "hub");
        assert!(config.hub.publish);
        assert_eq!(config.namereg.ttl, 5000);
        assert_eq!(config.namereg.fee, 2000);
        assert_eq!(config.registry.on_duplicate, DuplicatePolicy::Reject);
        assert!(config.registry.verify_registrations);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: BootstrapConfig = toml::from_str(
            r#"
            [hub]
            publish_as = "DOUG"

            [registry]
            on_duplicate = "overwrite"
            "#,
        )
        .unwrap();
        assert_eq!(config.hub.publish_as, "DOUG");
        assert!(config.hub.publish);
        assert_eq!(config.registry.on_duplicate, DuplicatePolicy::Overwrite);
        assert!(config.registry.verify_registrations);
        assert_eq!(config.namereg.ttl, 5000);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(toml::from_str::<BootstrapConfig>("[hub]\nname = \"x\"").is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let err = load_config(Some(Path::new("/definitely/not/here/keystone.toml"))).unwrap_err();
        assert!(matches!(err, KeystoneError::Config(_)));
    }
}
