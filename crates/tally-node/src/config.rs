//! Node configuration.

use crate::observability::LogFormat;
use crate::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tally_identity::KeyPair;
use tally_session::SessionConfig;
use tally_types::PartyName;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration for a Tally node, usually loaded from YAML.
///
/// ```yaml
/// legal_name: "O=Bank A,L=London,C=GB"
/// notary: false
/// data_dir: ./data
/// log_level: info
/// log_format: json
/// session:
///   receive_timeout: 30000
///   retry:
///     max_attempts: 5
/// storage:
///   backend: rocksdb
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Legal name of the node's well-known identity.
    pub legal_name: String,
    /// Ed25519 secret of the legal key (hex). A fresh key is generated if absent.
    pub private_key: Option<String>,
    /// Whether this node hosts the uniqueness provider.
    pub notary: bool,
    /// Data directory.
    pub data_dir: PathBuf,
    /// Log level.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Session timeouts and retry budget.
    pub session: SessionConfig,
    /// Storage backend.
    pub storage: StorageConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            legal_name: "O=Tally Node,L=London,C=GB".to_string(),
            private_key: None,
            notary: false,
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            session: SessionConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Which backend holds records, checkpoints and the commitment table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Volatile in-process maps.
    #[default]
    Memory,
    /// RocksDB; requires the `rocksdb-backend` feature.
    Rocksdb,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend.
    pub backend: StorageBackend,
    /// Database directory. Defaults to `<data_dir>/db`.
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolves the database directory against the node's data directory.
    pub fn db_path(&self, data_dir: &Path) -> PathBuf {
        self.path.clone().unwrap_or_else(|| data_dir.join("db"))
    }
}

impl NodeConfig {
    /// Parses and validates a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&yaml)?;
        tracing::debug!(path = %path.display(), party = %config.legal_name, "Loaded node configuration");
        Ok(config)
    }

    /// Checks every field that can be checked without touching the disk.
    pub fn validate(&self) -> Result<()> {
        self.party_name()?;
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(NodeError::Config(format!(
                "unknown log level {:?}",
                self.log_level
            )));
        }
        if self.session.receive_timeout.is_zero() {
            return Err(NodeError::Config(
                "session.receive_timeout must be positive".into(),
            ));
        }
        if self.session.retry.max_attempts == 0 {
            return Err(NodeError::Config(
                "session.retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.session.retry.initial_delay > self.session.retry.max_delay {
            return Err(NodeError::Config(
                "session.retry.initial_delay exceeds max_delay".into(),
            ));
        }
        if let Some(secret) = &self.private_key {
            KeyPair::from_secret_hex(secret)
                .map_err(|e| NodeError::Config(format!("private_key: {}", e)))?;
        }
        if self.storage.backend == StorageBackend::Rocksdb && !cfg!(feature = "rocksdb-backend") {
            return Err(NodeError::Config(
                "rocksdb storage requires the rocksdb-backend feature".into(),
            ));
        }
        Ok(())
    }

    /// The validated legal name.
    pub fn party_name(&self) -> Result<PartyName> {
        PartyName::new(self.legal_name.clone())
            .map_err(|e| NodeError::Config(format!("legal_name: {}", e)))
    }

    /// The configured legal key, or a fresh one.
    pub fn legal_key(&self) -> Result<KeyPair> {
        match &self.private_key {
            Some(secret) => Ok(KeyPair::from_secret_hex(secret)?),
            None => Ok(KeyPair::generate()),
        }
    }

    /// A default configuration for `legal_name`.
    pub fn for_party(legal_name: impl Into<String>) -> Self {
        Self {
            legal_name: legal_name.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_is_valid() {
        NodeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_parse_yaml() {
        let config = NodeConfig::from_yaml(
            r#"
legal_name: "O=Notary Service,L=Zurich,C=CH"
notary: true
log_level: debug
log_format: json
session:
  receive_timeout: 1500
  retry:
    max_attempts: 3
    initial_delay: 50
"#,
        )
        .unwrap();

        assert!(config.notary);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.session.receive_timeout, Duration::from_millis(1500));
        assert_eq!(config.session.retry.max_attempts, 3);
        assert_eq!(config.session.retry.initial_delay, Duration::from_millis(50));
        // Unset retry fields keep their defaults.
        assert_eq!(config.session.retry.max_delay, Duration::from_secs(5));
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.party_name().unwrap().organisation(), "Notary Service");
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad = [
            "legal_name: \"\"",
            "log_level: loud",
            "session:\n  receive_timeout: 0",
            "session:\n  retry:\n    max_attempts: 0",
            "private_key: zz",
        ];
        for yaml in bad {
            assert!(
                matches!(NodeConfig::from_yaml(yaml), Err(NodeError::Config(_))),
                "accepted {:?}",
                yaml
            );
        }
        assert!(matches!(
            NodeConfig::from_yaml("notary: [1"),
            Err(NodeError::Yaml(_))
        ));
    }

    #[test]
    fn test_configured_key_is_stable() {
        let key = KeyPair::generate();
        let config = NodeConfig {
            private_key: Some(hex::encode(key.secret_bytes())),
            ..NodeConfig::for_party("O=Alice")
        };
        config.validate().unwrap();
        assert_eq!(config.legal_key().unwrap().public_key(), key.public_key());
    }

    #[test]
    fn test_db_path_defaults_under_data_dir() {
        let storage = StorageConfig::default();
        assert_eq!(
            storage.db_path(Path::new("/var/tally")),
            PathBuf::from("/var/tally/db")
        );
        let explicit = StorageConfig {
            backend: StorageBackend::Rocksdb,
            path: Some(PathBuf::from("/mnt/db")),
        };
        assert_eq!(explicit.db_path(Path::new("/var/tally")), PathBuf::from("/mnt/db"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        std::fs::write(&path, "legal_name: \"O=Bob\"\n").unwrap();
        assert_eq!(NodeConfig::load(&path).unwrap().legal_name, "O=Bob");
        assert!(matches!(
            NodeConfig::load(dir.path().join("missing.yaml")),
            Err(NodeError::Io(_))
        ));
    }
}
