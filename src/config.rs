//! Runtime configuration.
//!
//! Layered in this order, later layers winning: built-in defaults, an
//! optional TOML file, then `ESCROW_*` environment variables. The binary
//! applies its command-line flags on top.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

pub const ENV_DATA_DIR: &str = "ESCROW_DATA_DIR";
pub const ENV_LOG: &str = "ESCROW_LOG";
pub const ENV_OPERATOR_KEY: &str = "ESCROW_OPERATOR_KEY";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EscrowConfig {
    /// Directory holding the journal, outbox and content store
    pub data_dir: PathBuf,
    /// Journal file, relative to `data_dir` unless absolute
    pub journal_file: PathBuf,
    /// Outbox of pending transfers, relative to `data_dir` unless absolute
    pub outbox_file: PathBuf,
    /// Content store directory, relative to `data_dir` unless absolute
    pub content_dir: PathBuf,
    /// `tracing_subscriber::EnvFilter` directive
    pub log_filter: String,
    /// Hex ed25519 secret used to sign journal entries
    pub operator_key_hex: Option<String>,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            journal_file: PathBuf::from("journal.jsonl"),
            outbox_file: PathBuf::from("payouts.jsonl"),
            content_dir: PathBuf::from("content"),
            log_filter: "info".to_string(),
            operator_key_hex: None,
        }
    }
}

impl EscrowConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Overrides from environment variables:
    /// - ESCROW_DATA_DIR: data directory
    /// - ESCROW_LOG: log filter
    /// - ESCROW_OPERATOR_KEY: operator secret key (hex)
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| env::var(name).ok());
    }

    pub fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(filter) = lookup(ENV_LOG).filter(|v| !v.is_empty()) {
            self.log_filter = filter;
        }
        if let Some(key) = lookup(ENV_OPERATOR_KEY).filter(|v| !v.is_empty()) {
            self.operator_key_hex = Some(key);
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.resolve(&self.journal_file)
    }

    pub fn outbox_path(&self) -> PathBuf {
        self.resolve(&self.outbox_file)
    }

    pub fn content_path(&self) -> PathBuf {
        self.resolve(&self.content_dir)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_resolve_under_data_dir() {
        let config = EscrowConfig::default();
        assert_eq!(config.journal_path(), PathBuf::from("./data/journal.jsonl"));
        assert_eq!(config.outbox_path(), PathBuf::from("./data/payouts.jsonl"));
        assert_eq!(config.content_path(), PathBuf::from("./data/content"));
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn toml_overrides_only_given_fields() {
        let config = EscrowConfig::from_toml_str(
            r#"
            data_dir = "/var/lib/escrow"
            outbox_file = "/srv/rail/outbox.jsonl"
            "#,
        )
        .unwrap();
        assert_eq!(config.journal_path(), PathBuf::from("/var/lib/escrow/journal.jsonl"));
        assert_eq!(config.outbox_path(), PathBuf::from("/srv/rail/outbox.jsonl"));
        assert_eq!(config.log_filter, "info");
        assert!(config.operator_key_hex.is_none());
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(matches!(
            EscrowConfig::from_toml_str("log_filter = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn environment_wins_over_file() {
        let mut config = EscrowConfig::from_toml_str("log_filter = \"warn\"").unwrap();
        let vars: HashMap<&str, &str> = [
            (ENV_DATA_DIR, "/tmp/escrow"),
            (ENV_LOG, "debug"),
            (ENV_OPERATOR_KEY, ""),
        ]
        .into_iter()
        .collect();
        config.apply_vars(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/escrow"));
        assert_eq!(config.log_filter, "debug");
        assert!(config.operator_key_hex.is_none());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("escrow.toml");
        fs::write(&path, "journal_file = \"ops.jsonl\"\n").unwrap();
        let config = EscrowConfig::load(Some(&path)).unwrap();
        assert_eq!(config.journal_file, PathBuf::from("ops.jsonl"));

        let missing = EscrowConfig::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
