//! Node configuration.
//!
//! Deserialized from YAML with per-field defaults, so a minimal file only
//! names the paths it cares about. The storage section is shared with the
//! chunker and blob store via [`fluid_core::StorageConfig`].

use std::path::{Path, PathBuf};

use fluid_core::config::StorageConfig;
use fluid_core::error::{Error, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_FLUSH_DELAY_MS: u64 = 750;
pub const DEFAULT_ANTI_ENTROPY_DELAY_MS: u64 = 1250;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// RNG seed; wall time when absent.
    pub seed: Option<u64>,
    /// Replica name; host name when absent.
    pub name: Option<String>,
    /// Hosts file path.
    pub hosts: PathBuf,
    /// Fstab file path.
    pub fstab: PathBuf,
    /// Milliseconds between flusher ticks.
    pub flush_delay: u64,
    /// Milliseconds between anti-entropy ticks.
    pub anti_entropy_delay: u64,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            seed: None,
            name: None,
            hosts: PathBuf::from("hosts.yml"),
            fstab: PathBuf::from("fstab"),
            flush_delay: DEFAULT_FLUSH_DELAY_MS,
            anti_entropy_delay: DEFAULT_ANTI_ENTROPY_DELAY_MS,
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// KV engine driver; the first available driver when absent.
    pub driver: Option<String>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Directive understood by the tracing env filter. FATAL collapses to
    /// `error`, the most severe level tracing knows.
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&text)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        config.storage.validate()?;
        Ok(config)
    }

    /// The configured seed, or the current wall time.
    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        })
    }

    /// The configured replica name, or the host's.
    pub fn replica_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.flush_delay, 750);
        assert_eq!(config.anti_entropy_delay, 1250);
        assert_eq!(config.storage.block_size, 4096);
        assert_eq!(config.storage.min_block_size, 2048);
        assert_eq!(config.storage.max_block_size, 8192);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn yaml_round_trip_with_partial_file() {
        let yaml = r#"
name: replica-a
flush_delay: 100
storage:
  path: /var/lib/fluid/blobs
  chunking: fixed
  hashing: md5
logging:
  level: DEBUG
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.name.as_deref(), Some("replica-a"));
        assert_eq!(config.flush_delay, 100);
        assert_eq!(config.anti_entropy_delay, 1250);
        assert_eq!(
            config.storage.chunking,
            fluid_core::config::ChunkingMethod::Fixed
        );
        assert_eq!(
            config.storage.hashing,
            fluid_core::signature::HashAlgorithm::Md5
        );
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.level.directive(), "debug");
    }

    #[test]
    fn configured_seed_wins() {
        let config = Config {
            seed: Some(99),
            ..Config::default()
        };
        assert_eq!(config.seed(), 99);
    }
}
