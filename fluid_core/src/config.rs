//! Storage configuration shared by the chunker and the blob store.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::signature::HashAlgorithm;

pub const DEFAULT_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_MIN_BLOCK_SIZE: usize = 2048;
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingMethod {
    Fixed,
    #[default]
    Variable,
}

impl std::str::FromStr for ChunkingMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(ChunkingMethod::Fixed),
            "variable" => Ok(ChunkingMethod::Variable),
            other => Err(Error::Config(format!("unknown chunking method '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Blob storage root directory.
    pub path: PathBuf,
    pub chunking: ChunkingMethod,
    pub block_size: usize,
    pub min_block_size: usize,
    pub max_block_size: usize,
    pub hashing: HashAlgorithm,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            path: PathBuf::new(),
            chunking: ChunkingMethod::default(),
            block_size: DEFAULT_BLOCK_SIZE,
            min_block_size: DEFAULT_MIN_BLOCK_SIZE,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            hashing: HashAlgorithm::default(),
        }
    }
}

impl StorageConfig {
    /// Enforces `0 < min_block_size <= block_size <= max_block_size`.
    pub fn validate(&self) -> Result<()> {
        if self.min_block_size == 0 {
            return Err(Error::Chunking("min_block_size must be positive".into()));
        }
        if self.min_block_size > self.block_size {
            return Err(Error::Chunking(format!(
                "min_block_size {} exceeds block_size {}",
                self.min_block_size, self.block_size
            )));
        }
        if self.block_size > self.max_block_size {
            return Err(Error::Chunking(format!(
                "block_size {} exceeds max_block_size {}",
                self.block_size, self.max_block_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        StorageConfig::default().validate().unwrap();
    }

    #[test]
    fn inverted_bounds_rejected() {
        let config = StorageConfig {
            min_block_size: 8192,
            block_size: 4096,
            ..StorageConfig::default()
        };
        assert!(config.validate().is_err());

        let config = StorageConfig {
            block_size: 1 << 20,
            ..StorageConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_min_rejected() {
        let config = StorageConfig {
            min_block_size: 0,
            ..StorageConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
