//! Repository configuration
//!
//! [`RepositoryConfig`] selects the cache variant and the load tuning used by
//! a [`Repository`](crate::repository::Repository). It round-trips through
//! JSON so deployments can keep it next to their data.
//!
//! ```rust
//! use revstore::config::{CacheMode, RepositoryConfig};
//!
//! let config = RepositoryConfig::from_json_str(r#"{ "cache_mode": "current", "prefetch_depth": 2 }"#).unwrap();
//! assert_eq!(config.cache_mode, CacheMode::Current);
//! assert_eq!(config.prefetch_depth, 2);
//! assert_eq!(config.reference_chunk, 0);
//! ```

use crate::error::{Result, RevStoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

pub use crate::cache::CacheMode;

/// Default number of cached ids
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Configuration for a repository instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Repository name used in logs
    pub name: String,
    /// Cache variant
    pub cache_mode: CacheMode,
    /// Maximum number of cached ids (0 = cache nothing)
    pub cache_capacity: usize,
    /// Entries followed per reference list when prefetching (0 = all)
    pub reference_chunk: usize,
    /// Reference levels loaded together with a requested revision
    pub prefetch_depth: usize,
    /// Threads used for batch loads
    pub load_workers: usize,
    /// Revisions per storage call when writing commits
    pub commit_chunk_size: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            name: "repository".to_string(),
            cache_mode: CacheMode::default(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            reference_chunk: 0,
            prefetch_depth: 0,
            load_workers: num_cpus::get(),
            commit_chunk_size: crate::commit::CommitWriter::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl RepositoryConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize as pretty JSON
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let config = Self::from_json_str(&fs::read_to_string(path)?)?;
        debug!("Loaded config '{}' from {:?}", config.name, path);
        Ok(config)
    }

    /// Write a JSON config file
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    /// Reject settings no repository can run with
    pub fn validate(&self) -> Result<()> {
        if self.load_workers == 0 {
            return Err(RevStoreError::InvalidConfiguration(
                "load_workers must be at least 1".to_string(),
            ));
        }
        if self.commit_chunk_size == 0 {
            return Err(RevStoreError::InvalidConfiguration(
                "commit_chunk_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
