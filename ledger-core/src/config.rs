//! Configuration for the ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// RocksDB configuration
    #[serde(default)]
    pub rocksdb: RocksDBConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            rocksdb: RocksDBConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// fsync every write batch
    pub sync_writes: bool,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            sync_writes: true,
            enable_statistics: false,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        Ok(config)
    }

    /// Override fields from environment variables
    pub fn apply_env(&mut self) {
        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(sync) = std::env::var("LEDGER_SYNC_WRITES") {
            self.rocksdb.sync_writes = sync != "0" && !sync.eq_ignore_ascii_case("false");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.data_dir, PathBuf::from("./data/ledger"));
        assert!(config.rocksdb.sync_writes);
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/var/lib/ledger"

            [rocksdb]
            write_buffer_size_mb = 32
            max_write_buffer_number = 2
            max_background_jobs = 2
            sync_writes = false
            enable_statistics = true
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/ledger"));
        assert_eq!(config.rocksdb.write_buffer_size_mb, 32);
        assert!(!config.rocksdb.sync_writes);
    }

    #[test]
    fn test_rocksdb_section_optional() {
        let config: Config = toml::from_str(r#"data_dir = "/tmp/x""#).unwrap();
        assert_eq!(config.rocksdb.max_background_jobs, 4);
    }
}
