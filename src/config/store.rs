use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Record store settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    /// Subdirectory of `data_dir` holding the embedded record database
    #[serde(default = "default_db_subdir")]
    pub db_subdir: String,

    /// Sled page cache size in bytes
    #[serde(default = "default_cache_capacity_bytes")]
    pub cache_capacity_bytes: u64,

    /// How long a deleted volume's tombstone is retained so duplicate
    /// delete requests replay idempotently (unit: milliseconds)
    #[serde(default = "default_tombstone_retention_ms")]
    pub tombstone_retention_ms: u64,
}
impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_subdir: default_db_subdir(),
            cache_capacity_bytes: default_cache_capacity_bytes(),
            tombstone_retention_ms: default_tombstone_retention_ms(),
        }
    }
}
impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tombstone_retention_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "tombstone_retention_ms must be greater than 0".into(),
            )));
        }
        Ok(())
    }
}

fn default_db_subdir() -> String {
    "records".to_string()
}
fn default_cache_capacity_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_tombstone_retention_ms() -> u64 {
    // 10 minutes
    600_000
}
