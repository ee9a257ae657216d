use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Lease granting parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LockConfig {
    /// Lease lifetime; a holder must renew before expiry or loses the
    /// lease (unit: milliseconds)
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
}
impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: default_lease_ttl_ms(),
        }
    }
}
impl LockConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lease_ttl_ms < 1000 {
            return Err(Error::Config(ConfigError::Message(
                "lease_ttl_ms must be at least 1000ms".into(),
            )));
        }
        Ok(())
    }
}

fn default_lease_ttl_ms() -> u64 {
    // 30 seconds
    30_000
}
