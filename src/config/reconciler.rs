use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Convergence loop parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReconcilerConfig {
    /// Interval between full scans of the volume records (unit: milliseconds)
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    /// A volume sitting in an in-flight state longer than this is
    /// considered stalled and picked up by the scan (unit: milliseconds)
    #[serde(default = "default_staleness_threshold_ms")]
    pub staleness_threshold_ms: u64,

    /// Inconclusive reconcile attempts tolerated per volume before it is
    /// marked Error and surfaced for operator intervention
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}
impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            staleness_threshold_ms: default_staleness_threshold_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}
impl ReconcilerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.scan_interval_ms < 1 {
            return Err(Error::Config(ConfigError::Message(
                "scan_interval_ms must be at least 1ms".into(),
            )));
        }
        if self.staleness_threshold_ms < 1 {
            return Err(Error::Config(ConfigError::Message(
                "staleness_threshold_ms must be at least 1ms".into(),
            )));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config(ConfigError::Message(
                "max_attempts must be greater than 0".into(),
            )));
        }
        Ok(())
    }
}

fn default_scan_interval_ms() -> u64 {
    5_000
}
fn default_staleness_threshold_ms() -> u64 {
    15_000
}
fn default_max_attempts() -> u32 {
    10
}
