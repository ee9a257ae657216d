use std::path::PathBuf;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Block-storage backend settings.
///
/// The coordinator drives the SAN tooling through an operator-supplied
/// helper binary; LVM/iSCSI/NVMe-oF specifics stay behind that narrow
/// command interface.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackendConfig {
    /// Path of the helper binary executed for every backend command
    #[serde(default = "default_helper_path")]
    pub helper_path: PathBuf,

    /// Deadline for a single backend command (unit: milliseconds).
    /// An elapsed deadline yields an Unknown outcome, never a failure.
    #[serde(default = "default_command_deadline_ms")]
    pub command_deadline_ms: u64,

    /// Whether the backend supports snapshotting an in-use volume.
    /// Overridden by the capability report of the helper when present.
    #[serde(default = "default_online_snapshot")]
    pub online_snapshot: bool,
}
impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            helper_path: default_helper_path(),
            command_deadline_ms: default_command_deadline_ms(),
            online_snapshot: default_online_snapshot(),
        }
    }
}
impl BackendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.helper_path.as_os_str().is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "helper_path cannot be empty".into(),
            )));
        }
        if self.command_deadline_ms < 1 {
            return Err(Error::Config(ConfigError::Message(
                "command_deadline_ms must be at least 1ms".into(),
            )));
        }
        Ok(())
    }
}

fn default_helper_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/sanvol-helper")
}
fn default_command_deadline_ms() -> u64 {
    30_000
}
fn default_online_snapshot() -> bool {
    false
}
