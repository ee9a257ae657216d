//! Configuration management module for the volume coordinator.
//!
//! Provides hierarchical configuration loading from multiple sources with priority:
//! 1. Default values (hardcoded)
//! 2. Base config file
//! 3. Explicit config file (`CONFIG_PATH` or argument)
//! 4. Local overrides
//! 5. Environment variables (highest priority)
//!

mod backend;
mod cluster;
mod lock;
mod monitoring;
mod reconciler;
mod retry;
mod store;


pub use backend::*;
pub use cluster::*;
pub use lock::*;
pub use monitoring::*;
pub use reconciler::*;
pub use retry::*;
pub use store::*;

//---
use std::env;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::Result;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    /// Node identity and data directories
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Record store settings
    #[serde(default)]
    pub store: StoreConfig,
    /// Block-storage backend settings
    #[serde(default)]
    pub backend: BackendConfig,
    /// Lease granting parameters
    #[serde(default)]
    pub lock: LockConfig,
    /// Convergence loop parameters
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    /// Retry policies for coordinator operations
    #[serde(default)]
    pub retry: RetryPolicies,
    /// Metrics and monitoring settings
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Settings {
    /// Load configuration from multiple sources with priority:
    /// 1. Base config file
    /// 2. Explicit config file (argument or `CONFIG_PATH`)
    /// 3. Local overrides
    /// 4. Environment variables
    ///
    /// # Arguments
    /// * `config_path` - Optional path to an explicit configuration file
    ///
    /// # Returns
    /// Merged configuration with proper priority ordering
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Config::builder();

        // 1. Base config
        config = config.add_source(File::with_name("config/sanvol").required(false));

        // 2. Explicit config file
        if let Some(path) = config_path {
            config = config.add_source(File::with_name(path).required(true));
        } else if let Ok(path) = env::var("CONFIG_PATH") {
            config = config.add_source(File::with_name(&path).required(true));
        }

        // 3. Local overrides
        config = config.add_source(File::with_name("config/local").required(false));

        // 4. Environment variables (highest priority)
        config = config.add_source(
            Environment::with_prefix("SANVOL")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let settings: Settings = config.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates every configuration section
    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        self.store.validate()?;
        self.backend.validate()?;
        self.lock.validate()?;
        self.reconciler.validate()?;
        self.monitoring.validate()?;
        Ok(())
    }
}
