//! The assembled coordinator instance.
//!
//! ## Key Responsibilities
//! - Owns the wired lifecycle, lock manager, record store and backend
//! - Hands out the CSI service logic for the embedding gRPC server
//! - Runs the reconciler loop until shutdown
//!
//! ## Example Usage
//! ```rust,ignore
//! let coordinator = CoordinatorBuilder::new(settings, shutdown_rx)?.build().ready()?;
//! tokio::spawn(async move {
//!     coordinator.run().await.expect("coordinator execution failed");
//! });
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::BackendExecutor;
use crate::CommandBackend;
use crate::CsiService;
use crate::Reconciler;
use crate::RecordStore;
use crate::Result;
use crate::Settings;
use crate::SystemError;
use crate::VolumeLifecycle;

pub struct Coordinator<R, B>
where
    R: RecordStore,
    B: BackendExecutor,
{
    pub(crate) settings: Arc<Settings>,
    pub(crate) store: Arc<R>,
    pub(crate) backend: Arc<B>,
    pub(crate) lifecycle: Arc<VolumeLifecycle<R, B>>,
    // Taken by the first run()
    pub(crate) reconciler: Mutex<Option<Reconciler<R, B>>>,
    pub(crate) ready: AtomicBool,
}

impl<R, B> Coordinator<R, B>
where
    R: RecordStore,
    B: BackendExecutor,
{
    /// The service logic the embedding gRPC server delegates to
    pub fn csi_service(&self) -> CsiService<R, B> {
        CsiService::new(self.lifecycle.clone())
    }

    pub fn lifecycle(&self) -> Arc<VolumeLifecycle<R, B>> {
        self.lifecycle.clone()
    }

    /// Direct record access for inspection tooling; provisioning state
    /// is only ever written through the lifecycle
    pub fn store(&self) -> Arc<R> {
        self.store.clone()
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.clone()
    }

    /// Runs the reconciler loop until the shutdown signal fires
    pub async fn run(&self) -> Result<()> {
        let reconciler = self
            .reconciler
            .lock()
            .await
            .take()
            .ok_or_else(|| SystemError::StartupFailed("coordinator is already running".to_string()))?;

        self.set_ready(true);
        reconciler.run().await
    }

    pub fn set_ready(
        &self,
        is_ready: bool,
    ) {
        self.ready.store(is_ready, Ordering::SeqCst);
    }

    pub fn server_is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

impl<R> Coordinator<R, CommandBackend>
where
    R: RecordStore,
{
    /// Refreshes the cached backend capability report from the helper
    pub async fn probe_backend_capabilities(&self) -> Result<()> {
        self.backend.refresh_capabilities().await
    }
}
