//! A builder pattern implementation for constructing a [`Coordinator`]
//! instance.
//!
//! The [`CoordinatorBuilder`] provides a fluent interface to configure
//! and assemble the coordinator's components: record store, backend
//! executor, lock manager, lifecycle state machine and reconciler.
//!
//! ## Key Design Points
//! - **Default Components**: `new()` initializes production defaults (sled-backed record store,
//!   helper-binary command backend).
//! - **Customization**: `with_components()` accepts any store/backend pair, which is how tests and
//!   embedded deployments wire the in-memory adapters.
//! - **Lifecycle Management**:
//!   - `build()`: wires the components together.
//!   - `start_metrics_server()`: launches the Prometheus endpoint.
//!   - `ready()`: finalizes construction and returns the coordinator.
//!
//! ## Notes
//! - **Thread Safety**: All components are wrapped in `Arc` for shared ownership.
//! - **Resource Cleanup**: Uses `watch::Receiver` for cooperative shutdown signaling.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::sync::Mutex;
use tracing::info;

use crate::init_record_db;
use crate::metrics;
use crate::BackendExecutor;
use crate::CommandBackend;
use crate::Coordinator;
use crate::LockManager;
use crate::Reconciler;
use crate::RecordStore;
use crate::Result;
use crate::Settings;
use crate::SledRecordStore;
use crate::SystemError;
use crate::VolumeLifecycle;

/// Builder pattern implementation for constructing a coordinator with
/// configurable components.
pub struct CoordinatorBuilder<R, B>
where
    R: RecordStore,
    B: BackendExecutor,
{
    pub(super) settings: Settings,
    pub(super) store: Arc<R>,
    pub(super) backend: Arc<B>,
    pub(super) shutdown_signal: watch::Receiver<()>,

    pub(super) coordinator: Option<Arc<Coordinator<R, B>>>,
}

impl CoordinatorBuilder<SledRecordStore, CommandBackend> {
    /// Creates a builder with the production defaults: a sled record
    /// store under the configured data directory and the helper-binary
    /// backend.
    ///
    /// # Arguments
    /// * `settings` - Validated coordinator configuration
    /// * `shutdown_signal` - Watch channel for graceful shutdown signaling
    pub fn new(
        settings: Settings,
        shutdown_signal: watch::Receiver<()>,
    ) -> Result<Self> {
        let db_path = settings.cluster.data_dir.join(&settings.store.db_subdir);
        let db = init_record_db(db_path, settings.store.cache_capacity_bytes)
            .map_err(|e| SystemError::StartupFailed(format!("open record db: {}", e)))?;
        let store = Arc::new(SledRecordStore::new(Arc::new(db))?);
        let backend = Arc::new(CommandBackend::new(
            settings.backend.clone(),
            settings.retry.backend,
        ));

        Ok(Self::with_components(settings, store, backend, shutdown_signal))
    }
}

impl<R, B> CoordinatorBuilder<R, B>
where
    R: RecordStore,
    B: BackendExecutor,
{
    /// Constructs a builder from pre-built components
    pub fn with_components(
        settings: Settings,
        store: Arc<R>,
        backend: Arc<B>,
        shutdown_signal: watch::Receiver<()>,
    ) -> Self {
        Self {
            settings,
            store,
            backend,
            shutdown_signal,
            coordinator: None,
        }
    }

    /// Replaces the entire coordinator configuration
    pub fn settings(
        mut self,
        settings: Settings,
    ) -> Self {
        self.settings = settings;
        self
    }

    /// Finalizes the builder and constructs the coordinator instance:
    /// lock manager, lifecycle state machine and reconciler, all sharing
    /// the store and backend.
    pub fn build(mut self) -> Self {
        let settings = Arc::new(self.settings.clone());

        let lock_manager = Arc::new(LockManager::new(
            self.store.clone(),
            settings.lock.clone(),
        ));
        let lifecycle = Arc::new(VolumeLifecycle::new(
            self.store.clone(),
            self.backend.clone(),
            lock_manager.clone(),
            settings.retry.transition,
        ));
        let reconciler = Reconciler::new(
            self.store.clone(),
            self.backend.clone(),
            lock_manager.clone(),
            settings.reconciler.clone(),
            settings.store.tombstone_retention_ms,
            self.shutdown_signal.clone(),
        );

        let coordinator = Coordinator {
            settings,
            store: self.store.clone(),
            backend: self.backend.clone(),
            lifecycle,
            reconciler: Mutex::new(Some(reconciler)),
            ready: AtomicBool::new(false),
        };

        self.coordinator = Some(Arc::new(coordinator));
        self
    }

    /// Starts the metrics server for monitoring coordinator operations.
    ///
    /// Launches a Prometheus endpoint on the configured port.
    pub fn start_metrics_server(
        self,
        shutdown_signal: watch::Receiver<()>,
    ) -> Self {
        if !self.settings.monitoring.prometheus_enabled {
            return self;
        }
        let port = self.settings.monitoring.prometheus_port;
        info!("starting metrics server on port {}", port);
        tokio::spawn(async move {
            metrics::start_server(port, shutdown_signal).await;
        });
        self
    }

    /// Returns the built coordinator after successful construction.
    ///
    /// # Errors
    /// Returns a startup error if `build()` has not completed
    pub fn ready(self) -> Result<Arc<Coordinator<R, B>>> {
        self.coordinator
            .ok_or_else(|| SystemError::StartupFailed("check coordinator ready failed".to_string()).into())
    }
}
