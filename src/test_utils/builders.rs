use std::sync::Arc;

use super::FakeBackend;
use crate::BackoffPolicy;
use crate::LockConfig;
use crate::LockManager;
use crate::MemoryRecordStore;
use crate::ReconcilerConfig;
use crate::VolumeLifecycle;

/// A coordinator core wired over the in-memory store and fake backend
pub struct TestHarness {
    pub store: Arc<MemoryRecordStore>,
    pub backend: Arc<FakeBackend>,
    pub lock_manager: Arc<LockManager<MemoryRecordStore>>,
    pub lifecycle: Arc<VolumeLifecycle<MemoryRecordStore, FakeBackend>>,
}

/// Retry policy with delays short enough for tests
pub fn fast_retry() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 5,
        timeout_ms: 5_000,
        base_delay_ms: 1,
        max_delay_ms: 5,
    }
}

/// Reconciler settings that treat everything as immediately stale
pub fn eager_reconciler_config() -> ReconcilerConfig {
    ReconcilerConfig {
        scan_interval_ms: 10,
        staleness_threshold_ms: 0,
        max_attempts: 3,
    }
}

pub fn test_harness() -> TestHarness {
    let store = Arc::new(MemoryRecordStore::new());
    let backend = Arc::new(FakeBackend::new());
    let lock_manager = Arc::new(LockManager::new(store.clone(), LockConfig::default()));
    let lifecycle = Arc::new(VolumeLifecycle::new(
        store.clone(),
        backend.clone(),
        lock_manager.clone(),
        fast_retry(),
    ));
    TestHarness {
        store,
        backend,
        lock_manager,
        lifecycle,
    }
}
