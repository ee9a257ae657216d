// -
// Database namespaces

/// Sled database tree namespaces
pub(crate) const VOLUME_TREE: &str = "_volume_records";
pub(crate) const LEASE_TREE: &str = "_volume_leases";
pub(crate) const RECEIPT_TREE: &str = "_operation_receipts";

/// Record change broadcast channel capacity
pub(crate) const RECORD_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Lease mode labels used in errors and metrics
pub(crate) const EXCLUSIVE: &str = "exclusive";
pub(crate) const SHARED: &str = "shared";
