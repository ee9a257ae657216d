//! Lease management for cross-node volume ownership.
//!
//! Grants exclusive or shared leases with monotonically increasing
//! fencing tokens. Grants ride the record store's generation
//! compare-and-swap, so they linearize with lifecycle transitions.

mod lock_manager;

#[cfg(test)]
mod lock_manager_test;

pub use lock_manager::*;
