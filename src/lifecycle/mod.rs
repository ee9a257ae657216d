//! Per-volume lifecycle state machine.
//!
//! Drives Create, Publish, Stage, InUse, Unstage, Unpublish, Delete and
//! the Resize/Snapshot side-transitions. Every transition re-reads the
//! record, validates legality, does its lease work, touches the backend
//! only with a confirmed fencing token, and commits through a generation
//! compare-and-swap with a bounded retry on conflict.

mod volume_lifecycle;

#[cfg(test)]
mod volume_lifecycle_test;

pub use volume_lifecycle::*;
