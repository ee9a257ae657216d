//! Block-storage backend command interface.
//!
//! The coordinator never touches LVM/iSCSI/NVMe-oF tooling directly; it
//! issues validated commands through [`BackendExecutor`] and treats the
//! implementation as an external collaborator.

mod command_backend;
mod executor;


pub use command_backend::*;
pub use executor::*;
